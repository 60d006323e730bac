//! Background maintenance for the deduplication engine.
//! Handles:
//! - Periodic garbage collection
//! - Periodic statistics refresh
//! - Optional periodic reference audits
//! - On-demand runs of any of the above
//!
//! Each periodic loop is an independent task; all of them observe one
//! shutdown signal and are joined by [`BackgroundHandle::shutdown`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{DedupError, Result};
use crate::manager::DedupManager;

const CHANNEL_CAPACITY: usize = 16;

/// On-demand work for the background processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundTask {
    /// Run a GC cycle now.
    RunGc,
    /// Run a reference audit now.
    RunAudit,
    /// Recompute statistics now.
    RefreshStats,
}

/// Statistics tracked by the background processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundStats {
    /// GC cycles completed
    pub gc_cycles: u64,
    /// Chunks deleted across all cycles
    pub chunks_reclaimed: u64,
    /// Audits completed
    pub audits: u64,
    /// Reference counts repaired or removed across all audits
    pub references_repaired: u64,
    /// Statistics refreshes completed
    pub stats_refreshes: u64,
    /// Runs that failed
    pub errors: u64,
}

/// Handle to the background tasks for sending work, reading stats, and shutting down.
pub struct BackgroundHandle {
    sender: mpsc::Sender<BackgroundTask>,
    stats: watch::Receiver<BackgroundStats>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundHandle {
    /// Queue a task. Fails if the processor has shut down.
    pub async fn send(&self, task: BackgroundTask) -> Result<()> {
        self.sender
            .send(task)
            .await
            .map_err(|_| DedupError::ShutDown)
    }

    /// Get a snapshot of current stats.
    pub fn stats(&self) -> BackgroundStats {
        self.stats.borrow().clone()
    }

    /// Receiver notified after every completed run.
    pub fn subscribe(&self) -> watch::Receiver<BackgroundStats> {
        self.stats.clone()
    }

    /// Check if any background task is still running.
    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Signal shutdown and wait up to `deadline` for in-flight runs to
    /// finish; abort the stragglers otherwise. Returns true on a clean stop.
    pub async fn shutdown(mut self, deadline: Duration) -> bool {
        let _ = self.shutdown.send(true);
        let joined = tokio::time::timeout(deadline, join_all(self.handles.iter_mut())).await;
        match joined {
            Ok(_) => {
                info!(tasks = self.handles.len(), "background tasks stopped");
                true
            }
            Err(_) => {
                let stragglers = self.handles.iter().filter(|h| !h.is_finished()).count();
                warn!(?deadline, stragglers, "background tasks did not stop in time, aborting");
                for handle in &self.handles {
                    handle.abort();
                }
                false
            }
        }
    }
}

/// Runs GC, audits, and statistics refreshes, each loop as its own task.
#[derive(Clone)]
pub struct BackgroundProcessor {
    manager: Arc<DedupManager>,
    stats: Arc<watch::Sender<BackgroundStats>>,
}

impl BackgroundProcessor {
    /// Spawn the periodic loops enabled by the manager's configuration plus
    /// a task serving on-demand requests. Returns a BackgroundHandle for
    /// submitting tasks.
    pub fn start(manager: Arc<DedupManager>) -> BackgroundHandle {
        let (task_tx, task_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (stats_tx, stats_rx) = watch::channel(BackgroundStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let config = manager.config().clone();
        let processor = BackgroundProcessor {
            manager,
            stats: Arc::new(stats_tx),
        };

        let mut handles = Vec::with_capacity(4);
        if config.gc.enabled {
            handles.push(tokio::spawn(processor.clone().periodic(
                BackgroundTask::RunGc,
                config.gc.interval(),
                shutdown_rx.clone(),
            )));
        }
        handles.push(tokio::spawn(processor.clone().periodic(
            BackgroundTask::RefreshStats,
            config.stats_interval(),
            shutdown_rx.clone(),
        )));
        if let Some(period) = config.audit_interval() {
            handles.push(tokio::spawn(processor.clone().periodic(
                BackgroundTask::RunAudit,
                period,
                shutdown_rx.clone(),
            )));
        }
        handles.push(tokio::spawn(processor.serve(task_rx, shutdown_rx)));
        debug!(
            tasks = handles.len(),
            gc = config.gc.enabled,
            audit = config.audit_interval_secs.is_some(),
            "background tasks started"
        );

        BackgroundHandle {
            sender: task_tx,
            stats: stats_rx,
            shutdown: shutdown_tx,
            handles,
        }
    }

    async fn periodic(self, task: BackgroundTask, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut timer = ticker(period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = timer.tick() => self.execute(task).await,
            }
        }
        debug!(?task, "background loop stopped");
    }

    async fn serve(self, mut rx: mpsc::Receiver<BackgroundTask>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                task = rx.recv() => match task {
                    Some(task) => self.execute(task).await,
                    None => break,
                },
            }
        }
    }

    async fn execute(&self, task: BackgroundTask) {
        match task {
            BackgroundTask::RunGc => match self.manager.run_garbage_collection().await {
                Ok(report) => self.stats.send_modify(|s| {
                    s.gc_cycles += 1;
                    s.chunks_reclaimed += report.chunks_deleted as u64;
                }),
                Err(DedupError::GcInProgress) => debug!("skipping gc run, cycle already in progress"),
                Err(e) => self.failed(task, e),
            },
            BackgroundTask::RunAudit => match self.manager.audit_references().await {
                Ok(report) => self.stats.send_modify(|s| {
                    s.audits += 1;
                    s.references_repaired += (report.counts_repaired + report.entries_removed) as u64;
                }),
                Err(e) => self.failed(task, e),
            },
            BackgroundTask::RefreshStats => match self.manager.refresh_stats().await {
                Ok(stats) => {
                    debug!(
                        payloads = stats.total_payloads,
                        unique_chunks = stats.unique_chunks,
                        dedup_ratio = stats.dedup_ratio,
                        "dedup statistics"
                    );
                    self.stats.send_modify(|s| s.stats_refreshes += 1);
                }
                Err(e) => self.failed(task, e),
            },
        }
    }

    fn failed(&self, task: BackgroundTask, e: DedupError) {
        error!(?task, error = %e, "background run failed");
        self.stats.send_modify(|s| s.errors += 1);
    }
}

/// Interval whose first tick is one period out; late ticks are skipped.
fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
