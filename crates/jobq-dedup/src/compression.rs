//! LZ4 and Zstd chunk compression with optional trained dictionaries.
//!
//! Every stored blob starts with a 5-byte header: the codec tag followed by
//! the little-endian id of the dictionary it was compressed with (0 for
//! none). Decoding reads the header, so changing codec, level, or dictionary
//! never strands chunks written earlier.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CompressionConfig;

const HEADER_LEN: usize = 5;
const TAG_NONE: u8 = 0;
const TAG_LZ4: u8 = 1;
const TAG_ZSTD: u8 = 2;
// zstd training rejects tiny corpora; below this we fall back to a raw-content dictionary
const MIN_TRAINING_SAMPLES: usize = 16;

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// No compression (passthrough)
    None,
    /// LZ4 block format with prepended size
    Lz4,
    /// Zstandard, with the active dictionary when one is installed
    Zstd {
        /// Compression level (1=fastest, 19=best ratio, 3=balanced default)
        level: i32,
    },
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::Zstd { level: 3 }
    }
}

/// Encode or decode failure. Callers attach chunk context.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(pub String);

impl CodecError {
    fn io(e: std::io::Error) -> Self {
        CodecError(e.to_string())
    }
}

/// Dictionary id: first four bytes of the BLAKE3 hash of its content, never 0.
pub fn dictionary_id(dict: &[u8]) -> u32 {
    let hash = blake3::hash(dict);
    let b = hash.as_bytes();
    match u32::from_le_bytes([b[0], b[1], b[2], b[3]]) {
        0 => 1,
        id => id,
    }
}

/// Codec tag and dictionary id read from a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    /// Algorithm the payload bytes were written with
    pub algorithm: CompressionAlgorithm,
    /// Dictionary id, 0 when none was used
    pub dict_id: u32,
}

impl BlobHeader {
    /// Parse the header of `blob`.
    pub fn parse(blob: &[u8]) -> Result<Self, CodecError> {
        if blob.len() < HEADER_LEN {
            return Err(CodecError(format!(
                "blob of {} bytes is shorter than its header",
                blob.len()
            )));
        }
        let algorithm = match blob[0] {
            TAG_NONE => CompressionAlgorithm::None,
            TAG_LZ4 => CompressionAlgorithm::Lz4,
            // level is not needed to decode
            TAG_ZSTD => CompressionAlgorithm::Zstd { level: 0 },
            tag => return Err(CodecError(format!("unknown codec tag {tag}"))),
        };
        let dict_id = u32::from_le_bytes([blob[1], blob[2], blob[3], blob[4]]);
        Ok(Self { algorithm, dict_id })
    }

    fn write(algorithm: CompressionAlgorithm, dict_id: u32, out: &mut Vec<u8>) {
        out.push(match algorithm {
            CompressionAlgorithm::None => TAG_NONE,
            CompressionAlgorithm::Lz4 => TAG_LZ4,
            CompressionAlgorithm::Zstd { .. } => TAG_ZSTD,
        });
        out.extend_from_slice(&dict_id.to_le_bytes());
    }
}

/// Point-in-time compression statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    /// Blobs written
    pub compressed: u64,
    /// Blobs read
    pub decompressed: u64,
    /// Plaintext bytes passed to `compress`
    pub bytes_in: u64,
    /// Blob bytes produced by `compress`, headers included
    pub bytes_out: u64,
    /// Failed encode or decode calls
    pub failures: u64,
    /// Writes that used a dictionary
    pub dictionary_hits: u64,
}

impl CompressionStats {
    /// `bytes_out / bytes_in`; 1.0 before any data is seen
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        }
    }
}

#[derive(Default)]
struct StatCounters {
    compressed: AtomicU64,
    decompressed: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    failures: AtomicU64,
    dictionary_hits: AtomicU64,
}

/// Bounded FIFO pool of payload samples for dictionary training.
#[derive(Debug)]
pub struct DictionaryBuilder {
    samples: VecDeque<Vec<u8>>,
    total_bytes: usize,
    max_samples: usize,
    max_bytes: usize,
}

impl DictionaryBuilder {
    /// Pool holding at most `max_samples` samples and `max_bytes` bytes.
    pub fn new(max_samples: usize, max_bytes: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            total_bytes: 0,
            max_samples,
            max_bytes,
        }
    }

    /// Add a sample, evicting the oldest while over either cap.
    /// Empty samples and samples larger than the byte cap are ignored.
    pub fn add_sample(&mut self, data: &[u8]) {
        if data.is_empty() || data.len() > self.max_bytes {
            return;
        }
        self.samples.push_back(data.to_vec());
        self.total_bytes += data.len();
        while self.samples.len() > self.max_samples || self.total_bytes > self.max_bytes {
            match self.samples.pop_front() {
                Some(old) => self.total_bytes -= old.len(),
                None => break,
            }
        }
    }

    /// Samples currently pooled
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Bytes currently pooled
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Train a dictionary of at most `max_size` bytes.
    ///
    /// With too few samples, or if training fails, the most recent sample
    /// bytes are used directly as a raw-content dictionary.
    pub fn build(&self, max_size: usize) -> Result<Vec<u8>, CodecError> {
        if self.samples.is_empty() {
            return Err(CodecError("no samples collected".to_string()));
        }
        if self.samples.len() >= MIN_TRAINING_SAMPLES {
            let samples: Vec<&[u8]> = self.samples.iter().map(|s| s.as_slice()).collect();
            match zstd::dict::from_samples(&samples, max_size) {
                Ok(dict) => return Ok(dict),
                Err(e) => debug!(error = %e, "dictionary training failed, using raw content"),
            }
        }

        let mut raw = Vec::with_capacity(max_size.min(self.total_bytes));
        for sample in self.samples.iter().rev() {
            let room = max_size - raw.len();
            if room == 0 {
                break;
            }
            raw.extend_from_slice(&sample[..sample.len().min(room)]);
        }
        Ok(raw)
    }
}

/// Capability interface for chunk codecs.
pub trait Compressor: Send + Sync {
    /// Encode plaintext into a self-describing blob.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    /// Decode a blob produced by `compress`, possibly with an older configuration.
    fn decompress(&self, blob: &[u8]) -> Result<Vec<u8>, CodecError>;
    /// Current statistics.
    fn stats(&self) -> CompressionStats;
}

/// LZ4/Zstd compressor holding every known dictionary and the active one.
pub struct ChunkCompressor {
    algorithm: CompressionAlgorithm,
    use_dictionary: bool,
    dictionary_size: usize,
    dictionaries: RwLock<HashMap<u32, Arc<Vec<u8>>>>,
    active: RwLock<Option<u32>>,
    pool: Mutex<DictionaryBuilder>,
    counters: StatCounters,
}

impl ChunkCompressor {
    /// Build from compression settings.
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            algorithm: config.algorithm(),
            use_dictionary: config.dictionary_active(),
            dictionary_size: config.dictionary_size,
            dictionaries: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            pool: Mutex::new(DictionaryBuilder::new(
                config.max_samples,
                config.max_sample_bytes,
            )),
            counters: StatCounters::default(),
        }
    }

    /// Algorithm used for new blobs
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// True when new blobs may use a dictionary.
    pub fn uses_dictionary(&self) -> bool {
        self.use_dictionary
    }

    /// Register a dictionary for decoding. Returns its id.
    pub fn register_dictionary(&self, dict: Vec<u8>) -> u32 {
        let id = dictionary_id(&dict);
        self.dictionaries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(dict));
        id
    }

    /// Register a dictionary and use it for subsequent writes.
    pub fn install_dictionary(&self, dict: Vec<u8>) -> u32 {
        let id = self.register_dictionary(dict);
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some(id);
        info!(dict_id = id, "compression dictionary installed");
        id
    }

    /// Make an already registered dictionary the active one.
    pub fn activate(&self, id: u32) -> bool {
        let known = self
            .dictionaries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id);
        if known {
            *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some(id);
        }
        known
    }

    /// Id of the dictionary used for new writes.
    pub fn active_dictionary(&self) -> Option<u32> {
        *self.active.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed a payload into the training pool.
    pub fn add_sample(&self, data: &[u8]) {
        if self.use_dictionary {
            self.pool
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .add_sample(data);
        }
    }

    /// Number of pooled samples
    pub fn sample_count(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sample_count()
    }

    /// Train a dictionary from the sample pool. Does not install it.
    pub fn train_dictionary(&self) -> Result<Vec<u8>, CodecError> {
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        let dict = pool.build(self.dictionary_size)?;
        debug!(
            samples = pool.sample_count(),
            size = dict.len(),
            "trained compression dictionary"
        );
        Ok(dict)
    }

    fn dictionary(&self, id: u32) -> Option<Arc<Vec<u8>>> {
        self.dictionaries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(data.len() / 2 + HEADER_LEN);
        match self.algorithm {
            CompressionAlgorithm::None => {
                BlobHeader::write(self.algorithm, 0, &mut out);
                out.extend_from_slice(data);
            }
            CompressionAlgorithm::Lz4 => {
                BlobHeader::write(self.algorithm, 0, &mut out);
                out.extend_from_slice(&lz4_flex::compress_prepend_size(data));
            }
            CompressionAlgorithm::Zstd { level } => {
                let dict = if self.use_dictionary {
                    self.active_dictionary()
                        .and_then(|id| self.dictionary(id).map(|d| (id, d)))
                } else {
                    None
                };
                match dict {
                    Some((id, dict)) => {
                        BlobHeader::write(self.algorithm, id, &mut out);
                        let mut encoder =
                            zstd::stream::write::Encoder::with_dictionary(out, level, &dict)
                                .map_err(CodecError::io)?;
                        encoder.write_all(data).map_err(CodecError::io)?;
                        out = encoder.finish().map_err(CodecError::io)?;
                        self.counters.dictionary_hits.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        BlobHeader::write(self.algorithm, 0, &mut out);
                        out.extend_from_slice(
                            &zstd::encode_all(data, level).map_err(CodecError::io)?,
                        );
                    }
                }
            }
        }
        Ok(out)
    }

    fn decode(&self, blob: &[u8]) -> Result<Vec<u8>, CodecError> {
        let header = BlobHeader::parse(blob)?;
        let body = &blob[HEADER_LEN..];
        match header.algorithm {
            CompressionAlgorithm::None => Ok(body.to_vec()),
            CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(body)
                .map_err(|e| CodecError(e.to_string())),
            CompressionAlgorithm::Zstd { .. } if header.dict_id == 0 => {
                zstd::decode_all(body).map_err(CodecError::io)
            }
            CompressionAlgorithm::Zstd { .. } => {
                let dict = self.dictionary(header.dict_id).ok_or_else(|| {
                    CodecError(format!("unknown dictionary {}", header.dict_id))
                })?;
                let mut decoder = zstd::stream::read::Decoder::with_dictionary(body, &dict)
                    .map_err(CodecError::io)?;
                let mut out = Vec::new();
                decoder.read_to_end(&mut out).map_err(CodecError::io)?;
                Ok(out)
            }
        }
    }
}

impl Compressor for ChunkCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self.encode(data) {
            Ok(blob) => {
                self.counters.compressed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_in
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                self.counters
                    .bytes_out
                    .fetch_add(blob.len() as u64, Ordering::Relaxed);
                Ok(blob)
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn decompress(&self, blob: &[u8]) -> Result<Vec<u8>, CodecError> {
        let result = self.decode(blob);
        match &result {
            Ok(_) => self.counters.decompressed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn stats(&self) -> CompressionStats {
        let c = &self.counters;
        CompressionStats {
            compressed: c.compressed.load(Ordering::Relaxed),
            decompressed: c.decompressed.load(Ordering::Relaxed),
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            dictionary_hits: c.dictionary_hits.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodecKind;
    use proptest::prelude::*;

    fn compressor(codec: CodecKind, enabled: bool) -> ChunkCompressor {
        ChunkCompressor::new(&CompressionConfig {
            enabled,
            codec,
            ..CompressionConfig::default()
        })
    }

    fn json_record(i: usize) -> Vec<u8> {
        format!(
            r#"{{"job_type":"email","queue":"default","attempt":{},"payload":{{"to":"user{}@example.com","template":"welcome"}}}}"#,
            i % 3,
            i
        )
        .into_bytes()
    }

    #[test]
    fn test_default_algorithm_matches_default_config() {
        assert_eq!(CompressionAlgorithm::default(), CompressionAlgorithm::Zstd { level: 3 });
        assert_eq!(
            CompressionConfig::default().algorithm(),
            CompressionAlgorithm::default()
        );
    }

    proptest! {
        #[test]
        fn prop_zstd_roundtrip(data in prop::collection::vec(0u8..=255, 0..50_000)) {
            let c = compressor(CodecKind::Zstd, true);
            let blob = c.compress(&data).unwrap();
            prop_assert_eq!(c.decompress(&blob).unwrap(), data);
        }

        #[test]
        fn prop_lz4_roundtrip(data in prop::collection::vec(0u8..=255, 0..50_000)) {
            let c = compressor(CodecKind::Lz4, true);
            let blob = c.compress(&data).unwrap();
            prop_assert_eq!(c.decompress(&blob).unwrap(), data);
        }
    }

    #[test]
    fn empty_roundtrips_for_every_codec() {
        for c in [
            compressor(CodecKind::Zstd, false),
            compressor(CodecKind::Lz4, true),
            compressor(CodecKind::Zstd, true),
        ] {
            let blob = c.compress(&[]).unwrap();
            assert_eq!(c.decompress(&blob).unwrap(), b"");
        }
    }

    #[test]
    fn header_records_codec() {
        let c = compressor(CodecKind::Lz4, true);
        let blob = c.compress(b"abc").unwrap();
        let header = BlobHeader::parse(&blob).unwrap();
        assert_eq!(header.algorithm, CompressionAlgorithm::Lz4);
        assert_eq!(header.dict_id, 0);

        let passthrough = compressor(CodecKind::Zstd, false).compress(b"abc").unwrap();
        assert_eq!(&passthrough[HEADER_LEN..], b"abc");
    }

    #[test]
    fn decode_reads_header_not_config() {
        let lz4 = compressor(CodecKind::Lz4, true);
        let zstd = compressor(CodecKind::Zstd, true);
        let blob = lz4.compress(b"written under an older configuration").unwrap();
        assert_eq!(
            zstd.decompress(&blob).unwrap(),
            b"written under an older configuration"
        );
    }

    #[test]
    fn corrupt_blob_is_an_error() {
        let c = compressor(CodecKind::Zstd, true);
        assert!(c.decompress(&[]).is_err());
        assert!(c.decompress(&[9, 0, 0, 0, 0]).is_err());
        let mut blob = c.compress(&json_record(1).repeat(20)).unwrap();
        blob.truncate(blob.len() / 2);
        assert!(c.decompress(&blob).is_err());
        assert!(c.stats().failures >= 2);
    }

    #[test]
    fn dictionary_roundtrip_and_switch() {
        let c = compressor(CodecKind::Zstd, true);
        for i in 0..200 {
            c.add_sample(&json_record(i));
        }
        let dict = c.train_dictionary().unwrap();
        let first = c.install_dictionary(dict);
        let old_blob = c.compress(&json_record(1000)).unwrap();
        assert_eq!(BlobHeader::parse(&old_blob).unwrap().dict_id, first);

        let second = c.install_dictionary(b"a different raw content dictionary".to_vec());
        assert_ne!(first, second);
        let new_blob = c.compress(&json_record(1001)).unwrap();

        assert_eq!(c.decompress(&old_blob).unwrap(), json_record(1000));
        assert_eq!(c.decompress(&new_blob).unwrap(), json_record(1001));
        assert!(c.stats().dictionary_hits >= 2);
    }

    #[test]
    fn unknown_dictionary_fails_decode() {
        let writer = compressor(CodecKind::Zstd, true);
        writer.install_dictionary(b"some dictionary content for the writer".to_vec());
        let blob = writer.compress(b"payload").unwrap();

        let reader = compressor(CodecKind::Zstd, true);
        assert!(reader.decompress(&blob).is_err());
    }

    #[test]
    fn builder_enforces_caps_fifo() {
        let mut builder = DictionaryBuilder::new(3, 100);
        for i in 0..5u8 {
            builder.add_sample(&[i; 10]);
        }
        assert_eq!(builder.sample_count(), 3);
        assert_eq!(builder.total_bytes(), 30);

        builder.add_sample(&[9u8; 90]);
        assert!(builder.total_bytes() <= 100);
        builder.add_sample(&[1u8; 101]);
        assert!(builder.total_bytes() <= 100);
    }

    #[test]
    fn builder_falls_back_to_raw_content() {
        let mut builder = DictionaryBuilder::new(10, 1000);
        assert!(builder.build(64).is_err());
        builder.add_sample(b"first sample");
        builder.add_sample(b"second sample");
        let dict = builder.build(64).unwrap();
        assert!(dict.starts_with(b"second sample"));
        assert!(dict.len() <= 64);
    }

    #[test]
    fn stats_track_ratio() {
        let c = compressor(CodecKind::Zstd, true);
        assert_eq!(c.stats().ratio(), 1.0);
        c.compress(&vec![b'x'; 10_000]).unwrap();
        let stats = c.stats();
        assert_eq!(stats.compressed, 1);
        assert_eq!(stats.bytes_in, 10_000);
        assert!(stats.ratio() < 0.1);
    }

    #[test]
    fn dictionary_ids_are_stable() {
        assert_eq!(dictionary_id(b"dict"), dictionary_id(b"dict"));
        assert_ne!(dictionary_id(b"dict"), 0);
    }
}
