// lib.rs
//
// lean-image: size-bounded batch image transcoding.
//
// Every file goes decode -> transform -> encoder search. The search walks a
// fixed fallback chain (lower quality, other formats, smaller renders) until
// an output is smaller than the input, and otherwise returns the smallest
// output it saw with `improved == false`.

// jemalloc is not supported on Windows/MSVC
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod codecs;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod naming;
pub mod ops;

pub use config::{Concurrency, EngineConfig, MAX_DIMENSION, MAX_PIXELS};
pub use engine::{
    BatchDriver, BatchObserver, BatchOutcome, BatchState, BatchSummary, ConversionResult,
    ConversionSettings, ConversionTask, FileId, FileOutcome, FileSnapshot, FileStatus,
    ImageEncoder, NativeEncoder, SearchStep, SourceImage,
};
pub use error::{ErrorCategory, LeanImageError, Result};
pub use history::{HistoryEntry, HistoryLog};
pub use naming::output_filename;
pub use ops::{
    AspectAnchor, CropSettings, EncodeSettings, FilterSettings, FlipSettings, OutputFormat,
    PresetConfig, ResizeMode, ResizeSettings, Rotation, TransformSettings,
};

/// Metrics payload version
pub const PROCESSING_METRICS_VERSION: &str = "1.0.0";

/// Per-file stage timings and sizes.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessingMetrics {
    /// Schema version for compatibility negotiation
    pub version: String,
    pub decode_ms: f64,
    pub transform_ms: f64,
    /// All encode attempts together
    pub encode_ms: f64,
    pub total_ms: f64,
    /// Peak RSS in bytes.
    ///
    /// Taken from `ru_maxrss`, so it is the process-wide peak, not this
    /// file's. Estimated from the output size where getrusage is missing.
    pub peak_rss: u64,
    /// User + system CPU seconds
    pub cpu_time: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// bytes_out / bytes_in
    pub compression_ratio: f64,
    pub attempts: usize,
    /// Detected input format (lowercase: jpeg, png, webp, ...)
    pub format_in: Option<String>,
    pub format_out: String,
    pub icc_preserved: bool,
}

impl Default for ProcessingMetrics {
    fn default() -> Self {
        Self {
            version: PROCESSING_METRICS_VERSION.to_string(),
            decode_ms: 0.0,
            transform_ms: 0.0,
            encode_ms: 0.0,
            total_ms: 0.0,
            peak_rss: 0,
            cpu_time: 0.0,
            bytes_in: 0,
            bytes_out: 0,
            compression_ratio: 0.0,
            attempts: 0,
            format_in: None,
            format_out: String::new(),
            icc_preserved: false,
        }
    }
}

/// Convert one in-memory image with the default engine limits and the
/// built-in codecs.
pub fn convert_bytes(
    name: &str,
    bytes: Vec<u8>,
    declared_format: Option<&str>,
    transform: &TransformSettings,
    encode: &EncodeSettings,
) -> Result<ConversionResult> {
    let source = SourceImage::from_bytes(name, bytes, declared_format);
    let config = EngineConfig::default();
    ConversionTask::new(&source, transform, encode, &config).run(&NativeEncoder)
}
