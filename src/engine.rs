// src/engine.rs
//
// The conversion engine. One file goes decode -> transform -> size-bounded
// encoder search (tasks.rs); the batch driver runs an ordered list of files
// through that pipeline under one settings snapshot.

pub mod batch;
pub mod common;
pub mod debounce;
pub mod decoder;
pub mod encoder;
pub mod io;
pub mod pipeline;
pub mod pool;
pub mod search;
pub mod tasks;

pub use batch::{
    BatchDriver, BatchObserver, BatchOutcome, BatchState, BatchSummary, ConversionSettings,
    FileId, FileOutcome, FileSnapshot, FileStatus,
};
pub use debounce::Debouncer;
pub use decoder::{decode_image, detect_format};
pub use encoder::{
    embed_icc_jpeg, embed_icc_png, embed_icc_webp, encode_avif, encode_jpeg, encode_png,
    encode_webp, EncodeRequest, ImageEncoder, NativeEncoder, QualitySettings,
};
pub use io::{extract_icc_profile, Source, SourceImage};
pub use pipeline::{apply_transform, contrast_factor, orient, TransformedImage};
pub use search::{
    clamp_quality, plan_attempts, search, AttemptRecord, ConversionResult, PlannedAttempt,
    SearchStep,
};
pub use tasks::ConversionTask;
