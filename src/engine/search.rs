// src/engine/search.rs
//
// Size-bounded encoder search.
//
// A fixed chain of encode attempts, each rendered from the transformed bitmap
// at its own dimensions. The first attempt strictly smaller than the original
// wins; otherwise the smallest attempt that produced bytes is returned with
// `improved = false`. No bytes at all is `EncodeExhausted`.

use crate::config::EngineConfig;
use crate::engine::encoder::{EncodeRequest, ImageEncoder};
use crate::engine::pipeline::{resample, scaled_dimensions, TransformedImage};
use crate::error::LeanImageError;
use crate::ops::{EncodeSettings, OutputFormat};
use image::DynamicImage;
use std::borrow::Cow;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

type SearchResult<T> = std::result::Result<T, LeanImageError>;

const HALF_QUALITY_FLOOR: f32 = 0.1;
const WEBP_FALLBACK_CEILING: f32 = 0.6;
const WEBP_LOW_QUALITY: f32 = 0.3;
const JPEG_LOW_QUALITY: f32 = 0.4;
const EMERGENCY_QUALITY: f32 = 0.4;

/// Position in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SearchStep {
    /// Requested format at the requested quality.
    Requested,
    /// Same format at half the requested quality.
    HalfQuality,
    /// webp at `min(0.6, requested)`.
    WebpFallback,
    WebpLow,
    JpegLow,
    /// webp at half the base dimensions.
    Emergency,
}

impl SearchStep {
    /// 1-based position in the chain.
    pub fn number(&self) -> u8 {
        match self {
            Self::Requested => 1,
            Self::HalfQuality => 2,
            Self::WebpFallback => 3,
            Self::WebpLow => 4,
            Self::JpegLow => 5,
            Self::Emergency => 6,
        }
    }
}

/// Per-format quality bounds. png ignores quality; lossless webp is pinned to 1.0.
pub fn clamp_quality(format: OutputFormat, quality: f32, lossless: bool) -> f32 {
    match format {
        OutputFormat::Webp if lossless => 1.0,
        OutputFormat::Webp => quality.clamp(0.5, 0.85),
        OutputFormat::Avif => quality.clamp(0.15, 0.4),
        OutputFormat::Jpeg => quality.clamp(0.6, 0.92),
        OutputFormat::Png => 1.0,
    }
}

/// One entry of the fallback chain, before it runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedAttempt {
    pub step: SearchStep,
    pub format: OutputFormat,
    /// Clamped quality fraction.
    pub quality: f32,
    pub lossless: bool,
    pub width: u32,
    pub height: u32,
}

impl PlannedAttempt {
    fn new(
        step: SearchStep,
        format: OutputFormat,
        quality: f32,
        lossless: bool,
        (width, height): (u32, u32),
    ) -> Self {
        Self {
            step,
            format,
            quality: clamp_quality(format, quality, lossless),
            lossless,
            width,
            height,
        }
    }
}

/// Dimensions every attempt starts from: the transformed size, pre-scaled for
/// avif when the longest side is over budget.
pub fn base_dimensions(
    format: OutputFormat,
    width: u32,
    height: u32,
    config: &EngineConfig,
) -> (u32, u32) {
    if format != OutputFormat::Avif {
        return (width, height);
    }
    let scale = config.avif_scale(width, height);
    if scale >= 1.0 {
        (width, height)
    } else {
        scaled_dimensions(width, height, scale)
    }
}

/// Build the fallback chain for `settings` on a `width`x`height` bitmap.
pub fn plan_attempts(
    settings: &EncodeSettings,
    width: u32,
    height: u32,
    config: &EngineConfig,
) -> Vec<PlannedAttempt> {
    let format = settings.output_format;
    let requested = settings.quality_fraction();
    let base = base_dimensions(format, width, height, config);
    let mut plan = Vec::with_capacity(6);

    plan.push(PlannedAttempt::new(
        SearchStep::Requested,
        format,
        requested,
        settings.effective_lossless(),
        base,
    ));

    if format != OutputFormat::Png {
        let half = (requested / 2.0).max(HALF_QUALITY_FLOOR);
        plan.push(PlannedAttempt::new(
            SearchStep::HalfQuality,
            format,
            half,
            false,
            base,
        ));
    }

    if format != OutputFormat::Webp {
        plan.push(PlannedAttempt::new(
            SearchStep::WebpFallback,
            OutputFormat::Webp,
            requested.min(WEBP_FALLBACK_CEILING),
            false,
            base,
        ));
    }

    plan.push(PlannedAttempt::new(
        SearchStep::WebpLow,
        OutputFormat::Webp,
        WEBP_LOW_QUALITY,
        false,
        base,
    ));
    plan.push(PlannedAttempt::new(
        SearchStep::JpegLow,
        OutputFormat::Jpeg,
        JPEG_LOW_QUALITY,
        false,
        base,
    ));
    plan.push(PlannedAttempt::new(
        SearchStep::Emergency,
        OutputFormat::Webp,
        EMERGENCY_QUALITY,
        false,
        scaled_dimensions(base.0, base.1, config.emergency_scale),
    ));

    plan
}

/// What happened to one attempt. `byte_size` is `None` when the encoder (or
/// the render) refused.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub step: SearchStep,
    pub format: OutputFormat,
    pub quality: f32,
    pub width: u32,
    pub height: u32,
    pub byte_size: Option<u64>,
}

/// The artifact a successful search produced.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    pub bytes: Vec<u8>,
    pub byte_size: u64,
    pub original_size: u64,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    /// Quality fraction actually used.
    pub quality_used: f32,
    pub lossless: bool,
    /// `byte_size < original_size`.
    pub improved: bool,
    pub step: SearchStep,
    pub attempts: Vec<AttemptRecord>,
}

impl ConversionResult {
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Percentage saved relative to the original; negative when larger.
    pub fn savings_percent(&self) -> f64 {
        savings_percent(self.original_size, self.byte_size)
    }

    /// Write the bytes to `dir/file_name` through a temp file and atomic rename.
    pub fn persist(&self, dir: impl AsRef<Path>, file_name: &str) -> SearchResult<PathBuf> {
        let dir = dir.as_ref();
        let target = dir.join(file_name);
        let target_str = target.to_string_lossy().to_string();

        // Same directory as the target, so the rename never crosses filesystems.
        let mut temp_file = NamedTempFile::new_in(dir)
            .map_err(|e| LeanImageError::file_write_failed(dir.to_string_lossy().to_string(), e))?;
        temp_file
            .write_all(&self.bytes)
            .map_err(|e| LeanImageError::file_write_failed(target_str.clone(), e))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| LeanImageError::file_write_failed(target_str.clone(), e))?;
        temp_file
            .persist(&target)
            .map_err(|e| LeanImageError::file_write_failed(target_str, e.error))?;

        Ok(target)
    }
}

/// `(original - converted) / original * 100`, 0 for an empty original.
pub fn savings_percent(original: u64, converted: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    (original as f64 - converted as f64) / original as f64 * 100.0
}

struct Candidate {
    bytes: Vec<u8>,
    attempt: PlannedAttempt,
}

/// Run the fallback chain against `source`.
///
/// `icc` is embedded in every attempt and counts toward the size bound.
pub fn search(
    encoder: &dyn ImageEncoder,
    source: &TransformedImage,
    settings: &EncodeSettings,
    original_size: u64,
    icc: Option<&[u8]>,
    config: &EngineConfig,
) -> SearchResult<ConversionResult> {
    let plan = plan_attempts(settings, source.width, source.height, config);
    let mut records = Vec::with_capacity(plan.len());
    let mut best: Option<Candidate> = None;
    let mut render: Option<((u32, u32), DynamicImage)> = None;

    for attempt in plan {
        let bytes = encode_attempt(encoder, source, &attempt, icc, &mut render);
        let byte_size = bytes.as_ref().map(|b| b.len() as u64);
        tracing::debug!(
            step = attempt.step.number(),
            format = %attempt.format,
            quality = attempt.quality,
            width = attempt.width,
            height = attempt.height,
            size = ?byte_size,
            original_size,
            "encode attempt"
        );
        records.push(AttemptRecord {
            step: attempt.step,
            format: attempt.format,
            quality: attempt.quality,
            width: attempt.width,
            height: attempt.height,
            byte_size,
        });

        let Some(bytes) = bytes else { continue };
        let beats_original = (bytes.len() as u64) < original_size;
        let beats_best = best
            .as_ref()
            .map_or(true, |b| bytes.len() < b.bytes.len());
        if beats_best {
            best = Some(Candidate { bytes, attempt });
        }
        if beats_original {
            break;
        }
    }

    let Candidate { bytes, attempt } =
        best.ok_or_else(|| LeanImageError::encode_exhausted(records.len()))?;
    let byte_size = bytes.len() as u64;
    let improved = byte_size < original_size;
    if !improved {
        tracing::info!(
            byte_size,
            original_size,
            "no attempt beat the original; keeping the smallest"
        );
    }

    Ok(ConversionResult {
        bytes,
        byte_size,
        original_size,
        width: attempt.width,
        height: attempt.height,
        format: attempt.format,
        quality_used: attempt.quality,
        lossless: attempt.lossless,
        improved,
        step: attempt.step,
        attempts: records,
    })
}

/// Render (from the transformed source) and encode one attempt. Any failure is
/// an attempt without output.
fn encode_attempt(
    encoder: &dyn ImageEncoder,
    source: &TransformedImage,
    attempt: &PlannedAttempt,
    icc: Option<&[u8]>,
    render: &mut Option<((u32, u32), DynamicImage)>,
) -> Option<Vec<u8>> {
    let dims = (attempt.width, attempt.height);
    let image: Cow<'_, DynamicImage> = if dims == (source.width, source.height) {
        Cow::Borrowed(&source.image)
    } else {
        let cached = matches!(render, Some((cached_dims, _)) if *cached_dims == dims);
        if !cached {
            match resample(&source.image, dims.0, dims.1) {
                Ok(resized) => *render = Some((dims, resized)),
                Err(err) => {
                    tracing::warn!(%err, step = attempt.step.number(), "render failed");
                    return None;
                }
            }
        }
        match render.as_ref() {
            Some((_, image)) => Cow::Borrowed(image),
            None => return None,
        }
    };

    let request = EncodeRequest {
        format: attempt.format,
        quality: attempt.quality,
        lossless: attempt.lossless,
        icc,
    };
    match encoder.encode(&image, &request) {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        Ok(_) => None,
        Err(err) => {
            tracing::debug!(%err, step = attempt.step.number(), "encoder refused");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use parking_lot::Mutex;

    /// Returns a fixed size per step number; `None` means refuse.
    struct ScriptedEncoder {
        sizes: [Option<usize>; 6],
        seen: Mutex<Vec<(OutputFormat, f32, bool, u32, u32)>>,
    }

    impl ScriptedEncoder {
        fn new(sizes: [Option<usize>; 6]) -> Self {
            Self {
                sizes,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ImageEncoder for ScriptedEncoder {
        fn encode(
            &self,
            image: &DynamicImage,
            request: &EncodeRequest<'_>,
        ) -> SearchResult<Vec<u8>> {
            let mut seen = self.seen.lock();
            seen.push((
                request.format,
                request.quality,
                request.lossless,
                image.width(),
                image.height(),
            ));
            match self.sizes[seen.len() - 1] {
                Some(size) => Ok(vec![0u8; size]),
                None => Err(LeanImageError::encode_failed("scripted", "refused")),
            }
        }
    }

    fn source(width: u32, height: u32) -> TransformedImage {
        TransformedImage {
            image: DynamicImage::ImageRgb8(RgbImage::new(width, height)),
            width,
            height,
        }
    }

    fn steps(plan: &[PlannedAttempt]) -> Vec<u8> {
        plan.iter().map(|a| a.step.number()).collect()
    }

    #[test]
    fn test_clamp_table() {
        assert_eq!(clamp_quality(OutputFormat::Webp, 0.95, false), 0.85);
        assert_eq!(clamp_quality(OutputFormat::Webp, 0.2, true), 1.0);
        assert_eq!(clamp_quality(OutputFormat::Avif, 0.9, false), 0.4);
        assert_eq!(clamp_quality(OutputFormat::Avif, 0.05, false), 0.15);
        assert_eq!(clamp_quality(OutputFormat::Jpeg, 0.4, false), 0.6);
        assert_eq!(clamp_quality(OutputFormat::Png, 0.1, false), 1.0);
    }

    #[test]
    fn test_plan_for_each_format() {
        let config = EngineConfig::default();
        let plan = |format| {
            plan_attempts(&EncodeSettings::new(format, 80), 100, 100, &config)
        };
        assert_eq!(steps(&plan(OutputFormat::Webp)), vec![1, 2, 4, 5, 6]);
        assert_eq!(steps(&plan(OutputFormat::Png)), vec![1, 3, 4, 5, 6]);
        assert_eq!(steps(&plan(OutputFormat::Jpeg)), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(steps(&plan(OutputFormat::Avif)), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_plan_qualities_are_clamped() {
        let config = EngineConfig::default();
        let plan = plan_attempts(&EncodeSettings::new(OutputFormat::Jpeg, 80), 10, 10, &config);
        let qualities: Vec<f32> = plan.iter().map(|a| a.quality).collect();
        // 0.8, 0.4 -> 0.6, webp min(0.6, 0.8), webp 0.3 -> 0.5, jpeg 0.4 -> 0.6, webp 0.4 -> 0.5
        assert_eq!(qualities, vec![0.8, 0.6, 0.6, 0.5, 0.6, 0.5]);
    }

    #[test]
    fn test_half_quality_floor() {
        let config = EngineConfig::default();
        let plan = plan_attempts(&EncodeSettings::new(OutputFormat::Avif, 10), 10, 10, &config);
        // 0.1 / 2 = 0.05 -> floor 0.1 -> avif clamp 0.15
        assert_eq!(plan[1].quality, 0.15);
    }

    #[test]
    fn test_lossless_only_on_first_attempt() {
        let config = EngineConfig::default();
        let mut settings = EncodeSettings::new(OutputFormat::Webp, 60);
        settings.lossless = true;
        let plan = plan_attempts(&settings, 10, 10, &config);
        assert!(plan[0].lossless);
        assert_eq!(plan[0].quality, 1.0);
        assert!(plan[1..].iter().all(|a| !a.lossless));
    }

    #[test]
    fn test_avif_prescale_and_emergency_dimensions() {
        let config = EngineConfig::default();
        let plan = plan_attempts(&EncodeSettings::new(OutputFormat::Avif, 90), 2048, 1024, &config);
        assert!(plan[..5].iter().all(|a| (a.width, a.height) == (1024, 512)));
        assert_eq!((plan[5].width, plan[5].height), (512, 256));

        let webp = plan_attempts(&EncodeSettings::new(OutputFormat::Webp, 90), 2048, 1024, &config);
        assert_eq!((webp[0].width, webp[0].height), (2048, 1024));
    }

    #[test]
    fn test_first_improvement_wins() {
        let encoder = ScriptedEncoder::new([Some(900), Some(400), Some(10), None, None, None]);
        let result = search(
            &encoder,
            &source(20, 10),
            &EncodeSettings::new(OutputFormat::Jpeg, 80),
            500,
            None,
            &EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(result.step, SearchStep::HalfQuality);
        assert_eq!(result.byte_size, 400);
        assert!(result.improved);
        assert_eq!(result.attempt_count(), 2);
        assert_eq!(encoder.seen.lock().len(), 2);
    }

    #[test]
    fn test_smallest_returned_when_nothing_beats_original() {
        let encoder =
            ScriptedEncoder::new([Some(900), Some(800), None, Some(700), Some(750), Some(720)]);
        let result = search(
            &encoder,
            &source(20, 10),
            &EncodeSettings::new(OutputFormat::Jpeg, 80),
            500,
            None,
            &EngineConfig::default(),
        )
        .unwrap();
        assert!(!result.improved);
        assert_eq!(result.byte_size, 700);
        assert_eq!(result.step, SearchStep::WebpLow);
        assert_eq!(result.format, OutputFormat::Webp);
        assert_eq!(result.attempt_count(), 6);
        assert_eq!(result.attempts[2].byte_size, None);
    }

    #[test]
    fn test_exhaustion_when_every_attempt_refuses() {
        let encoder = ScriptedEncoder::new([None; 6]);
        let err = search(
            &encoder,
            &source(4, 4),
            &EncodeSettings::new(OutputFormat::Webp, 80),
            500,
            None,
            &EngineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, LeanImageError::EncodeExhausted { attempts: 5 }));
    }

    #[test]
    fn test_emergency_renders_from_source_at_half_size() {
        let encoder =
            ScriptedEncoder::new([Some(900), Some(900), Some(900), Some(900), Some(900), Some(10)]);
        let result = search(
            &encoder,
            &source(40, 20),
            &EncodeSettings::new(OutputFormat::Jpeg, 80),
            500,
            None,
            &EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(result.step, SearchStep::Emergency);
        assert_eq!((result.width, result.height), (20, 10));
        let seen = encoder.seen.lock();
        assert_eq!((seen[5].3, seen[5].4), (20, 10));
        assert!(seen[..5].iter().all(|s| (s.3, s.4) == (40, 20)));
    }

    #[test]
    fn test_savings_percent() {
        assert_eq!(savings_percent(1000, 250), 75.0);
        assert_eq!(savings_percent(0, 10), 0.0);
        assert!(savings_percent(100, 150) < 0.0);
    }

    #[test]
    fn test_persist_writes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConversionResult {
            bytes: vec![1, 2, 3],
            byte_size: 3,
            original_size: 10,
            width: 1,
            height: 1,
            format: OutputFormat::Webp,
            quality_used: 0.8,
            lossless: false,
            improved: true,
            step: SearchStep::Requested,
            attempts: Vec::new(),
        };
        let path = result.persist(dir.path(), "out.webp").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_persist_into_missing_dir_fails() {
        let result = ConversionResult {
            bytes: vec![1],
            byte_size: 1,
            original_size: 1,
            width: 1,
            height: 1,
            format: OutputFormat::Png,
            quality_used: 1.0,
            lossless: true,
            improved: false,
            step: SearchStep::Requested,
            attempts: Vec::new(),
        };
        let err = result.persist("/nonexistent/lean-image", "x.png").unwrap_err();
        assert!(matches!(err, LeanImageError::FileWriteFailed { .. }));
    }
}
