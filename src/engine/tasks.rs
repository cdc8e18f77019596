// src/engine/tasks.rs
//
// One file through the whole pipeline: decode -> transform -> encoder search.

use crate::config::EngineConfig;
use crate::engine::decoder::decode_image;
use crate::engine::encoder::ImageEncoder;
use crate::engine::io::SourceImage;
use crate::engine::pipeline::apply_transform;
use crate::engine::search::{search, ConversionResult};
use crate::error::LeanImageError;
use crate::ops::{EncodeSettings, TransformSettings};
use crate::{ProcessingMetrics, PROCESSING_METRICS_VERSION};
use std::borrow::Cow;
use std::time::Instant;

type TaskResult<T> = std::result::Result<T, LeanImageError>;

#[derive(Clone, Copy)]
struct ResourceUsage {
    cpu_time: f64,   // User + system CPU time in seconds
    memory_rss: u64, // Resident set size in bytes
}

/// Current process CPU time and peak RSS. None where getrusage is unavailable.
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
fn get_resource_usage() -> Option<ResourceUsage> {
    use libc::{getrusage, rusage, RUSAGE_SELF};

    let mut usage: rusage = unsafe { std::mem::zeroed() };
    if unsafe { getrusage(RUSAGE_SELF, &mut usage) } != 0 {
        return None;
    }
    let cpu_time = usage.ru_utime.tv_sec as f64
        + usage.ru_utime.tv_usec as f64 / 1_000_000.0
        + usage.ru_stime.tv_sec as f64
        + usage.ru_stime.tv_usec as f64 / 1_000_000.0;

    // ru_maxrss is KB on Linux, bytes on macOS/FreeBSD
    #[cfg(target_os = "linux")]
    let memory_rss = usage.ru_maxrss as u64 * 1024;
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    let memory_rss = usage.ru_maxrss as u64;

    Some(ResourceUsage {
        cpu_time,
        memory_rss,
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
fn get_resource_usage() -> Option<ResourceUsage> {
    None
}

/// Stage timings for one conversion. Does nothing when no metrics sink is given.
struct MetricsRecorder<'m> {
    metrics: Option<&'m mut ProcessingMetrics>,
    start_total: Instant,
    stage_start: Instant,
    usage_start: Option<ResourceUsage>,
}

impl<'m> MetricsRecorder<'m> {
    fn new(metrics: Option<&'m mut ProcessingMetrics>) -> Self {
        let now = Instant::now();
        let usage_start = metrics.as_ref().and_then(|_| get_resource_usage());
        Self {
            metrics,
            start_total: now,
            stage_start: now,
            usage_start,
        }
    }

    fn lap(&mut self) -> f64 {
        let ms = self.stage_start.elapsed().as_secs_f64() * 1000.0;
        self.stage_start = Instant::now();
        ms
    }

    fn mark_decode_done(&mut self) {
        if self.metrics.is_some() {
            let ms = self.lap();
            if let Some(m) = self.metrics.as_deref_mut() {
                m.decode_ms = ms;
            }
        }
    }

    fn mark_transform_done(&mut self) {
        if self.metrics.is_some() {
            let ms = self.lap();
            if let Some(m) = self.metrics.as_deref_mut() {
                m.transform_ms = ms;
            }
        }
    }

    fn finalize(&mut self, source: &SourceImage, result: &ConversionResult, icc_preserved: bool) {
        if self.metrics.is_none() {
            return;
        }
        let encode_ms = self.lap();
        let usage_end = get_resource_usage();
        let Some(m) = self.metrics.as_deref_mut() else {
            return;
        };

        m.version = PROCESSING_METRICS_VERSION.to_string();
        m.encode_ms = encode_ms;
        m.total_ms = self.start_total.elapsed().as_secs_f64() * 1000.0;

        if let (Some(start), Some(end)) = (self.usage_start, usage_end) {
            m.cpu_time = (end.cpu_time - start.cpu_time).max(0.0);
            m.peak_rss = end.memory_rss;
        } else {
            m.peak_rss = result.width as u64 * result.height as u64 * 4 + result.byte_size;
        }

        m.bytes_in = source.byte_size();
        m.bytes_out = result.byte_size;
        m.compression_ratio = if m.bytes_in > 0 {
            m.bytes_out as f64 / m.bytes_in as f64
        } else {
            0.0
        };
        m.attempts = result.attempt_count();
        m.format_in = Some(source.format_label());
        m.format_out = result.format.as_str().to_string();
        m.icc_preserved = icc_preserved;
    }
}

/// A single file's conversion under a fixed settings snapshot.
#[derive(Clone, Copy)]
pub struct ConversionTask<'a> {
    pub source: &'a SourceImage,
    pub transform: &'a TransformSettings,
    pub encode: &'a EncodeSettings,
    pub config: &'a EngineConfig,
}

impl<'a> ConversionTask<'a> {
    pub fn new(
        source: &'a SourceImage,
        transform: &'a TransformSettings,
        encode: &'a EncodeSettings,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            source,
            transform,
            encode,
            config,
        }
    }

    pub fn run(&self, encoder: &dyn ImageEncoder) -> TaskResult<ConversionResult> {
        self.run_with_metrics(encoder, None)
    }

    /// decode -> transform -> search. The decoded bitmap is dropped as soon as
    /// the transform has produced its own.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(file = %self.source.name(), format = %self.encode.output_format)
    )]
    pub fn run_with_metrics(
        &self,
        encoder: &dyn ImageEncoder,
        metrics: Option<&mut ProcessingMetrics>,
    ) -> TaskResult<ConversionResult> {
        let mut recorder = MetricsRecorder::new(metrics);

        let (decoded, _format) = decode_image(self.source.bytes(), self.config)?;
        recorder.mark_decode_done();

        let transformed = apply_transform(Cow::Owned(decoded), self.transform, self.config)?;
        recorder.mark_transform_done();

        let icc = if self.encode.preserve_metadata {
            self.source.icc_profile()
        } else {
            None
        };

        let result = search(
            encoder,
            &transformed,
            self.encode,
            self.source.byte_size(),
            icc.as_deref(),
            self.config,
        )?;
        recorder.finalize(self.source, &result, icc.is_some());
        Ok(result)
    }
}
