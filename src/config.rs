// src/config.rs
//
// Engine-wide limits and tuning knobs.

use std::time::Duration;

use crate::error::{LeanImageError, Result};

/// Absolute ceiling on either side of a decoded image.
pub const MAX_DIMENSION: u32 = 32768;
/// Absolute ceiling on decoded pixel count (100 MP).
pub const MAX_PIXELS: u64 = 100_000_000;

const CONSTRAINED_MAX_DIMENSION: u32 = 8192;
const CONSTRAINED_MAX_PIXELS: u64 = 40_000_000; // ~8K x 5K

const AVIF_MAX_DIMENSION: u32 = 1024;
const AVIF_MIN_SCALE: f32 = 0.4;
const EMERGENCY_SCALE: f32 = 0.5;
const RECONVERT_DELAY: Duration = Duration::from_millis(300);
const HISTORY_CAPACITY: usize = 50;

/// How a batch schedules its files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// One file at a time; peak memory is one decoded bitmap plus one render.
    #[default]
    Sequential,
    /// Files run on the global rayon pool. Results and progress stay in input order.
    Parallel,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub max_dimension: u32,
    pub max_pixels: u64,
    /// Longest side an avif attempt is rendered at before fallbacks kick in.
    pub avif_max_dimension: u32,
    /// Lower bound for the avif pre-scale factor.
    pub avif_min_scale: f32,
    /// Extra scale applied to the last-resort attempt.
    pub emergency_scale: f32,
    pub reconvert_delay: Duration,
    pub history_capacity: usize,
    pub concurrency: Concurrency,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_dimension: MAX_DIMENSION,
            max_pixels: MAX_PIXELS,
            avif_max_dimension: AVIF_MAX_DIMENSION,
            avif_min_scale: AVIF_MIN_SCALE,
            emergency_scale: EMERGENCY_SCALE,
            reconvert_delay: RECONVERT_DELAY,
            history_capacity: HISTORY_CAPACITY,
            concurrency: Concurrency::Sequential,
        }
    }
}

impl EngineConfig {
    /// Tighter decode limits for memory-constrained hosts.
    pub fn constrained() -> Self {
        Self {
            max_dimension: CONSTRAINED_MAX_DIMENSION,
            max_pixels: CONSTRAINED_MAX_PIXELS,
            ..Self::default()
        }
    }

    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension.min(MAX_DIMENSION);
        self
    }

    pub fn with_max_pixels(mut self, max_pixels: u64) -> Self {
        self.max_pixels = max_pixels.min(MAX_PIXELS);
        self
    }

    pub fn with_reconvert_delay(mut self, delay: Duration) -> Self {
        self.reconvert_delay = delay;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Reject decoded images beyond the configured limits.
    pub fn check_dimensions(&self, width: u32, height: u32) -> Result<()> {
        if width > self.max_dimension || height > self.max_dimension {
            return Err(LeanImageError::dimension_exceeds_limit(
                width.max(height),
                self.max_dimension,
            ));
        }
        let pixels = width as u64 * height as u64;
        if pixels > self.max_pixels {
            return Err(LeanImageError::pixel_count_exceeds_limit(
                pixels,
                self.max_pixels,
            ));
        }
        Ok(())
    }

    /// Shrink a requested `width`x`height` by one common factor (floor,
    /// minimum 1) until it passes [`check_dimensions`](Self::check_dimensions).
    pub fn fit_within_limits(&self, width: u32, height: u32) -> (u32, u32) {
        if self.check_dimensions(width, height).is_ok() {
            return (width, height);
        }
        let longest = width.max(height) as f64;
        let pixels = width as f64 * height as f64;
        let scale = (self.max_dimension as f64 / longest)
            .min((self.max_pixels as f64 / pixels).sqrt())
            .min(1.0);
        let apply = |v: u32| ((v as f64 * scale).floor() as u32).clamp(1, self.max_dimension.max(1));
        let (mut w, mut h) = (apply(width), apply(height));
        // float rounding can leave the area a pixel row over
        while w as u64 * h as u64 > self.max_pixels && (w > 1 || h > 1) {
            if w >= h {
                w -= 1;
            } else {
                h -= 1;
            }
        }
        (w, h)
    }

    /// Scale factor for an avif render of a `width`x`height` image, 1.0 when
    /// the image already fits.
    pub fn avif_scale(&self, width: u32, height: u32) -> f32 {
        let longest = width.max(height);
        if longest <= self.avif_max_dimension || longest == 0 {
            return 1.0;
        }
        (self.avif_max_dimension as f32 / longest as f32).max(self.avif_min_scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let config = EngineConfig::default();
        assert!(config.check_dimensions(MAX_DIMENSION, 1).is_ok());
        assert!(config.check_dimensions(MAX_DIMENSION + 1, 1).is_err());
        assert!(matches!(
            config.check_dimensions(20_000, 20_000),
            Err(LeanImageError::PixelCountExceedsLimit { .. })
        ));
    }

    #[test]
    fn test_constrained_is_tighter() {
        let config = EngineConfig::constrained();
        assert!(config.check_dimensions(9000, 10).is_err());
        assert_eq!(config.history_capacity, 50);
    }

    #[test]
    fn test_builder_cannot_exceed_absolute_limits() {
        let config = EngineConfig::default().with_max_dimension(u32::MAX);
        assert_eq!(config.max_dimension, MAX_DIMENSION);
    }

    #[test]
    fn test_fit_within_limits_keeps_aspect() {
        let config = EngineConfig::default();
        assert_eq!(config.fit_within_limits(4000, 3000), (4000, 3000));

        let (w, h) = config.fit_within_limits(100_000, 50_000);
        assert!(config.check_dimensions(w, h).is_ok());
        assert!(w <= MAX_DIMENSION);
        let ratio = w as f64 / h as f64;
        assert!((ratio - 2.0).abs() < 0.01, "ratio drifted to {ratio}");

        let config = EngineConfig::default().with_max_dimension(100).with_max_pixels(5000);
        assert_eq!(config.fit_within_limits(400, 200), (100, 50));
        let (w, h) = config.fit_within_limits(1, 1_000_000);
        assert_eq!(w, 1);
        assert!((99..=100).contains(&h));
    }

    #[test]
    fn test_fit_within_limits_pixel_budget() {
        let config = EngineConfig::default().with_max_pixels(10_000);
        let (w, h) = config.fit_within_limits(160, 120);
        assert!(w as u64 * h as u64 <= 10_000);
        assert_eq!((w, h), (115, 86));
    }

    #[test]
    fn test_avif_scale() {
        let config = EngineConfig::default();
        assert_eq!(config.avif_scale(1024, 800), 1.0);
        assert!((config.avif_scale(2048, 100) - 0.5).abs() < 1e-6);
        // 1024 / 4000 = 0.256, floored at 0.4
        assert!((config.avif_scale(100, 4000) - 0.4).abs() < 1e-6);
    }
}
