// src/ops.rs
//
// Conversion settings.
// Plain data, cheap to clone and snapshot - nothing here touches pixels.
// Out-of-range values are kept as given and clamped where they are consumed.

use std::fmt;
use std::str::FromStr;

use crate::error::{LeanImageError, Result};

/// Output format for encoding
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum OutputFormat {
    #[default]
    Webp,
    Avif,
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Avif => "avif",
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }

    /// File extension used for output names.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Avif => "avif",
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Webp => "image/webp",
            Self::Avif => "image/avif",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    /// webp and png have a true lossless mode; jpeg and avif are always lossy.
    pub fn supports_lossless(&self) -> bool {
        matches!(self, Self::Webp | Self::Png)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = LeanImageError;

    /// Accepts bare names (`webp`, `jpg`) and MIME strings (`image/webp`).
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let name = lower.strip_prefix("image/").unwrap_or(&lower);
        match name {
            "webp" => Ok(Self::Webp),
            "avif" => Ok(Self::Avif),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            _ => Err(LeanImageError::unsupported_format(s.to_string())),
        }
    }
}

// =============================================================================
// TRANSFORM SETTINGS
// =============================================================================

/// Everything the transform stage does to a bitmap. `Default` is the identity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransformSettings {
    pub resize: ResizeSettings,
    pub rotate: Rotation,
    pub flip: FlipSettings,
    pub filters: FilterSettings,
    pub crop: CropSettings,
}

impl TransformSettings {
    pub fn is_identity(&self) -> bool {
        !self.resize.enabled
            && self.rotate == Rotation::Deg0
            && !self.flip.horizontal
            && !self.flip.vertical
            && !self.filters.is_active()
            && !self.crop.enabled
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ResizeMode {
    #[default]
    Percentage,
    Dimensions,
}

/// Which axis the user edited last while the aspect ratio was locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AspectAnchor {
    #[default]
    Width,
    Height,
}

pub const MIN_RESIZE_PERCENT: u32 = 10;
pub const MAX_RESIZE_PERCENT: u32 = 200;

#[derive(Clone, Debug, PartialEq)]
pub struct ResizeSettings {
    pub enabled: bool,
    pub mode: ResizeMode,
    pub percentage: u32,
    pub width: u32,
    pub height: u32,
    pub lock_aspect: bool,
    pub anchor: AspectAnchor,
}

impl Default for ResizeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ResizeMode::Percentage,
            percentage: 100,
            width: 0,
            height: 0,
            lock_aspect: true,
            anchor: AspectAnchor::Width,
        }
    }
}

/// `round(value * num / den)`, at least 1.
fn scale_rounded(value: u32, num: u32, den: u32) -> u32 {
    if den == 0 {
        return value.max(1);
    }
    let scaled = (value as f64 * num as f64 / den as f64).round();
    (scaled as u32).max(1)
}

impl ResizeSettings {
    pub fn percentage(percent: u32) -> Self {
        Self {
            enabled: true,
            mode: ResizeMode::Percentage,
            percentage: percent,
            ..Self::default()
        }
    }

    pub fn dimensions(width: u32, height: u32, lock_aspect: bool) -> Self {
        Self {
            enabled: true,
            mode: ResizeMode::Dimensions,
            width,
            height,
            lock_aspect,
            ..Self::default()
        }
    }

    pub fn clamped_percentage(&self) -> u32 {
        self.percentage
            .clamp(MIN_RESIZE_PERCENT, MAX_RESIZE_PERCENT)
    }

    /// Set the width. With the aspect locked, height is recomputed from the
    /// source ratio, never from the previously derived height.
    pub fn edit_width(&mut self, width: u32, source_dims: (u32, u32)) {
        let (src_w, src_h) = source_dims;
        self.width = width.max(1);
        self.anchor = AspectAnchor::Width;
        if self.lock_aspect {
            self.height = scale_rounded(self.width, src_h, src_w);
        }
    }

    /// Set the height. Mirror of [`edit_width`](Self::edit_width).
    pub fn edit_height(&mut self, height: u32, source_dims: (u32, u32)) {
        let (src_w, src_h) = source_dims;
        self.height = height.max(1);
        self.anchor = AspectAnchor::Height;
        if self.lock_aspect {
            self.width = scale_rounded(self.height, src_w, src_h);
        }
    }

    /// Output dimensions for an image of `src_w`x`src_h`. Every axis is at
    /// least 1 pixel.
    pub fn target_dimensions(&self, src_w: u32, src_h: u32) -> (u32, u32) {
        if !self.enabled {
            return (src_w, src_h);
        }
        match self.mode {
            ResizeMode::Percentage => {
                let pct = self.clamped_percentage();
                (scale_rounded(src_w, pct, 100), scale_rounded(src_h, pct, 100))
            }
            ResizeMode::Dimensions => {
                let width = (self.width > 0).then_some(self.width);
                let height = (self.height > 0).then_some(self.height);
                match (width, height, self.lock_aspect) {
                    (None, None, _) => (src_w, src_h),
                    (Some(w), None, _) => (w, scale_rounded(w, src_h, src_w)),
                    (None, Some(h), _) => (scale_rounded(h, src_w, src_h), h),
                    (Some(w), Some(_), true) if self.anchor == AspectAnchor::Width => {
                        (w, scale_rounded(w, src_h, src_w))
                    }
                    (Some(_), Some(h), true) => (scale_rounded(h, src_w, src_h), h),
                    (Some(w), Some(h), false) => (w, h),
                }
            }
        }
    }
}

/// Quarter-turn rotation, clockwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Negative angles are normalized (`-90` is `270`).
    pub fn from_degrees(degrees: i32) -> Result<Self> {
        match degrees.rem_euclid(360) {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            _ => Err(LeanImageError::invalid_rotation_angle(degrees)),
        }
    }

    pub fn degrees(&self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlipSettings {
    pub horizontal: bool,
    pub vertical: bool,
}

/// Tonal filters. Brightness and contrast are in [-100, 100].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterSettings {
    pub grayscale: bool,
    pub brightness: i32,
    pub contrast: i32,
}

impl FilterSettings {
    pub fn brightness(&self) -> i32 {
        self.brightness.clamp(-100, 100)
    }

    pub fn contrast(&self) -> i32 {
        self.contrast.clamp(-100, 100)
    }

    pub fn is_active(&self) -> bool {
        self.grayscale || self.brightness() != 0 || self.contrast() != 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CropSettings {
    pub enabled: bool,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropSettings {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            enabled: true,
            x,
            y,
            width,
            height,
        }
    }
}

// =============================================================================
// ENCODE SETTINGS
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodeSettings {
    pub output_format: OutputFormat,
    /// 1..=100; anything else is clamped.
    pub quality: u8,
    /// Only meaningful for webp and png.
    pub lossless: bool,
    /// Carry the source ICC profile into the output.
    pub preserve_metadata: bool,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::Webp,
            quality: 80,
            lossless: false,
            preserve_metadata: false,
        }
    }
}

impl EncodeSettings {
    pub fn new(output_format: OutputFormat, quality: u8) -> Self {
        Self {
            output_format,
            quality,
            ..Self::default()
        }
    }

    /// Requested quality as a fraction in [0.01, 1.0].
    pub fn quality_fraction(&self) -> f32 {
        self.quality.clamp(1, 100) as f32 / 100.0
    }

    /// `lossless` after dropping it for formats that cannot honor it.
    /// png is always lossless.
    pub fn effective_lossless(&self) -> bool {
        match self.output_format {
            OutputFormat::Png => true,
            OutputFormat::Webp => self.lossless,
            OutputFormat::Jpeg | OutputFormat::Avif => false,
        }
    }

    /// Overwrite quality/lossless from a named preset for the current format.
    pub fn apply_preset(&mut self, name: &str) -> Result<()> {
        let preset = PresetConfig::get(self.output_format, name)?;
        self.quality = preset.quality;
        self.lossless = preset.lossless;
        Ok(())
    }
}

// =============================================================================
// PRESETS - named quality bundles per output format
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresetConfig {
    pub quality: u8,
    pub lossless: bool,
}

impl PresetConfig {
    const fn lossy(quality: u8) -> Self {
        Self {
            quality,
            lossless: false,
        }
    }

    const fn lossless() -> Self {
        Self {
            quality: 100,
            lossless: true,
        }
    }

    /// Look up a preset by name (case-insensitive).
    pub fn get(format: OutputFormat, name: &str) -> Result<Self> {
        let preset = match (format, name.to_ascii_lowercase().as_str()) {
            (OutputFormat::Webp, "high") => Self::lossy(85),
            (OutputFormat::Webp, "balanced") => Self::lossy(75),
            (OutputFormat::Webp, "small") => Self::lossy(60),
            (OutputFormat::Webp, "lossless") => Self::lossless(),

            (OutputFormat::Avif, "high") => Self::lossy(80),
            (OutputFormat::Avif, "balanced") => Self::lossy(60),
            (OutputFormat::Avif, "small") => Self::lossy(40),

            (OutputFormat::Jpeg, "high") => Self::lossy(92),
            (OutputFormat::Jpeg, "balanced") => Self::lossy(80),
            (OutputFormat::Jpeg, "small") => Self::lossy(65),

            (OutputFormat::Png, "lossless") => Self::lossless(),

            _ => {
                return Err(LeanImageError::invalid_preset(
                    format.as_str(),
                    name.to_string(),
                ))
            }
        };
        Ok(preset)
    }

    /// Preset names available for `format`, in display order.
    pub fn names(format: OutputFormat) -> &'static [&'static str] {
        match format {
            OutputFormat::Webp => &["high", "balanced", "small", "lossless"],
            OutputFormat::Avif | OutputFormat::Jpeg => &["high", "balanced", "small"],
            OutputFormat::Png => &["lossless"],
        }
    }
}
