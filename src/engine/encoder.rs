// src/engine/encoder.rs
//
// Encoder operations: JPEG (mozjpeg), PNG (image + oxipng), WebP (libwebp),
// AVIF (libavif) with quality-banded settings.

use crate::codecs::avif_safe::{AvifEncoderHandle, AvifFrame};
use crate::engine::common::run_with_panic_policy;
use crate::error::LeanImageError;
use crate::ops::OutputFormat;
use image::{DynamicImage, ImageFormat};
use img_parts::{jpeg::Jpeg, png::Png, webp::WebP, Bytes, ImageICC};
use mozjpeg::{ColorSpace, Compress, ScanMode};
use std::borrow::Cow;
use std::io::Cursor;

type EncoderResult<T> = std::result::Result<T, LeanImageError>;

/// One encode call: the format, a quality fraction in (0, 1], and whether to
/// use the format's lossless mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeRequest<'a> {
    pub format: OutputFormat,
    pub quality: f32,
    pub lossless: bool,
    pub icc: Option<&'a [u8]>,
}

impl EncodeRequest<'_> {
    /// Quality on the 1..=100 scale the codec libraries take.
    pub fn quality_percent(&self) -> u8 {
        (self.quality * 100.0).round().clamp(1.0, 100.0) as u8
    }
}

/// Turns pixels into bytes. Implementations may refuse (return `Err`); the
/// search treats a refusal as an attempt that produced no output.
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, image: &DynamicImage, request: &EncodeRequest<'_>) -> EncoderResult<Vec<u8>>;
}

/// The real codecs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeEncoder;

impl ImageEncoder for NativeEncoder {
    fn encode(&self, image: &DynamicImage, request: &EncodeRequest<'_>) -> EncoderResult<Vec<u8>> {
        let quality = request.quality_percent();
        match request.format {
            OutputFormat::Jpeg => encode_jpeg(image, quality, request.icc),
            OutputFormat::Png => encode_png(image, request.icc),
            OutputFormat::Webp => encode_webp(image, quality, request.lossless, request.icc),
            OutputFormat::Avif => encode_avif(image, quality, request.icc),
        }
    }
}

/// Derives per-codec tuning from a 0-100 quality. Bands:
/// - High (>=85): visual quality first, AVIF speed 6
/// - Balanced (70-84): AVIF speed 7
/// - Fast (50-69): AVIF speed 8
/// - Fastest (<50): AVIF speed 9
///
/// WebP filter strength keeps its own 80/60 thresholds.
#[derive(Debug, Clone, Copy)]
pub struct QualitySettings {
    quality: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QualityBand {
    High,
    Balanced,
    Fast,
    Fastest,
}

impl QualitySettings {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.min(100) as f32,
        }
    }

    fn band(&self) -> QualityBand {
        if self.quality >= 85.0 {
            QualityBand::High
        } else if self.quality >= 70.0 {
            QualityBand::Balanced
        } else if self.quality >= 50.0 {
            QualityBand::Fast
        } else {
            QualityBand::Fastest
        }
    }

    pub fn webp_method(&self) -> i32 {
        4
    }

    pub fn webp_sns_strength(&self) -> i32 {
        match self.band() {
            QualityBand::High => 50,
            QualityBand::Balanced => 70,
            QualityBand::Fast | QualityBand::Fastest => 80,
        }
    }

    pub fn webp_filter_strength(&self) -> i32 {
        if self.quality >= 80.0 {
            20
        } else if self.quality >= 60.0 {
            30
        } else {
            40
        }
    }

    pub fn webp_filter_sharpness(&self) -> i32 {
        match self.band() {
            QualityBand::High => 2,
            QualityBand::Balanced | QualityBand::Fast | QualityBand::Fastest => 0,
        }
    }

    /// libavif speed: 0 (slowest/best) to 10 (fastest/worst)
    pub fn avif_speed(&self) -> i32 {
        match self.band() {
            QualityBand::High => 6,
            QualityBand::Balanced => 7,
            QualityBand::Fast => 8,
            QualityBand::Fastest => 9,
        }
    }

    pub fn jpeg_smoothing(&self) -> u8 {
        if self.quality >= 90.0 {
            0
        } else if self.quality >= 70.0 {
            5
        } else if self.quality >= 60.0 {
            10
        } else {
            18
        }
    }
}

fn ensure_non_empty(format: &'static str, width: u32, height: u32) -> EncoderResult<()> {
    if width == 0 || height == 0 {
        return Err(LeanImageError::encode_failed(
            format,
            format!("cannot encode empty image {width}x{height}"),
        ));
    }
    Ok(())
}

/// Encode to JPEG using mozjpeg: progressive, optimized Huffman tables, 4:2:0.
/// Alpha is dropped.
pub fn encode_jpeg(img: &DynamicImage, quality: u8, icc: Option<&[u8]>) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:jpeg", || {
        let settings = QualitySettings::new(quality);
        let rgb: Cow<'_, image::RgbImage> = match img {
            DynamicImage::ImageRgb8(rgb_img) => Cow::Borrowed(rgb_img),
            _ => Cow::Owned(img.to_rgb8()),
        };
        let (w, h) = rgb.dimensions();
        ensure_non_empty("jpeg", w, h)?;
        let pixels: &[u8] = rgb.as_raw();

        let mut comp = Compress::new(ColorSpace::JCS_RGB);
        comp.set_size(w as usize, h as usize);
        comp.set_color_space(ColorSpace::JCS_YCbCr);
        comp.set_quality(quality.min(100) as f32);
        comp.set_chroma_sampling_pixel_sizes((2, 2), (2, 2));
        comp.set_progressive_mode();
        comp.set_optimize_coding(true);
        comp.set_optimize_scans(true);
        comp.set_scan_optimization_mode(ScanMode::AllComponentsTogether);
        comp.set_smoothing_factor(settings.jpeg_smoothing());

        let mut output = Vec::with_capacity((w as usize * h as usize * 3 / 10).max(4096));
        {
            let mut writer = comp.start_compress(&mut output).map_err(|e| {
                LeanImageError::encode_failed("jpeg", format!("mozjpeg: start_compress: {e:?}"))
            })?;
            for row in pixels.chunks(w as usize * 3) {
                writer.write_scanlines(row).map_err(|e| {
                    LeanImageError::encode_failed("jpeg", format!("mozjpeg: write_scanlines: {e:?}"))
                })?;
            }
            writer.finish().map_err(|e| {
                LeanImageError::encode_failed("jpeg", format!("mozjpeg: finish: {e:?}"))
            })?;
        }

        match icc {
            Some(icc_data) => embed_icc_jpeg(output, icc_data),
            None => Ok(output),
        }
    })
}

/// Embed ICC profile into JPEG as a single APP2 segment.
pub fn embed_icc_jpeg(jpeg_data: Vec<u8>, icc: &[u8]) -> EncoderResult<Vec<u8>> {
    let mut jpeg = Jpeg::from_bytes(Bytes::from(jpeg_data)).map_err(|e| {
        LeanImageError::encode_failed("jpeg", format!("failed to parse JPEG for ICC: {e}"))
    })?;
    jpeg.set_icc_profile(Some(Bytes::from(icc.to_vec())));

    let mut output = Vec::new();
    jpeg.encoder().write_to(&mut output).map_err(|e| {
        LeanImageError::encode_failed("jpeg", format!("failed to write JPEG with ICC: {e}"))
    })?;
    Ok(output)
}

/// Encode to PNG with the image crate, then recompress losslessly with oxipng.
pub fn encode_png(img: &DynamicImage, icc: Option<&[u8]>) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:png", || {
        ensure_non_empty("png", img.width(), img.height())?;
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| LeanImageError::encode_failed("png", format!("PNG encode failed: {e}")))?;

        let mut options = oxipng::Options::from_preset(4);
        options.strip = oxipng::StripChunks::None;
        let optimized = oxipng::optimize_from_memory(&buf, &options).map_err(|e| {
            LeanImageError::encode_failed("png", format!("oxipng optimization failed: {e}"))
        })?;

        match icc {
            Some(icc_data) => embed_icc_png(optimized, icc_data),
            None => Ok(optimized),
        }
    })
}

/// Embed ICC profile into PNG (iCCP chunk).
pub fn embed_icc_png(png_data: Vec<u8>, icc: &[u8]) -> EncoderResult<Vec<u8>> {
    let mut png = Png::from_bytes(Bytes::from(png_data)).map_err(|e| {
        LeanImageError::encode_failed("png", format!("failed to parse PNG for ICC: {e}"))
    })?;
    png.set_icc_profile(Some(Bytes::from(icc.to_vec())));

    let mut output = Vec::new();
    png.encoder().write_to(&mut output).map_err(|e| {
        LeanImageError::encode_failed("png", format!("failed to write PNG with ICC: {e}"))
    })?;
    Ok(output)
}

/// Encode to WebP through `encode_advanced`. Alpha is kept only when the
/// source has an alpha channel.
pub fn encode_webp(
    img: &DynamicImage,
    quality: u8,
    lossless: bool,
    icc: Option<&[u8]>,
) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:webp", || {
        let (w, h) = (img.width(), img.height());
        ensure_non_empty("webp", w, h)?;

        let pixels: Cow<'_, [u8]>;
        let encoder = if img.color().has_alpha() {
            pixels = match img {
                DynamicImage::ImageRgba8(rgba) => Cow::Borrowed(rgba.as_raw().as_slice()),
                _ => Cow::Owned(img.to_rgba8().into_raw()),
            };
            webp::Encoder::from_rgba(&pixels, w, h)
        } else {
            pixels = match img {
                DynamicImage::ImageRgb8(rgb) => Cow::Borrowed(rgb.as_raw().as_slice()),
                _ => Cow::Owned(img.to_rgb8().into_raw()),
            };
            webp::Encoder::from_rgb(&pixels, w, h)
        };

        let mut config = webp::WebPConfig::new()
            .map_err(|_| LeanImageError::internal_panic("failed to create WebPConfig"))?;

        let settings = QualitySettings::new(quality);
        config.quality = settings.quality;
        config.method = settings.webp_method();
        config.pass = 1;
        config.preprocessing = 0;
        config.sns_strength = settings.webp_sns_strength();
        config.autofilter = 1;
        config.filter_strength = settings.webp_filter_strength();
        config.filter_sharpness = settings.webp_filter_sharpness();
        config.lossless = i32::from(lossless);

        let mem = encoder.encode_advanced(&config).map_err(|e| {
            LeanImageError::encode_failed("webp", format!("WebP encode failed: {e:?}"))
        })?;
        let encoded = mem.to_vec();

        match icc {
            Some(icc_data) => embed_icc_webp(encoded, icc_data),
            None => Ok(encoded),
        }
    })
}

/// Embed ICC profile into WebP (ICCP chunk, extended format).
pub fn embed_icc_webp(webp_data: Vec<u8>, icc: &[u8]) -> EncoderResult<Vec<u8>> {
    let mut webp = WebP::from_bytes(Bytes::from(webp_data)).map_err(|e| {
        LeanImageError::encode_failed("webp", format!("failed to parse WebP for ICC: {e}"))
    })?;
    webp.set_icc_profile(Some(Bytes::from(icc.to_vec())));

    let mut output = Vec::new();
    webp.encoder().write_to(&mut output).map_err(|e| {
        LeanImageError::encode_failed("webp", format!("failed to write WebP with ICC: {e}"))
    })?;
    Ok(output)
}

/// Encode to AVIF with libavif/rav1e. Always lossy.
pub fn encode_avif(img: &DynamicImage, quality: u8, icc: Option<&[u8]>) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:avif", || {
        let settings = QualitySettings::new(quality);
        let rgba: Cow<'_, image::RgbaImage> = match img {
            DynamicImage::ImageRgba8(rgba_img) => Cow::Borrowed(rgba_img),
            _ => Cow::Owned(img.to_rgba8()),
        };
        let (w, h) = rgba.dimensions();

        let mut frame = AvifFrame::from_rgba(rgba.as_raw(), w, h)?;
        if let Some(icc_data) = icc {
            frame.set_icc_profile(icc_data)?;
        }

        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .clamp(2, 8) as i32;

        let mut encoder = AvifEncoderHandle::new()?;
        encoder.configure(quality, settings.avif_speed(), threads);
        encoder.encode(&frame)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, RgbImage, RgbaImage};

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    fn create_test_image_rgba(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, (x * 4 % 256) as u8])
        }))
    }

    #[test]
    fn test_quality_bands() {
        assert_eq!(QualitySettings::new(90).avif_speed(), 6);
        assert_eq!(QualitySettings::new(75).avif_speed(), 7);
        assert_eq!(QualitySettings::new(55).avif_speed(), 8);
        assert_eq!(QualitySettings::new(10).avif_speed(), 9);
        assert_eq!(QualitySettings::new(80).webp_filter_strength(), 20);
        assert_eq!(QualitySettings::new(79).webp_filter_strength(), 30);
        assert_eq!(QualitySettings::new(59).webp_filter_strength(), 40);
        assert_eq!(QualitySettings::new(200).webp_sns_strength(), 50);
    }

    #[test]
    fn test_quality_percent_rounding() {
        let request = EncodeRequest {
            format: OutputFormat::Webp,
            quality: 0.855,
            lossless: false,
            icc: None,
        };
        assert_eq!(request.quality_percent(), 86);
        let floor = EncodeRequest {
            quality: 0.0,
            ..request
        };
        assert_eq!(floor.quality_percent(), 1);
    }

    #[test]
    fn test_encode_jpeg_decodes_back() {
        let img = create_test_image(64, 48);
        let bytes = encode_jpeg(&img, 80, None).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
    }

    #[test]
    fn test_lower_jpeg_quality_is_smaller() {
        let img = create_test_image(128, 128);
        let high = encode_jpeg(&img, 95, None).unwrap();
        let low = encode_jpeg(&img, 20, None).unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn test_encode_png_is_lossless() {
        let img = create_test_image_rgba(20, 10);
        let bytes = encode_png(&img, None).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.to_rgba8(), img.to_rgba8());
    }

    #[test]
    fn test_encode_webp_lossless_roundtrips_pixels() {
        let img = create_test_image(16, 16);
        let bytes = encode_webp(&img, 80, true, None).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.to_rgb8(), img.to_rgb8());
    }

    #[test]
    fn test_encode_webp_keeps_alpha() {
        let img = create_test_image_rgba(16, 16);
        let bytes = encode_webp(&img, 80, true, None).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert!(decoded.color().has_alpha());
    }

    #[test]
    fn test_encode_avif_produces_ftyp() {
        let img = create_test_image(32, 32);
        let bytes = encode_avif(&img, 40, None).unwrap();
        assert_eq!(&bytes[4..8], b"ftyp");
    }

    #[test]
    fn test_native_encoder_dispatch() {
        let img = create_test_image(8, 8);
        let encoder = NativeEncoder;
        for format in [OutputFormat::Jpeg, OutputFormat::Png, OutputFormat::Webp] {
            let request = EncodeRequest {
                format,
                quality: 0.7,
                lossless: false,
                icc: None,
            };
            let bytes = encoder.encode(&img, &request).unwrap();
            let detected = image::guess_format(&bytes).unwrap();
            assert_eq!(
                crate::engine::decoder::format_name(detected),
                format.as_str()
            );
        }
    }

    #[test]
    fn test_empty_image_is_refused() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(encode_jpeg(&img, 80, None).is_err());
        assert!(encode_webp(&img, 80, false, None).is_err());
        assert!(encode_png(&img, None).is_err());
    }
}
