// src/engine/decoder.rs
//
// Decoder operations: JPEG (mozjpeg), PNG (zune-png), WebP (libwebp), and the
// image crate for everything else (gif, bmp, tiff).

use crate::config::EngineConfig;
use crate::engine::common::run_with_panic_policy;
use crate::error::LeanImageError;
use image::{DynamicImage, GrayAlphaImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use mozjpeg::Decompress;
use resvg::{tiny_skia, usvg};
use webp::{BitstreamFeatures, Decoder as WebPDecoder};
use zune_core::bytestream::ZCursor;
use zune_core::colorspace::ColorSpace;
use zune_core::options::DecoderOptions;
use zune_png::PngDecoder;

// Keep the error taxonomy intact: decode errors stay CodecError/ResourceLimit.
type DecoderResult<T> = std::result::Result<T, LeanImageError>;

/// Decode JPEG using mozjpeg (backed by libjpeg-turbo)
pub fn decode_jpeg_mozjpeg(data: &[u8], limits: &EngineConfig) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:mozjpeg", || {
        if !data.windows(2).any(|pair| pair == [0xFF, 0xD9]) {
            return Err(LeanImageError::decode_failed(
                "mozjpeg: missing JPEG EOI marker",
            ));
        }

        let decompress = Decompress::new_mem(data).map_err(|e| {
            LeanImageError::decode_failed(format!("mozjpeg decompress init failed: {e:?}"))
        })?;

        let mut decompress = decompress.rgb().map_err(|e| {
            LeanImageError::decode_failed(format!("mozjpeg rgb conversion failed: {e:?}"))
        })?;

        let width = u32::try_from(decompress.width())
            .map_err(|_| LeanImageError::corrupted_image())?;
        let height = u32::try_from(decompress.height())
            .map_err(|_| LeanImageError::corrupted_image())?;
        limits.check_dimensions(width, height)?;

        let pixels: Vec<[u8; 3]> = decompress.read_scanlines().map_err(|e| {
            LeanImageError::decode_failed(format!("mozjpeg: failed to read scanlines: {e:?}"))
        })?;
        let flat_pixels: Vec<u8> = pixels.into_iter().flatten().collect();

        let rgb_image = RgbImage::from_raw(width, height, flat_pixels).ok_or_else(|| {
            LeanImageError::decode_failed("mozjpeg: truncated scanline data")
        })?;

        Ok(DynamicImage::ImageRgb8(rgb_image))
    })
}

/// Decode gif/bmp/tiff (and anything else the image crate knows).
pub fn decode_with_image_crate(data: &[u8], limits: &EngineConfig) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:image", || {
        let img = image::load_from_memory(data)
            .map_err(|e| LeanImageError::decode_failed(format!("decode failed: {e}")))?;
        limits.check_dimensions(img.width(), img.height())?;
        Ok(img)
    })
}

/// Decode PNG using zune-png. 16-bit input is stripped to 8-bit.
pub fn decode_png_zune(data: &[u8], limits: &EngineConfig) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:png", || {
        let options = DecoderOptions::default().png_set_strip_to_8bit(true);
        let mut decoder = PngDecoder::new_with_options(ZCursor::new(data), options);

        // Header first: refuse bombs before allocating the pixel buffer.
        decoder
            .decode_headers()
            .map_err(|e| LeanImageError::decode_failed(format!("png: bad header: {e}")))?;
        let (width, height) = decoder
            .dimensions()
            .ok_or_else(|| LeanImageError::decode_failed("png: missing header info"))?;
        let (width, height) = (width as u32, height as u32);
        limits.check_dimensions(width, height)?;

        let pixels = decoder
            .decode()
            .map_err(|e| LeanImageError::decode_failed(format!("png: decode failed: {e}")))?;

        let buf = match pixels {
            zune_core::result::DecodingResult::U8(v) => v,
            _ => {
                return Err(LeanImageError::decode_failed(
                    "png: unexpected non-U8 pixel buffer",
                ))
            }
        };

        let colorspace = decoder
            .colorspace()
            .ok_or_else(|| LeanImageError::decode_failed("png: missing colorspace"))?;

        let img = match colorspace {
            ColorSpace::RGB => RgbImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| LeanImageError::decode_failed("png: failed to build RGB image"))?,
            ColorSpace::RGBA => RgbaImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgba8)
                .ok_or_else(|| LeanImageError::decode_failed("png: failed to build RGBA image"))?,
            ColorSpace::Luma => GrayImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| LeanImageError::decode_failed("png: failed to build Luma image"))?,
            ColorSpace::LumaA => GrayAlphaImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageLumaA8)
                .ok_or_else(|| LeanImageError::decode_failed("png: failed to build LumaA image"))?,
            other => {
                return Err(LeanImageError::decode_failed(format!(
                    "png: unsupported colorspace {other:?}"
                )))
            }
        };

        Ok(img)
    })
}

/// Decode WebP using libwebp. Animated files keep only their first frame.
pub fn decode_webp_libwebp(data: &[u8], limits: &EngineConfig) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:webp", || {
        // Parse header first to avoid allocating huge buffers on malformed files
        let features = BitstreamFeatures::new(data).ok_or_else(|| {
            LeanImageError::decode_failed("webp: failed to read bitstream features")
        })?;
        limits.check_dimensions(features.width(), features.height())?;

        if features.has_animation() {
            return image::load_from_memory(data).map_err(|e| {
                LeanImageError::decode_failed(format!("webp (animated) decode failed: {e}"))
            });
        }

        let decoded = WebPDecoder::new(data)
            .decode()
            .ok_or_else(|| LeanImageError::decode_failed("webp: decode failed"))?;
        limits.check_dimensions(decoded.width(), decoded.height())?;

        Ok(decoded.to_image())
    })
}

/// Detect input format using magic bytes. Returns None if unknown.
pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

/// Short lowercase name for a detected format.
pub fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Png => "png",
        ImageFormat::WebP => "webp",
        ImageFormat::Gif => "gif",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Tiff => "tiff",
        ImageFormat::Avif => "avif",
        _ => "other",
    }
}

/// Rasterize SVG at its intrinsic size. Output is straight-alpha RGBA.
pub fn decode_svg_resvg(data: &[u8], limits: &EngineConfig) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:svg", || {
        let tree = usvg::Tree::from_data(data, &usvg::Options::default())
            .map_err(|e| LeanImageError::decode_failed(format!("svg parse failed: {e}")))?;

        let size = tree.size().to_int_size();
        let (width, height) = (size.width(), size.height());
        limits.check_dimensions(width, height)?;

        let mut pixmap = tiny_skia::Pixmap::new(width, height).ok_or_else(|| {
            LeanImageError::decode_failed(format!("svg: cannot allocate {width}x{height} canvas"))
        })?;
        resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());

        // tiny-skia keeps premultiplied pixels
        let rgba: Vec<u8> = pixmap
            .pixels()
            .iter()
            .flat_map(|px| {
                let c = px.demultiply();
                [c.red(), c.green(), c.blue(), c.alpha()]
            })
            .collect();
        let image = RgbaImage::from_raw(width, height, rgba).ok_or_else(|| {
            LeanImageError::decode_failed("svg: rendered buffer does not match canvas size")
        })?;
        Ok(DynamicImage::ImageRgba8(image))
    })
}

/// SVG is text, so it has no magic bytes to detect.
pub fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(512)];
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    trimmed.starts_with("<svg") || (trimmed.starts_with("<?xml") && text.contains("<svg"))
}

/// Unified decode entrypoint:
/// - Detect format once (magic bytes)
/// - Route JPEG/PNG/WebP to their native decoders, others to the image crate
/// - Rasterize SVG (no magic bytes, so `None` is returned as the format)
/// - Return decoded image and detected format
pub fn decode_image(
    bytes: &[u8],
    limits: &EngineConfig,
) -> DecoderResult<(DynamicImage, Option<ImageFormat>)> {
    if bytes.is_empty() {
        return Err(LeanImageError::decode_failed("empty input"));
    }
    let detected = detect_format(bytes);
    let img = match detected {
        Some(ImageFormat::Jpeg) => decode_jpeg_mozjpeg(bytes, limits)?,
        Some(ImageFormat::Png) => decode_png_zune(bytes, limits)?,
        Some(ImageFormat::WebP) => decode_webp_libwebp(bytes, limits)?,
        Some(ImageFormat::Gif | ImageFormat::Bmp | ImageFormat::Tiff) => {
            decode_with_image_crate(bytes, limits)?
        }
        Some(other) => {
            return Err(LeanImageError::unsupported_format(format_name(other)));
        }
        None if looks_like_svg(bytes) => decode_svg_resvg(bytes, limits)?,
        None => {
            return Err(LeanImageError::decode_failed(
                "unrecognized image data (no known magic bytes)",
            ));
        }
    };
    Ok((img, detected))
}
