// src/engine/pipeline.rs
//
// Transform stage: crop -> resize -> orient (rotate + flip in one remap) -> filters.

use crate::config::EngineConfig;
use crate::error::LeanImageError;
use crate::ops::{CropSettings, FilterSettings, FlipSettings, Rotation, TransformSettings};
use fast_image_resize::{self as fir, ImageBufferError, MulDiv, PixelType, ResizeOptions};
use image::{imageops::FilterType, DynamicImage, RgbImage, RgbaImage};
use std::borrow::Cow;

type PipelineResult<T> = std::result::Result<T, LeanImageError>;

/// Output of the transform stage. `width`/`height` always match `image`.
#[derive(Debug, Clone)]
pub struct TransformedImage {
    pub image: DynamicImage,
    pub width: u32,
    pub height: u32,
}

impl TransformedImage {
    pub fn new(image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        Self {
            image,
            width,
            height,
        }
    }
}

/// Apply `settings` to a decoded bitmap. Deterministic; the input is never
/// modified (a borrowed image is only cloned when a step has to touch it).
/// A resize target beyond `config`'s limits is scaled down, aspect kept.
pub fn apply_transform(
    img: Cow<'_, DynamicImage>,
    settings: &TransformSettings,
    config: &EngineConfig,
) -> PipelineResult<TransformedImage> {
    let mut img = img;

    if settings.crop.enabled {
        img = Cow::Owned(crop_to_bounds(&img, &settings.crop)?);
    }

    if settings.resize.enabled {
        let (w, h) = (img.width(), img.height());
        let (rw, rh) = settings.resize.target_dimensions(w, h);
        let (tw, th) = config.fit_within_limits(rw, rh);
        if (tw, th) != (rw, rh) {
            tracing::warn!(
                requested_width = rw,
                requested_height = rh,
                width = tw,
                height = th,
                "resize target exceeds engine limits, scaled down"
            );
        }
        if (tw, th) != (w, h) {
            img = Cow::Owned(resample(&img, tw, th)?);
        }
    }

    if settings.rotate != Rotation::Deg0 || settings.flip.horizontal || settings.flip.vertical {
        img = Cow::Owned(orient(&img, settings.rotate, settings.flip)?);
    }

    if settings.filters.is_active() {
        let mut owned = into_rgb_layout(img.into_owned());
        apply_filters(&mut owned, &settings.filters);
        img = Cow::Owned(owned);
    }

    Ok(TransformedImage::new(img.into_owned()))
}

/// Intersect the crop rectangle with the image. An empty intersection is an error.
pub fn crop_to_bounds(img: &DynamicImage, crop: &CropSettings) -> PipelineResult<DynamicImage> {
    let (img_w, img_h) = (img.width(), img.height());
    let x0 = crop.x.min(img_w);
    let y0 = crop.y.min(img_h);
    let x1 = crop.x.saturating_add(crop.width).min(img_w);
    let y1 = crop.y.saturating_add(crop.height).min(img_h);
    if x1 <= x0 || y1 <= y0 {
        return Err(LeanImageError::invalid_crop_bounds(
            crop.x,
            crop.y,
            crop.width,
            crop.height,
            img_w,
            img_h,
        ));
    }
    if (x0, y0, x1, y1) == (0, 0, img_w, img_h) {
        return Ok(img.clone());
    }
    Ok(img.crop_imm(x0, y0, x1 - x0, y1 - y0))
}

/// Normalize to Rgb8/Rgba8, the two layouts the remap and filter passes handle.
fn into_rgb_layout(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => img,
        other if other.color().has_alpha() => DynamicImage::ImageRgba8(other.to_rgba8()),
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

// =============================================================================
// ORIENTATION
// =============================================================================

/// Rotate then flip, as a single inverse-mapped pixel pass.
///
/// Coordinates are doubled and centred (`u = 2x + 1 - w`) so every pixel
/// centre is an integer and the mapping has no rounding. For each output pixel
/// the flip is undone first, then the rotation.
pub fn orient(
    img: &DynamicImage,
    rotation: Rotation,
    flip: FlipSettings,
) -> PipelineResult<DynamicImage> {
    match into_rgb_layout(img.clone()) {
        DynamicImage::ImageRgba8(rgba) => {
            let (w, h) = rgba.dimensions();
            let (pixels, ow, oh) = remap(rgba.as_raw(), w, h, 4, rotation, flip);
            RgbaImage::from_raw(ow, oh, pixels)
                .map(DynamicImage::ImageRgba8)
                .ok_or_else(|| remap_size_mismatch((w, h), (ow, oh)))
        }
        other => {
            let rgb = match other {
                DynamicImage::ImageRgb8(rgb) => rgb,
                converted => converted.to_rgb8(),
            };
            let (w, h) = rgb.dimensions();
            let (pixels, ow, oh) = remap(rgb.as_raw(), w, h, 3, rotation, flip);
            RgbImage::from_raw(ow, oh, pixels)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| remap_size_mismatch((w, h), (ow, oh)))
        }
    }
}

fn remap_size_mismatch(src: (u32, u32), dst: (u32, u32)) -> LeanImageError {
    LeanImageError::resize_failed(src, dst, "orientation remap produced a buffer of the wrong size")
}

fn remap(
    src: &[u8],
    w: u32,
    h: u32,
    channels: usize,
    rotation: Rotation,
    flip: FlipSettings,
) -> (Vec<u8>, u32, u32) {
    let (ow, oh) = if rotation.swaps_dimensions() {
        (h, w)
    } else {
        (w, h)
    };
    let mut dst = vec![0u8; ow as usize * oh as usize * channels];
    let (wi, hi, owi, ohi) = (w as i64, h as i64, ow as i64, oh as i64);
    let src_stride = w as usize * channels;

    for (oy, row) in dst.chunks_exact_mut(ow as usize * channels).enumerate() {
        let mut v = 2 * oy as i64 + 1 - ohi;
        if flip.vertical {
            v = -v;
        }
        for (ox, px) in row.chunks_exact_mut(channels).enumerate() {
            let mut u = 2 * ox as i64 + 1 - owi;
            if flip.horizontal {
                u = -u;
            }
            let (su, sv) = match rotation {
                Rotation::Deg0 => (u, v),
                Rotation::Deg90 => (v, -u),
                Rotation::Deg180 => (-u, -v),
                Rotation::Deg270 => (-v, u),
            };
            let sx = ((su + wi - 1) / 2) as usize;
            let sy = ((sv + hi - 1) / 2) as usize;
            let offset = sy * src_stride + sx * channels;
            px.copy_from_slice(&src[offset..offset + channels]);
        }
    }
    (dst, ow, oh)
}

// =============================================================================
// TONAL FILTERS
// =============================================================================

/// `259 * (C + 255) / (255 * (259 - C))` with `C = contrast * 2.55`.
/// Exactly 1.0 at contrast 0; finite for every clamped contrast.
pub fn contrast_factor(contrast: i32) -> f32 {
    let c = contrast.clamp(-100, 100) as f32 * 2.55;
    259.0 * (c + 255.0) / (255.0 * (259.0 - c))
}

/// One pass over RGB (alpha untouched): grayscale, then brightness, then
/// contrast, each clamped to [0, 255].
pub fn apply_filters(img: &mut DynamicImage, filters: &FilterSettings) {
    let channels = match img {
        DynamicImage::ImageRgb8(_) => 3,
        DynamicImage::ImageRgba8(_) => 4,
        _ => {
            *img = into_rgb_layout(img.clone());
            return apply_filters(img, filters);
        }
    };
    let pixels: &mut [u8] = match img {
        DynamicImage::ImageRgb8(rgb) => &mut **rgb,
        DynamicImage::ImageRgba8(rgba) => &mut **rgba,
        _ => return,
    };

    let grayscale = filters.grayscale;
    let brightness = filters.brightness() as f32 / 100.0 * 255.0;
    let contrast = (filters.contrast() != 0).then(|| contrast_factor(filters.contrast()));

    for px in pixels.chunks_exact_mut(channels) {
        let mut rgb = [px[0] as f32, px[1] as f32, px[2] as f32];
        if grayscale {
            let g = 0.299 * rgb[0] + 0.587 * rgb[1] + 0.114 * rgb[2];
            rgb = [g.clamp(0.0, 255.0); 3];
        }
        if brightness != 0.0 {
            for c in &mut rgb {
                *c = (*c + brightness).clamp(0.0, 255.0);
            }
        }
        if let Some(factor) = contrast {
            for c in &mut rgb {
                *c = (factor * (*c - 128.0) + 128.0).clamp(0.0, 255.0);
            }
        }
        for (dst, value) in px.iter_mut().zip(rgb) {
            *dst = value.round() as u8;
        }
    }
}

// =============================================================================
// RESAMPLING (fast_image_resize, image crate fallback)
// =============================================================================

/// Resample to exactly `dst_width`x`dst_height`. The source is left untouched.
pub fn resample(img: &DynamicImage, dst_width: u32, dst_height: u32) -> PipelineResult<DynamicImage> {
    if (img.width(), img.height()) == (dst_width, dst_height) {
        return Ok(img.clone());
    }
    fast_resize_owned(img.clone(), dst_width, dst_height)
}

/// Scale both axes by `scale`, rounding to the nearest pixel (minimum 1).
pub fn scaled_dimensions(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let apply = |v: u32| ((v as f32 * scale).round() as u32).max(1);
    (apply(width), apply(height))
}

fn default_resize_options() -> ResizeOptions {
    ResizeOptions::new().resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3))
}

/// Resize an owned image; RGB8/RGBA8 buffers are handed to fir without copying.
pub fn fast_resize_owned(
    img: DynamicImage,
    dst_width: u32,
    dst_height: u32,
) -> PipelineResult<DynamicImage> {
    let (src_width, src_height) = (img.width(), img.height());
    let fail = |reason: String| {
        LeanImageError::resize_failed((src_width, src_height), (dst_width, dst_height), reason)
    };

    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return Err(fail("invalid dimensions for resize".to_string()));
    }

    let (pixel_type, src_pixels): (PixelType, Vec<u8>) = match img {
        DynamicImage::ImageRgb8(rgb) => (PixelType::U8x3, rgb.into_raw()),
        DynamicImage::ImageRgba8(rgba) => (PixelType::U8x4, rgba.into_raw()),
        other if other.color().has_alpha() => (PixelType::U8x4, other.to_rgba8().into_raw()),
        other => (PixelType::U8x3, other.to_rgb8().into_raw()),
    };

    fast_resize_internal(
        src_width, src_height, src_pixels, pixel_type, dst_width, dst_height,
    )
    .map_err(fail)
}

fn fast_resize_internal(
    src_width: u32,
    src_height: u32,
    mut src_pixels: Vec<u8>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
) -> std::result::Result<DynamicImage, String> {
    let required_bytes = (src_width as usize)
        .checked_mul(src_height as usize)
        .and_then(|n| n.checked_mul(pixel_type.size()))
        .ok_or_else(|| "image buffer size overflow during resize".to_string())?;

    if src_pixels.len() < required_bytes {
        return Err(format!(
            "source buffer is {} bytes, expected {required_bytes}",
            src_pixels.len()
        ));
    }

    let options = default_resize_options();
    let primary_result = match fir::images::Image::from_slice_u8(
        src_width,
        src_height,
        src_pixels.as_mut_slice(),
        pixel_type,
    ) {
        Ok(src_image) => resize_with_source_image(src_image, pixel_type, dst_width, dst_height, &options),
        Err(ImageBufferError::InvalidBufferAlignment) => {
            let mut aligned = fir::images::Image::new(src_width, src_height, pixel_type);
            aligned
                .buffer_mut()
                .copy_from_slice(&src_pixels[..required_bytes]);
            resize_with_source_image(aligned, pixel_type, dst_width, dst_height, &options)
        }
        Err(other) => Err(format!("fir source image error: {other:?}")),
    };

    match primary_result {
        Ok(img) => Ok(img),
        Err(err) => {
            tracing::debug!(%err, "fir resize failed, falling back to image crate");
            resize_with_image_crate(&src_pixels, src_width, src_height, pixel_type, dst_width, dst_height)
                .map_err(|fallback_err| format!("{err}; image crate fallback failed: {fallback_err}"))
        }
    }
}

fn resize_with_image_crate(
    src_pixels: &[u8],
    src_width: u32,
    src_height: u32,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
) -> std::result::Result<DynamicImage, String> {
    let filter = FilterType::Lanczos3;
    match pixel_type {
        PixelType::U8x3 => {
            let rgb = RgbImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build rgb image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageRgb8(image::imageops::resize(
                &rgb, dst_width, dst_height, filter,
            )))
        }
        PixelType::U8x4 => {
            let rgba = RgbaImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build rgba image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageRgba8(image::imageops::resize(
                &rgba, dst_width, dst_height, filter,
            )))
        }
        _ => Err("fallback resize supports only U8x3/U8x4 pixel types".to_string()),
    }
}

fn resize_with_source_image(
    mut src_image: fir::images::Image<'_>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    options: &ResizeOptions,
) -> std::result::Result<DynamicImage, String> {
    let mut dst_image = fir::images::Image::new(dst_width, dst_height, pixel_type);

    // Opaque RGBA needs no premultiply round trip.
    let needs_premultiply = pixel_type == PixelType::U8x4
        && !src_image.buffer().iter().skip(3).step_by(4).all(|&a| a == 255);

    let mul_div = MulDiv::default();
    if needs_premultiply {
        mul_div
            .multiply_alpha_inplace(&mut src_image)
            .map_err(|e| format!("failed to premultiply alpha: {e}"))?;
    }

    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, options)
        .map_err(|e| format!("fir resize error: {e:?}"))?;

    if needs_premultiply {
        mul_div
            .divide_alpha_inplace(&mut dst_image)
            .map_err(|e| format!("failed to unpremultiply alpha: {e}"))?;
    }

    let dst_pixels = dst_image.into_vec();
    match pixel_type {
        PixelType::U8x3 => RgbImage::from_raw(dst_width, dst_height, dst_pixels)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| "failed to create rgb image from resized data".to_string()),
        PixelType::U8x4 => RgbaImage::from_raw(dst_width, dst_height, dst_pixels)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| "failed to create rgba image from resized data".to_string()),
        _ => Err("unsupported pixel type after resize".to_string()),
    }
}
