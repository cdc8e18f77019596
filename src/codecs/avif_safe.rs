// src/codecs/avif_safe.rs
//
// RAII wrappers around the libavif encode path.
// Raw pointers stay in this file; callers only see owned handles.
#![deny(unsafe_op_in_unsafe_fn)]

use crate::config::{MAX_DIMENSION, MAX_PIXELS};
use crate::error::LeanImageError;
use libavif_sys::*;
use std::ptr::NonNull;

type AvifResult<T> = std::result::Result<T, LeanImageError>;

fn avif_error(stage: &str, result: avifResult) -> LeanImageError {
    LeanImageError::encode_failed("avif", format!("{stage} failed: {result:?}"))
}

fn check(stage: &str, result: avifResult) -> AvifResult<()> {
    if result == AVIF_RESULT_OK {
        Ok(())
    } else {
        Err(avif_error(stage, result))
    }
}

/// An owned `avifImage` holding YUV planes converted from RGBA8 pixels.
pub struct AvifFrame {
    ptr: NonNull<avifImage>,
}

// The frame is only touched by the thread that owns it.
unsafe impl Send for AvifFrame {}

impl AvifFrame {
    fn validate_dimensions(width: u32, height: u32) -> AvifResult<()> {
        if width == 0 || height == 0 {
            return Err(LeanImageError::encode_failed(
                "avif",
                format!("empty frame {width}x{height}"),
            ));
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(LeanImageError::dimension_exceeds_limit(
                width.max(height),
                MAX_DIMENSION,
            ));
        }
        let pixels = width as u64 * height as u64;
        if pixels > MAX_PIXELS {
            return Err(LeanImageError::pixel_count_exceeds_limit(pixels, MAX_PIXELS));
        }
        Ok(())
    }

    /// Build a 4:2:0 sRGB frame from tightly packed RGBA8 pixels.
    pub fn from_rgba(pixels: &[u8], width: u32, height: u32) -> AvifResult<Self> {
        Self::validate_dimensions(width, height)?;
        let row_bytes = width
            .checked_mul(4)
            .ok_or_else(|| LeanImageError::encode_failed("avif", "row bytes overflow"))?;
        let expected = row_bytes as usize * height as usize;
        if pixels.len() != expected {
            return Err(LeanImageError::encode_failed(
                "avif",
                format!("pixel buffer is {} bytes, expected {expected}", pixels.len()),
            ));
        }

        let raw = unsafe { avifImageCreate(width, height, 8, AVIF_PIXEL_FORMAT_YUV420) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| LeanImageError::encode_failed("avif", "avifImageCreate returned null"))?;
        let frame = Self { ptr };

        unsafe {
            let image = frame.ptr.as_ptr();
            (*image).colorPrimaries = AVIF_COLOR_PRIMARIES_BT709 as u16;
            (*image).transferCharacteristics = AVIF_TRANSFER_CHARACTERISTICS_SRGB as u16;
            (*image).matrixCoefficients = AVIF_MATRIX_COEFFICIENTS_BT709 as u16;
            (*image).yuvRange = AVIF_RANGE_FULL;

            let mut rgb: avifRGBImage = std::mem::zeroed();
            avifRGBImageSetDefaults(&mut rgb, image);
            rgb.format = AVIF_RGB_FORMAT_RGBA;
            rgb.depth = 8;
            rgb.rowBytes = row_bytes;
            // libavif only reads from `pixels` during RGB -> YUV conversion.
            rgb.pixels = pixels.as_ptr() as *mut u8;

            // Allocates YUV (and alpha) planes as needed.
            check("avifImageRGBToYUV", avifImageRGBToYUV(image, &rgb))?;
        }

        Ok(frame)
    }

    pub fn set_icc_profile(&mut self, icc: &[u8]) -> AvifResult<()> {
        let result =
            unsafe { avifImageSetProfileICC(self.ptr.as_ptr(), icc.as_ptr(), icc.len()) };
        check("avifImageSetProfileICC", result)
    }

    fn as_ptr(&self) -> *const avifImage {
        self.ptr.as_ptr()
    }
}

impl Drop for AvifFrame {
    fn drop(&mut self) {
        unsafe { avifImageDestroy(self.ptr.as_ptr()) };
    }
}

/// An owned `avifEncoder`.
pub struct AvifEncoderHandle {
    ptr: NonNull<avifEncoder>,
}

unsafe impl Send for AvifEncoderHandle {}

impl AvifEncoderHandle {
    pub fn new() -> AvifResult<Self> {
        let raw = unsafe { avifEncoderCreate() };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            LeanImageError::encode_failed("avif", "avifEncoderCreate returned null")
        })?;
        Ok(Self { ptr })
    }

    /// `quality` is libavif's 0..=100 scale; `speed` 0 (slowest) to 10.
    pub fn configure(&mut self, quality: u8, speed: i32, max_threads: i32) {
        let quality = i32::from(quality.min(100));
        unsafe {
            let raw = self.ptr.as_ptr();
            (*raw).quality = quality;
            (*raw).qualityAlpha = quality;
            (*raw).speed = speed;
            (*raw).maxThreads = max_threads;
        }
    }

    /// Encode one still frame.
    pub fn encode(&mut self, frame: &AvifFrame) -> AvifResult<Vec<u8>> {
        let mut output = AvifOutput::new();
        unsafe {
            check(
                "avifEncoderAddImage",
                avifEncoderAddImage(
                    self.ptr.as_ptr(),
                    frame.as_ptr(),
                    1,
                    AVIF_ADD_IMAGE_FLAG_SINGLE as avifAddImageFlags,
                ),
            )?;
            check(
                "avifEncoderFinish",
                avifEncoderFinish(self.ptr.as_ptr(), &mut output.data),
            )?;
        }
        Ok(output.as_slice().to_vec())
    }
}

impl Drop for AvifEncoderHandle {
    fn drop(&mut self) {
        unsafe { avifEncoderDestroy(self.ptr.as_ptr()) };
    }
}

/// Encoder output buffer, freed with `avifRWDataFree`.
struct AvifOutput {
    data: avifRWData,
}

impl AvifOutput {
    fn new() -> Self {
        Self {
            data: unsafe { std::mem::zeroed() },
        }
    }

    fn as_slice(&self) -> &[u8] {
        if self.data.data.is_null() || self.data.size == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.data.data, self.data.size) }
        }
    }
}

impl Drop for AvifOutput {
    fn drop(&mut self) {
        unsafe { avifRWDataFree(&mut self.data) };
    }
}
