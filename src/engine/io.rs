// src/engine/io.rs
//
// I/O operations: Source enum, SourceImage loading, and ICC profile extraction

use crate::engine::decoder::{detect_format, format_name, looks_like_svg};
use crate::error::LeanImageError;
use image::ImageFormat;
use img_parts::{jpeg::Jpeg, png::Png, webp::WebP, ImageICC};
use memmap2::Mmap;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

type IoResult<T> = std::result::Result<T, LeanImageError>;

/// Raw encoded bytes - either owned or memory-mapped.
#[derive(Clone, Debug)]
pub enum Source {
    /// In-memory image data
    Memory(Arc<Vec<u8>>),
    /// Memory-mapped file (zero-copy access)
    Mapped(Arc<Mmap>),
}

impl Source {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Source::Memory(data) => data.as_slice(),
            Source::Mapped(mmap) => mmap.as_ref(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A user-supplied image, as received. Never mutated by the pipeline.
///
/// Construction never decodes and never fails on undecodable bytes: a file that
/// cannot be read as an image is still a valid batch member, it just errors
/// when converted.
#[derive(Clone, Debug)]
pub struct SourceImage {
    name: String,
    source: Source,
    declared_format: Option<String>,
    detected_format: Option<ImageFormat>,
    dimensions: Option<(u32, u32)>,
}

impl SourceImage {
    /// Wrap in-memory bytes. `declared_format` is whatever the caller was told
    /// (MIME type or extension) and is kept for reporting only.
    pub fn from_bytes(
        name: impl Into<String>,
        bytes: Vec<u8>,
        declared_format: Option<&str>,
    ) -> Self {
        Self::from_source(
            name.into(),
            Source::Memory(Arc::new(bytes)),
            declared_format.map(str::to_string),
        )
    }

    /// Memory-map a file. The declared format is taken from its extension.
    pub fn from_path(path: impl AsRef<Path>) -> IoResult<Self> {
        let path = path.as_ref();
        let display = path.to_string_lossy().to_string();
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LeanImageError::file_not_found(display.clone())
            } else {
                LeanImageError::file_read_failed(display.clone(), e)
            }
        })?;
        let len = file
            .metadata()
            .map_err(|e| LeanImageError::file_read_failed(display.clone(), e))?
            .len();

        // Zero-length files cannot be mapped on every platform.
        let source = if len == 0 {
            Source::Memory(Arc::new(Vec::new()))
        } else {
            // Safety: the file must not be truncated while mapped. Sources are
            // user files opened for the duration of one batch.
            let mmap = unsafe { Mmap::map(&file) }
                .map_err(|e| LeanImageError::mmap_failed(display.clone(), e))?;
            Source::Mapped(Arc::new(mmap))
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| display.clone());
        let declared = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
        Ok(Self::from_source(name, source, declared))
    }

    fn from_source(name: String, source: Source, declared_format: Option<String>) -> Self {
        let bytes = source.as_bytes();
        let detected_format = detect_format(bytes);
        let dimensions = read_header_dimensions(bytes);
        Self {
            name,
            source,
            declared_format,
            detected_format,
            dimensions,
        }
    }

    /// Display name (file name for path sources).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File name without its extension, used for output naming.
    pub fn stem(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.name,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.source.as_bytes()
    }

    pub fn byte_size(&self) -> u64 {
        self.source.len() as u64
    }

    /// Pixel dimensions from the header, if the header was readable.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    pub fn declared_format(&self) -> Option<&str> {
        self.declared_format.as_deref()
    }

    pub fn detected_format(&self) -> Option<ImageFormat> {
        self.detected_format
    }

    /// Format name for reporting: magic-byte detection first, then SVG
    /// sniffing, then whatever the caller declared.
    pub fn format_label(&self) -> String {
        match (self.detected_format, &self.declared_format) {
            (Some(format), _) => format_name(format).to_string(),
            _ if looks_like_svg(self.bytes()) => "svg".to_string(),
            (None, Some(declared)) => declared.clone(),
            (None, None) => "unknown".to_string(),
        }
    }

    /// Validated ICC profile embedded in the source, if any.
    pub fn icc_profile(&self) -> Option<Vec<u8>> {
        extract_icc_profile(self.bytes())
    }
}

fn read_header_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Extract ICC profile from image data.
/// Supports JPEG (APP2 marker), PNG (iCCP chunk), and WebP (ICCP chunk).
pub fn extract_icc_profile(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 12 {
        return None;
    }

    let icc_data = if data[0] == 0xFF && data[1] == 0xD8 {
        Jpeg::from_bytes(data.to_vec().into()).ok()?.icc_profile()?
    } else if data[0..4] == [0x89, b'P', b'N', b'G'] {
        Png::from_bytes(data.to_vec().into()).ok()?.icc_profile()?
    } else if &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        WebP::from_bytes(data.to_vec().into()).ok()?.icc_profile()?
    } else {
        return None;
    };

    let icc_data = icc_data.to_vec();
    if validate_icc_profile(&icc_data) {
        Some(icc_data)
    } else {
        tracing::debug!(len = icc_data.len(), "dropping malformed ICC profile");
        None
    }
}

fn is_signature_byte(byte: u8) -> bool {
    (32..=126).contains(&byte) || byte == 0
}

/// Validate an ICC profile header (the first 128 bytes).
pub(crate) fn validate_icc_profile(icc_data: &[u8]) -> bool {
    if icc_data.len() < 128 {
        return false;
    }

    // Declared size (bytes 0-3, big-endian) must match the data.
    let profile_size =
        u32::from_be_bytes([icc_data[0], icc_data[1], icc_data[2], icc_data[3]]) as usize;
    if profile_size != icc_data.len() {
        return false;
    }

    // Major version is 2, 4 or 5 in practice.
    if icc_data[8] > 10 {
        return false;
    }

    // CMM type, profile class, color space, PCS: four-byte ASCII signatures.
    [4..8, 12..16, 16..20, 20..24]
        .into_iter()
        .all(|range| icc_data[range].iter().copied().all(is_signature_byte))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::encoder::{encode_jpeg, encode_png, encode_webp};
    use image::{DynamicImage, RgbImage};

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    fn create_minimal_png() -> Vec<u8> {
        let mut buf = Vec::new();
        create_test_image(4, 3)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    pub(crate) fn create_minimal_srgb_icc() -> Vec<u8> {
        let mut data = vec![0u8; 128];
        data[0..4].copy_from_slice(&128u32.to_be_bytes());
        data[4..8].copy_from_slice(b"ADBE");
        data[8] = 2;
        data[12..16].copy_from_slice(b"mntr");
        data[16..20].copy_from_slice(b"RGB ");
        data[20..24].copy_from_slice(b"XYZ ");
        data
    }

    #[test]
    fn test_source_image_reads_header() {
        let src = SourceImage::from_bytes("tiny.png", create_minimal_png(), Some("image/png"));
        assert_eq!(src.dimensions(), Some((4, 3)));
        assert_eq!(src.detected_format(), Some(ImageFormat::Png));
        assert_eq!(src.declared_format(), Some("image/png"));
        assert_eq!(src.format_label(), "png");
        assert_eq!(src.stem(), "tiny");
    }

    #[test]
    fn test_source_image_accepts_garbage() {
        let src = SourceImage::from_bytes("junk.jpg", b"definitely not an image".to_vec(), None);
        assert_eq!(src.dimensions(), None);
        assert_eq!(src.detected_format(), None);
        assert_eq!(src.byte_size(), 23);
        assert_eq!(src.format_label(), "unknown");
    }

    #[test]
    fn test_svg_source_is_labelled_svg() {
        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="2" height="2"/>"#;
        let src = SourceImage::from_bytes("icon.svg", svg.to_vec(), Some("image/svg+xml"));
        assert_eq!(src.detected_format(), None);
        assert_eq!(src.format_label(), "svg");
    }

    #[test]
    fn test_from_path_maps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.PNG");
        std::fs::write(&path, create_minimal_png()).unwrap();
        let src = SourceImage::from_path(&path).unwrap();
        assert!(matches!(src.source, Source::Mapped(_)));
        assert_eq!(src.name(), "photo.PNG");
        assert_eq!(src.declared_format(), Some("png"));
        assert_eq!(src.dimensions(), Some((4, 3)));
    }

    #[test]
    fn test_from_path_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.webp");
        std::fs::write(&path, b"").unwrap();
        let src = SourceImage::from_path(&path).unwrap();
        assert_eq!(src.byte_size(), 0);
        assert!(src.dimensions().is_none());
    }

    #[test]
    fn test_from_path_missing_file() {
        let err = SourceImage::from_path("/nonexistent/definitely/missing.png").unwrap_err();
        assert!(matches!(err, LeanImageError::FileNotFound { .. }));
    }

    #[test]
    fn test_validate_icc_profile() {
        let icc = create_minimal_srgb_icc();
        assert!(validate_icc_profile(&icc));
        assert!(!validate_icc_profile(&icc[..64]));
        assert!(!validate_icc_profile(&[]));

        let mut wrong_size = icc.clone();
        wrong_size[3] = 0x81;
        assert!(!validate_icc_profile(&wrong_size));

        let mut bad_version = icc.clone();
        bad_version[8] = 42;
        assert!(!validate_icc_profile(&bad_version));

        let mut bad_signature = icc;
        bad_signature[13] = 0x07;
        assert!(!validate_icc_profile(&bad_signature));
    }

    #[test]
    fn test_extract_icc_none_without_profile() {
        assert!(extract_icc_profile(&create_minimal_png()).is_none());
        assert!(extract_icc_profile(b"not an image at all").is_none());
        assert!(extract_icc_profile(&[]).is_none());
    }

    #[test]
    fn test_icc_roundtrip_through_encoders() {
        let icc = create_minimal_srgb_icc();
        let img = create_test_image(32, 32);

        let jpeg = encode_jpeg(&img, 80, Some(&icc)).unwrap();
        assert_eq!(extract_icc_profile(&jpeg), Some(icc.clone()));

        let png = encode_png(&img, Some(&icc)).unwrap();
        assert_eq!(extract_icc_profile(&png), Some(icc.clone()));

        let webp = encode_webp(&img, 80, false, Some(&icc)).unwrap();
        assert_eq!(extract_icc_profile(&webp), Some(icc));
    }
}
