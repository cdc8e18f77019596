use image::{DynamicImage, ImageFormat, RgbImage, RgbaImage};
use lean_image::engine::encoder::EncodeRequest;
use lean_image::engine::pipeline::{apply_filters, apply_transform, contrast_factor, TransformedImage};
use lean_image::engine::search::search;
use lean_image::{
    BatchDriver, BatchObserver, EncodeSettings, EngineConfig, FilterSettings, FlipSettings,
    ImageEncoder, LeanImageError, OutputFormat, ResizeSettings, Rotation, SourceImage,
    TransformSettings,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::borrow::Cow;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

fn create_test_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8])
    }))
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    create_test_image(width, height)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// `None` entries refuse; the rest return that many bytes.
struct ScriptedEncoder {
    sizes: Vec<Option<usize>>,
    calls: Mutex<usize>,
}

impl ImageEncoder for ScriptedEncoder {
    fn encode(&self, _img: &DynamicImage, _request: &EncodeRequest<'_>) -> Result<Vec<u8>, LeanImageError> {
        let mut calls = self.calls.lock();
        let size = self.sizes.get(*calls).copied().flatten();
        *calls += 1;
        size.map(|n| vec![1u8; n])
            .ok_or_else(|| LeanImageError::encode_failed("scripted", "refused"))
    }
}

struct FixedEncoder;

impl ImageEncoder for FixedEncoder {
    fn encode(&self, _img: &DynamicImage, _request: &EncodeRequest<'_>) -> Result<Vec<u8>, LeanImageError> {
        Ok(vec![0u8; 8])
    }
}

#[derive(Default)]
struct ProgressLog(Mutex<Vec<f64>>);

impl BatchObserver for ProgressLog {
    fn on_progress(&self, fraction: f64) {
        self.0.lock().push(fraction);
    }
}

fn rotation_strategy() -> impl Strategy<Value = Rotation> {
    prop_oneof![
        Just(Rotation::Deg0),
        Just(Rotation::Deg90),
        Just(Rotation::Deg180),
        Just(Rotation::Deg270),
    ]
}

fn format_strategy() -> impl Strategy<Value = OutputFormat> {
    prop_oneof![
        Just(OutputFormat::Webp),
        Just(OutputFormat::Avif),
        Just(OutputFormat::Jpeg),
        Just(OutputFormat::Png),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_search_never_returns_larger_than_an_available_smaller_attempt(
        sizes in prop::collection::vec(prop::option::of(1usize..4000), 6),
        original in 1u64..4000,
        format in format_strategy(),
        quality in 1u8..=100,
    ) {
        let encoder = ScriptedEncoder { sizes: sizes.clone(), calls: Mutex::new(0) };
        let source = TransformedImage::new(create_test_image(16, 16));
        let settings = EncodeSettings::new(format, quality);
        let result = search(&encoder, &source, &settings, original, None, &EngineConfig::default());

        let calls = *encoder.calls.lock();
        let tried: Vec<Option<usize>> = sizes[..calls].to_vec();
        let produced: Vec<usize> = tried.iter().flatten().copied().collect();

        match result {
            Ok(result) => {
                prop_assert_eq!(result.attempt_count(), calls);
                let first_smaller = produced.iter().find(|&&n| (n as u64) < original);
                match first_smaller {
                    Some(&n) => {
                        prop_assert!(result.improved);
                        prop_assert_eq!(result.byte_size, n as u64);
                        // the search stops at the first winner
                        prop_assert_eq!(tried.last().copied().flatten(), Some(n));
                    }
                    None => {
                        prop_assert!(!result.improved);
                        prop_assert_eq!(Some(result.byte_size as usize), produced.iter().min().copied());
                    }
                }
            }
            Err(err) => {
                prop_assert!(produced.is_empty());
                let is_exhausted = matches!(err, LeanImageError::EncodeExhausted { .. });
                prop_assert!(is_exhausted);
            }
        }
    }

    #[test]
    fn prop_rotation_swaps_dimensions_on_quarter_turns(
        width in 1u32..64,
        height in 1u32..64,
        rotation in rotation_strategy(),
        horizontal in any::<bool>(),
        vertical in any::<bool>(),
    ) {
        let settings = TransformSettings {
            rotate: rotation,
            flip: FlipSettings { horizontal, vertical },
            ..Default::default()
        };
        let out = apply_transform(Cow::Owned(create_test_image(width, height)), &settings, &EngineConfig::default()).unwrap();
        let expected = if rotation.swaps_dimensions() { (height, width) } else { (width, height) };
        prop_assert_eq!((out.width, out.height), expected);
        prop_assert_eq!((out.image.width(), out.image.height()), expected);
    }

    #[test]
    fn prop_locked_aspect_derives_from_source_ratio(
        src_w in 1u32..5000,
        src_h in 1u32..5000,
        first in 1u32..5000,
        second in 1u32..5000,
    ) {
        let mut direct = ResizeSettings::dimensions(0, 0, true);
        direct.edit_width(first, (src_w, src_h));

        // bouncing through a height edit must not drift the ratio
        let mut bounced = ResizeSettings::dimensions(0, 0, true);
        bounced.edit_width(second, (src_w, src_h));
        bounced.edit_height(second, (src_w, src_h));
        bounced.edit_width(first, (src_w, src_h));

        prop_assert_eq!(direct.width, first);
        prop_assert_eq!(direct.height, bounced.height);
        let expected = ((first as f64 * src_h as f64 / src_w as f64).round() as u32).max(1);
        prop_assert_eq!(direct.height, expected);
    }

    #[test]
    fn prop_zero_contrast_and_brightness_is_identity(
        pixels in prop::collection::vec(any::<u8>(), 4 * 12 * 7),
    ) {
        prop_assert_eq!(contrast_factor(0), 1.0);
        let original = DynamicImage::ImageRgba8(RgbaImage::from_raw(12, 7, pixels).unwrap());
        let mut filtered = original.clone();
        apply_filters(&mut filtered, &FilterSettings { grayscale: false, brightness: 0, contrast: 0 });
        prop_assert_eq!(filtered.as_bytes(), original.as_bytes());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_progress_is_exactly_k_over_n(n in 1usize..7, broken in prop::option::of(0usize..7)) {
        let config = EngineConfig::default().with_reconvert_delay(Duration::from_secs(3600));
        let driver = BatchDriver::with_encoder(config, Arc::new(FixedEncoder));
        let log = Arc::new(ProgressLog::default());
        driver.set_observer(Some(log.clone()));
        for i in 0..n {
            let bytes = if Some(i) == broken { b"junk".to_vec() } else { png_bytes(3 + i as u32, 3) };
            driver.add_file(SourceImage::from_bytes(format!("f{i}.png"), bytes, None));
        }

        driver.run_batch();

        let expected: Vec<f64> = (1..=n).map(|k| k as f64 / n as f64).collect();
        prop_assert_eq!(log.0.lock().clone(), expected);
    }
}
