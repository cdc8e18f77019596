#![no_main]

use arbitrary::Arbitrary;
use image::{DynamicImage, RgbImage};
use lean_image::engine::pipeline::TransformedImage;
use lean_image::engine::search::search;
use lean_image::{EncodeSettings, EngineConfig, NativeEncoder, OutputFormat};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input {
    width: u8,
    height: u8,
    format: u8,
    quality: u8,
    lossless: bool,
    original_size: u32,
    seed: u32,
}

fuzz_target!(|input: Input| {
    let (w, h) = (input.width.max(1) as u32 % 64 + 1, input.height.max(1) as u32 % 64 + 1);
    let mut state = input.seed;
    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |_, _| {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        let b = (state >> 16) as u8;
        image::Rgb([b, b.rotate_left(3), b ^ 0x5a])
    }));
    let format = match input.format % 4 {
        0 => OutputFormat::Webp,
        1 => OutputFormat::Jpeg,
        2 => OutputFormat::Png,
        _ => OutputFormat::Avif,
    };
    let mut settings = EncodeSettings::new(format, input.quality);
    settings.lossless = input.lossless;
    let original = input.original_size as u64;

    let source = TransformedImage::new(img);
    if let Ok(result) = search(&NativeEncoder, &source, &settings, original, None, &EngineConfig::default()) {
        assert_eq!(result.improved, result.byte_size < original);
        assert_eq!(result.byte_size as usize, result.bytes.len());
        assert!(result.attempt_count() >= 1);
    }
});
