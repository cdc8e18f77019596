#![no_main]

use arbitrary::Arbitrary;
use image::{DynamicImage, RgbaImage};
use lean_image::engine::pipeline::apply_transform;
use lean_image::{
    CropSettings, EngineConfig, FilterSettings, FlipSettings, ResizeSettings, Rotation,
    TransformSettings,
};
use libfuzzer_sys::fuzz_target;
use std::borrow::Cow;

#[derive(Arbitrary, Debug)]
struct Input {
    width: u8,
    height: u8,
    percent: Option<u16>,
    dims: Option<(u16, u16, bool)>,
    rotate: i16,
    flip_h: bool,
    flip_v: bool,
    grayscale: bool,
    brightness: i16,
    contrast: i16,
    crop: Option<(u16, u16, u16, u16)>,
}

fuzz_target!(|input: Input| {
    let (w, h) = (input.width.max(1) as u32, input.height.max(1) as u32);
    let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(w, h, |x, y| {
        image::Rgba([x as u8, y as u8, (x ^ y) as u8, 255])
    }));

    let resize = match (input.percent, input.dims) {
        (Some(p), _) => ResizeSettings::percentage(p as u32),
        (None, Some((dw, dh, lock))) => {
            ResizeSettings::dimensions((dw % 512) as u32, (dh % 512) as u32, lock)
        }
        (None, None) => ResizeSettings::default(),
    };
    let settings = TransformSettings {
        resize,
        rotate: Rotation::from_degrees(input.rotate as i32 / 90 * 90).unwrap_or_default(),
        flip: FlipSettings {
            horizontal: input.flip_h,
            vertical: input.flip_v,
        },
        filters: FilterSettings {
            grayscale: input.grayscale,
            brightness: input.brightness as i32,
            contrast: input.contrast as i32,
        },
        crop: input
            .crop
            .map(|(x, y, cw, ch)| CropSettings::new(x as u32, y as u32, cw as u32, ch as u32))
            .unwrap_or_default(),
    };

    if let Ok(out) = apply_transform(Cow::Owned(img), &settings, &EngineConfig::default()) {
        assert!(out.width >= 1 && out.height >= 1);
        assert_eq!((out.image.width(), out.image.height()), (out.width, out.height));
    }
});
