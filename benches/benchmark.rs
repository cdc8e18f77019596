use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use image::{DynamicImage, ImageFormat, RgbImage};
use lean_image::engine::pipeline::{apply_transform, TransformedImage};
use lean_image::engine::search::search;
use lean_image::{
    BatchDriver, EncodeSettings, EngineConfig, FilterSettings, FlipSettings, NativeEncoder,
    OutputFormat, ResizeSettings, Rotation, SourceImage, TransformSettings,
};
use std::borrow::Cow;
use std::hint::black_box;
use std::io::Cursor;
use std::time::Duration;

fn test_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
    }))
}

fn png_bytes(img: &DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("png encode");
    buf
}

fn bench_transform(c: &mut Criterion) {
    let img = test_image(1024, 768);
    let config = EngineConfig::default();
    let settings = TransformSettings {
        resize: ResizeSettings::percentage(50),
        rotate: Rotation::Deg90,
        flip: FlipSettings {
            horizontal: true,
            vertical: false,
        },
        filters: FilterSettings {
            grayscale: false,
            brightness: 10,
            contrast: 20,
        },
        ..Default::default()
    };

    c.bench_function("transform 1024x768 resize+orient+filters", |b| {
        b.iter(|| apply_transform(Cow::Borrowed(black_box(&img)), &settings, &config))
    });
}

fn bench_search(c: &mut Criterion) {
    let source = TransformedImage::new(test_image(512, 512));
    let original = png_bytes(&source.image).len() as u64;
    let config = EngineConfig::default();

    let mut group = c.benchmark_group("encoder search 512x512");
    group.sample_size(10);
    for format in [OutputFormat::Webp, OutputFormat::Jpeg, OutputFormat::Avif] {
        let settings = EncodeSettings::new(format, 80);
        group.bench_function(format.as_str(), |b| {
            b.iter(|| search(&NativeEncoder, &source, &settings, original, None, &config))
        });
    }
    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    let files: Vec<Vec<u8>> = (0..8).map(|i| png_bytes(&test_image(128 + i * 8, 96))).collect();
    let config = EngineConfig::default().with_reconvert_delay(Duration::from_secs(3600));

    let mut group = c.benchmark_group("batch of 8");
    group.sample_size(10);
    for concurrency in [lean_image::Concurrency::Sequential, lean_image::Concurrency::Parallel] {
        group.bench_function(format!("{concurrency:?}"), |b| {
            b.iter_batched(
                || {
                    let driver = BatchDriver::new(config.clone().with_concurrency(concurrency));
                    for (i, bytes) in files.iter().enumerate() {
                        driver.add_file(SourceImage::from_bytes(format!("{i}.png"), bytes.clone(), None));
                    }
                    driver
                },
                |driver| driver.run_batch(),
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_transform, bench_search, bench_batch);
criterion_main!(benches);
