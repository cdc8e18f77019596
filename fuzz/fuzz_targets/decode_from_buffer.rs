#![no_main]

use lean_image::engine::decoder::decode_image;
use lean_image::{EngineConfig, SourceImage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // constrained limits keep a hostile header from allocating gigabytes
    let config = EngineConfig::constrained();
    let source = SourceImage::from_bytes("fuzz", data.to_vec(), None);
    let _ = source.icc_profile();
    if let Ok((img, _)) = decode_image(source.bytes(), &config) {
        assert!(img.width() <= config.max_dimension);
        assert!(img.height() <= config.max_dimension);
    }
});
