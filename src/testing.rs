use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use image::{Rgb, RgbImage};

use crate::{CaptionError, Captioner, GenerationParams};

/// Model-free captioner that describes the image size and records its calls.
#[derive(Clone, Default)]
pub struct FakeCaptioner {
    calls: Arc<AtomicUsize>,
    params_seen: Arc<Mutex<Vec<GenerationParams>>>,
}

impl FakeCaptioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn params_seen(&self) -> Vec<GenerationParams> {
        self.params_seen.lock().unwrap().clone()
    }
}

impl Captioner for FakeCaptioner {
    fn caption(&mut self, image: &RgbImage, params: &GenerationParams) -> Result<String, CaptionError> {
        params.validate()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.params_seen.lock().unwrap().push(*params);
        Ok(format!("a {}x{} test image", image.width(), image.height()))
    }
}

pub fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([40, 160, 40]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}
