use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;
use serde::Deserialize;

use crate::error::CaptionError;

/// Contents of `preprocessor_config.json`; missing fields keep BLIP's values.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub do_resize: bool,
    pub do_rescale: bool,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub rescale_factor: f32,
    pub size: ImageSize,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            do_rescale: true,
            do_normalize: true,
            // OpenAI CLIP statistics
            image_mean: [0.48145466, 0.4578275, 0.40821073],
            image_std: [0.26862954, 0.26130258, 0.27577711],
            // 1/255
            rescale_factor: 0.00392156862745098,
            size: ImageSize {
                height: 384,
                width: 384,
            },
        }
    }
}

impl Default for ImageSize {
    fn default() -> Self {
        PreprocessorConfig::default().size
    }
}

/// BLIP image processor: bicubic resize, rescale, normalize, NCHW layout.
pub struct BlipImageProcessor {
    config: PreprocessorConfig,
}

impl BlipImageProcessor {
    pub fn new(config: PreprocessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessorConfig {
        &self.config
    }

    pub fn preprocess(&self, image: &RgbImage) -> Result<BlipBatchFeature, CaptionError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(CaptionError::ImageDecode("image has no pixels".to_string()));
        }

        let ImageSize { width, height } = self.config.size;
        let resized;
        let image = if self.config.do_resize && image.dimensions() != (width, height) {
            resized = image::imageops::resize(image, width, height, FilterType::CatmullRom);
            &resized
        } else {
            image
        };

        Ok(BlipBatchFeature {
            pixel_values: self.to_tensor(image),
        })
    }

    /// Output shape: [1, 3, height, width]
    fn to_tensor(&self, image: &RgbImage) -> Array4<f32> {
        let (width, height) = image.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for (x, y, pixel) in image.enumerate_pixels() {
            for c in 0..3 {
                let mut value = pixel[c] as f32;
                if self.config.do_rescale {
                    value *= self.config.rescale_factor;
                }
                if self.config.do_normalize {
                    value = (value - self.config.image_mean[c]) / self.config.image_std[c];
                }
                tensor[[0, c, y as usize, x as usize]] = value;
            }
        }

        tensor
    }
}

impl Default for BlipImageProcessor {
    fn default() -> Self {
        Self::new(PreprocessorConfig::default())
    }
}

pub struct BlipBatchFeature {
    pub pixel_values: Array4<f32>,
}
