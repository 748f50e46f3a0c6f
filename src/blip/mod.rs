pub mod beam_search;
#[allow(clippy::module_inception)]
pub mod blip;
pub mod blip_image_process;
pub mod download;
pub mod model_config;

pub use blip::{select_device, BlipCaptioner, Device, GenerationParams};
