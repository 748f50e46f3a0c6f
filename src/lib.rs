//! blip-caption - 基于 ONNX Runtime 的 BLIP 图像描述库
//!
//! 加载一次预训练的 BLIP 模型，输入图片，输出一句自然语言描述。
//! 提供两个前端：交互式命令行（`blip-caption-cli`）和网页表单（`blip-caption-web`）。
//!
//! ## 使用示例
//!
//! ```no_run
//! use blip_caption::{CaptionClient, Captioner, GenerationParams, ImageSource, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. 读取配置并初始化模型
//!     let settings = Settings::from_env()?;
//!     let mut client = CaptionClient::new();
//!     client.initialize(&settings).await?;
//!
//!     // 2. 生成描述
//!     let caption = client.caption_source(
//!         ImageSource::Path("dog.jpg".into()),
//!         &GenerationParams::default(),
//!     )?;
//!     println!("描述: {}", caption);
//!
//!     // 3. 卸载模型（可选）
//!     client.cleanup();
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod blip;
pub mod error;
pub mod image_input;
pub mod settings;
pub mod web;

#[cfg(test)]
pub(crate) mod testing;

pub use blip::{BlipCaptioner, Device, GenerationParams};
pub use error::{caption_or_message, CaptionError, ErrorKind};
pub use image_input::{normalize, ImageSource};
pub use settings::{Deployment, Settings};

use image::RgbImage;
use std::path::{Path, PathBuf};

/// 图片 → 描述。前端只依赖这个 trait。
pub trait Captioner {
    fn caption(&mut self, image: &RgbImage, params: &GenerationParams) -> Result<String, CaptionError>;

    /// 先把输入统一成 RGB，再生成描述
    fn caption_source(&mut self, source: ImageSource, params: &GenerationParams) -> Result<String, CaptionError> {
        let image = normalize(source)?;
        self.caption(&image, params)
    }
}

/// 模型生命周期：未初始化 → 就绪
pub struct CaptionClient {
    model: Option<BlipCaptioner>,
    model_path: Option<PathBuf>,
}

impl CaptionClient {
    /// 创建新的客户端实例（未初始化）
    pub fn new() -> Self {
        Self {
            model: None,
            model_path: None,
        }
    }

    /// 初始化模型
    ///
    /// 模型文件不存在时会先下载。失败属于启动期错误，调用方应当终止进程。
    pub async fn initialize(&mut self, settings: &Settings) -> Result<(), CaptionError> {
        if self.model.is_some() {
            tracing::warn!("模型已经初始化，忽略重复调用");
            return Ok(());
        }

        let model_dir = settings.resolved_model_dir();
        let model = BlipCaptioner::initialize(&settings.model_id, &model_dir).await?;
        tracing::info!("BLIP 模型初始化成功 (设备: {})", model.device());

        self.model = Some(model);
        self.model_path = Some(model_dir);
        Ok(())
    }

    /// 检查模型是否已初始化
    pub fn is_initialized(&self) -> bool {
        self.model.is_some()
    }

    /// 获取模型路径
    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    pub fn device(&self) -> Option<Device> {
        self.model.as_ref().map(BlipCaptioner::device)
    }

    /// 卸载模型并释放资源
    pub fn cleanup(&mut self) {
        if self.model.take().is_some() {
            tracing::info!("BLIP 模型已卸载");
        }
        self.model_path = None;
    }
}

impl Default for CaptionClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Captioner for CaptionClient {
    fn caption(&mut self, image: &RgbImage, params: &GenerationParams) -> Result<String, CaptionError> {
        match self.model.as_mut() {
            Some(model) => model.generate_caption(image, params),
            None => Err(CaptionError::NotInitialized),
        }
    }

    fn caption_source(&mut self, source: ImageSource, params: &GenerationParams) -> Result<String, CaptionError> {
        // 未初始化时不解码图片，直接失败
        if self.model.is_none() {
            return Err(CaptionError::NotInitialized);
        }
        let image = normalize(source)?;
        self.caption(&image, params)
    }
}

impl Drop for CaptionClient {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// 便捷函数：按配置下载并初始化模型
pub async fn create_caption_client(settings: &Settings) -> Result<CaptionClient, CaptionError> {
    let mut client = CaptionClient::new();
    client.initialize(settings).await?;
    Ok(client)
}
