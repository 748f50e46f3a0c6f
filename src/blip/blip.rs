use image::RgbImage;
use ndarray::{s, Array2, Array3, Ix3};
use ort::{
    session::builder::{GraphOptimizationLevel, SessionBuilder},
    session::Session,
    value::{Tensor, TensorRef},
};

#[cfg(target_os = "macos")]
use ort::{
    execution_providers::coreml::CoreMLComputeUnits,
    execution_providers::CoreMLExecutionProvider,
};

#[cfg(not(target_os = "macos"))]
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};

use std::path::Path;
use std::time::Instant;
use tokenizers::Tokenizer;

use super::beam_search::{beam_search, DecoderStep};
use super::blip_image_process::{BlipImageProcessor, PreprocessorConfig};
use super::download::{
    self, MODEL_CONFIG_FILE, PREPROCESSOR_CONFIG_FILE, TEXT_DECODER_FILE, TOKENIZER_FILE, VISION_MODEL_FILE,
};
use super::model_config::{load_json_or_default, BlipConfig, TextConfig};
use crate::error::CaptionError;
use crate::Captioner;

/// Knobs for one caption request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationParams {
    /// Upper bound on the token sequence, decoder start token included.
    pub max_length: usize,
    pub num_beams: usize,
}

impl GenerationParams {
    pub fn new(max_length: usize, num_beams: usize) -> Result<Self, CaptionError> {
        let params = Self { max_length, num_beams };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), CaptionError> {
        if self.max_length == 0 {
            return Err(CaptionError::generation("max_length must be positive"));
        }
        if self.num_beams == 0 {
            return Err(CaptionError::generation("num_beams must be positive"));
        }
        Ok(())
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: 50,
            num_beams: 5,
        }
    }
}

/// Compute device the ONNX sessions are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    CoreMl,
    Cuda,
    Cpu,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::CoreMl => write!(f, "coreml"),
            Device::Cuda => write!(f, "cuda"),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

/// Accelerator this build of ONNX Runtime can use, otherwise the CPU.
///
/// Only a preference: whether the accelerator really works is known once a
/// session registers it (see `with_device_fallback`).
pub fn select_device() -> Device {
    #[cfg(target_os = "macos")]
    {
        Device::CoreMl
    }

    #[cfg(not(target_os = "macos"))]
    {
        match CUDAExecutionProvider::default().is_available() {
            Ok(true) => Device::Cuda,
            Ok(false) => Device::Cpu,
            Err(e) => {
                tracing::debug!("Could not query CUDA availability: {:?}", e);
                Device::Cpu
            }
        }
    }
}

// Registration errors out instead of silently running on CPU, so the
// reported device is the one sessions actually use.
fn register_execution_providers(builder: SessionBuilder, device: Device) -> ort::Result<SessionBuilder> {
    #[cfg(target_os = "macos")]
    {
        match device {
            Device::CoreMl => builder.with_execution_providers([CoreMLExecutionProvider::default()
                .with_compute_units(CoreMLComputeUnits::CPUAndGPU)
                .build()
                .error_on_failure()]),
            _ => Ok(builder),
        }
    }

    #[cfg(not(target_os = "macos"))]
    {
        match device {
            Device::Cuda => {
                builder.with_execution_providers([CUDAExecutionProvider::default().build().error_on_failure()])
            }
            _ => Ok(builder),
        }
    }
}

/// Runs `build` on `preferred`, retrying once on the CPU if the accelerator fails.
/// Returns the value together with the device that produced it.
pub(crate) fn with_device_fallback<T>(
    preferred: Device,
    mut build: impl FnMut(Device) -> Result<T, CaptionError>,
) -> Result<(T, Device), CaptionError> {
    match build(preferred) {
        Ok(value) => Ok((value, preferred)),
        Err(e) if preferred != Device::Cpu => {
            tracing::warn!("{} unavailable ({}), falling back to cpu", preferred, e);
            build(Device::Cpu).map(|value| (value, Device::Cpu))
        }
        Err(e) => Err(e),
    }
}

/// The loaded BLIP captioning model, bound to one device.
pub struct BlipCaptioner {
    model_id: String,
    device: Device,
    tokenizer: Tokenizer,
    vision_encoder: Session,
    text_decoder: Session,
    decoder_takes_encoder_mask: bool,
    image_processor: BlipImageProcessor,
    tokens: TextConfig,
}

impl BlipCaptioner {
    /// Downloads `model_id` into `model_dir` if needed, then loads it.
    pub async fn initialize(model_id: &str, model_dir: &Path) -> Result<Self, CaptionError> {
        let missing = download::missing_model_files(model_dir);
        if !missing.is_empty() {
            tracing::info!("Model files missing ({}), downloading...", missing.join(", "));
            download::download_blip_models(model_id, model_dir).await?;
        }
        Self::load(model_id, model_dir)
    }

    /// Loads an already downloaded model from `data_dir`.
    pub fn load(model_id: &str, data_dir: &Path) -> Result<Self, CaptionError> {
        let init_start_time = Instant::now();
        let preferred = select_device();
        tracing::info!("Loading {} from {}, preferring {}", model_id, data_dir.display(), preferred);

        let _ = ort::init().with_name("blip-caption").commit().map_err(|e| {
            tracing::debug!("ONNX Runtime already initialized or failed: {:?}", e);
        });

        let tokenizer = Tokenizer::from_file(data_dir.join(TOKENIZER_FILE))
            .map_err(|e| CaptionError::ModelLoad(format!("Error loading tokenizer: {e}")))?;

        let preprocessor: PreprocessorConfig = load_json_or_default(&data_dir.join(PREPROCESSOR_CONFIG_FILE))?;
        let config: BlipConfig = load_json_or_default(&data_dir.join(MODEL_CONFIG_FILE))?;

        let create_session = |model_path: &str, device: Device| -> Result<Session, CaptionError> {
            let model_start = Instant::now();
            let builder = Session::builder()
                .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
                .and_then(|b| register_execution_providers(b, device))
                .map_err(|e| CaptionError::ModelLoad(format!("Session builder error: {e}")))?;

            let session = builder
                .commit_from_file(data_dir.join(model_path))
                .map_err(|e| CaptionError::ModelLoad(format!("Model loading error for {model_path}: {e}")))?;

            tracing::info!("Model {} loaded in {}ms", model_path, model_start.elapsed().as_millis());
            Ok(session)
        };

        // the first session settles the device; the second must use the same one
        let (vision_encoder, device) =
            with_device_fallback(preferred, |device| create_session(VISION_MODEL_FILE, device))?;
        let text_decoder = create_session(TEXT_DECODER_FILE, device)?;

        // some exports expose the cross-attention mask as an input
        let decoder_takes_encoder_mask = text_decoder
            .inputs
            .iter()
            .any(|input| input.name == "encoder_attention_mask");

        tracing::info!(
            "BLIP model loaded successfully on {} in {}ms",
            device,
            init_start_time.elapsed().as_millis()
        );

        Ok(Self {
            model_id: model_id.to_string(),
            device,
            tokenizer,
            vision_encoder,
            text_decoder,
            decoder_takes_encoder_mask,
            image_processor: BlipImageProcessor::new(preprocessor),
            tokens: config.text_config,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Image → caption: encode, beam search, decode.
    pub fn generate_caption(&mut self, image: &RgbImage, params: &GenerationParams) -> Result<String, CaptionError> {
        params.validate()?;
        let start_time = Instant::now();

        // 图像编码阶段
        let image_features = self.encode_image(image)?;
        let encode_time = start_time.elapsed();

        // 文本生成阶段
        let generation_start = Instant::now();
        let mut step = TextDecoderStep {
            session: &mut self.text_decoder,
            encoder_hidden_states: &image_features,
            takes_encoder_mask: self.decoder_takes_encoder_mask,
        };
        let generated = beam_search(&mut step, &[self.tokens.bos_token_id], self.tokens.sep_token_id, params)?;
        let generation_time = generation_start.elapsed();

        let caption = decode_caption(&self.tokenizer, &self.tokens, &generated)?;

        tracing::info!(
            "Caption generated in {}ms (encode: {}ms, generation: {}ms, {} tokens): {}",
            start_time.elapsed().as_millis(),
            encode_time.as_millis(),
            generation_time.as_millis(),
            generated.len(),
            caption
        );

        Ok(caption)
    }

    fn encode_image(&mut self, image: &RgbImage) -> Result<Array3<f32>, CaptionError> {
        let batch_feature = self.image_processor.preprocess(image)?;
        tracing::debug!("Vision encoder input shape: {:?}", batch_feature.pixel_values.shape());

        let outputs = self.vision_encoder.run(ort::inputs![
            "pixel_values" => Tensor::from_array(batch_feature.pixel_values)?,
        ])?;

        let output_name = if outputs.contains_key("last_hidden_state") {
            "last_hidden_state"
        } else if outputs.contains_key("image_embeds") {
            "image_embeds"
        } else {
            outputs
                .keys()
                .next()
                .ok_or_else(|| CaptionError::generation("vision encoder produced no outputs"))?
        };

        let features = outputs[output_name]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix3>()?
            .to_owned();

        tracing::debug!("Image features shape: {:?}", features.shape());
        Ok(features)
    }
}

impl Captioner for BlipCaptioner {
    fn caption(&mut self, image: &RgbImage, params: &GenerationParams) -> Result<String, CaptionError> {
        self.generate_caption(image, params)
    }
}

/// Token ids → caption text, with start/end/padding ids dropped.
fn decode_caption(tokenizer: &Tokenizer, tokens: &TextConfig, generated: &[i64]) -> Result<String, CaptionError> {
    let ids: Vec<u32> = generated
        .iter()
        .filter(|&&id| !tokens.is_special(id))
        .map(|&id| id as u32)
        .collect();

    let text = tokenizer
        .decode(&ids, true)
        .map_err(|e| CaptionError::Generation(format!("Decode error: {e}")))?;
    let caption = text.trim().to_string();

    if caption.is_empty() {
        return Err(CaptionError::generation("model produced an empty caption"));
    }
    Ok(caption)
}

/// Runs the text decoder over every live beam, re-reading the whole prefix.
struct TextDecoderStep<'a> {
    session: &'a mut Session,
    encoder_hidden_states: &'a Array3<f32>,
    takes_encoder_mask: bool,
}

impl DecoderStep for TextDecoderStep<'_> {
    fn next_token_logits(&mut self, input_ids: &Array2<i64>) -> Result<Array2<f32>, CaptionError> {
        let (batch, seq_len) = input_ids.dim();
        let (_, image_seq_len, hidden_dim) = self.encoder_hidden_states.dim();

        let attention_mask = Array2::<i64>::ones((batch, seq_len));
        let encoder_hidden_states = self
            .encoder_hidden_states
            .broadcast((batch, image_seq_len, hidden_dim))
            .ok_or_else(|| CaptionError::generation("cannot tile image features across beams"))?
            .to_owned();
        let encoder_attention_mask = Array2::<i64>::ones((batch, image_seq_len));

        let mut model_inputs = ort::inputs![
            "input_ids" => TensorRef::from_array_view(input_ids)?,
            "attention_mask" => TensorRef::from_array_view(&attention_mask)?,
            "encoder_hidden_states" => TensorRef::from_array_view(&encoder_hidden_states)?,
        ];
        if self.takes_encoder_mask {
            model_inputs.push((
                "encoder_attention_mask".into(),
                TensorRef::from_array_view(&encoder_attention_mask)?.into(),
            ));
        }

        let outputs = self.session.run(model_inputs)?;
        let logits = outputs["logits"].try_extract_array::<f32>()?.into_dimensionality::<Ix3>()?;

        Ok(logits.slice(s![.., seq_len - 1, ..]).to_owned())
    }
}
