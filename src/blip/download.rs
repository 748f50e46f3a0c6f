use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::error::CaptionError;

pub const VISION_MODEL_FILE: &str = "onnx/vision_model.onnx";
pub const TEXT_DECODER_FILE: &str = "onnx/text_decoder_model.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const MODEL_CONFIG_FILE: &str = "config.json";
pub const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";

const HF_ENDPOINT: &str = "https://huggingface.co";

/// A file fetched from the model repository.
struct ModelFile {
    name: &'static str,
    size_mb: f32,
    required: bool,
}

const BLIP_MODEL_FILES: &[ModelFile] = &[
    ModelFile {
        name: VISION_MODEL_FILE,
        size_mb: 1160.0,
        required: true,
    },
    ModelFile {
        name: TEXT_DECODER_FILE,
        size_mb: 660.0,
        required: true,
    },
    ModelFile {
        name: TOKENIZER_FILE,
        size_mb: 0.7,
        required: true,
    },
    ModelFile {
        name: MODEL_CONFIG_FILE,
        size_mb: 0.01,
        required: false,
    },
    ModelFile {
        name: PREPROCESSOR_CONFIG_FILE,
        size_mb: 0.01,
        required: false,
    },
];

/// Checks that `model_id` looks like a Hugging Face repository id (`owner/name`).
pub fn validate_model_id(model_id: &str) -> Result<(), CaptionError> {
    let mut parts = model_id.split('/');
    let valid_part = |p: &str| {
        !p.is_empty()
            && p != "."
            && p != ".."
            && p.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };

    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) if valid_part(owner) && valid_part(name) => Ok(()),
        _ => Err(CaptionError::ModelLoad(format!(
            "'{model_id}' is not a model identifier of the form owner/name"
        ))),
    }
}

pub fn model_file_url(model_id: &str, file: &str) -> String {
    format!("{HF_ENDPOINT}/{model_id}/resolve/main/{file}")
}

/// Required files missing from `model_dir`.
pub fn missing_model_files(model_dir: &Path) -> Vec<&'static str> {
    BLIP_MODEL_FILES
        .iter()
        .filter(|f| f.required && !model_dir.join(f.name).exists())
        .map(|f| f.name)
        .collect()
}

/// Download the BLIP ONNX export of `model_id` into `model_dir`.
pub async fn download_blip_models(model_id: &str, model_dir: &Path) -> Result<(), CaptionError> {
    validate_model_id(model_id)?;
    download_all(model_id, model_dir)
        .await
        .map_err(|e| CaptionError::ModelLoad(format!("{e:#}")))
}

async fn download_all(model_id: &str, model_dir: &Path) -> Result<()> {
    println!("🚀 Downloading {} to: {}", model_id, model_dir.display());
    info!("Starting download of {} to {}", model_id, model_dir.display());

    fs::create_dir_all(model_dir)
        .with_context(|| format!("Failed to create model directory: {}", model_dir.display()))?;

    let client = Client::new();
    let total_size: f32 = BLIP_MODEL_FILES.iter().map(|m| m.size_mb).sum();

    println!("📦 Total download size: {:.1} GB ({} files)", total_size / 1024.0, BLIP_MODEL_FILES.len());

    for (index, model) in BLIP_MODEL_FILES.iter().enumerate() {
        let file_path = model_dir.join(model.name);

        if file_path.exists() {
            info!("Model file {} already exists, skipping", model.name);
            continue;
        }

        println!("📥 [{}/{}] Downloading {} ({:.1} MB)...", index + 1, BLIP_MODEL_FILES.len(), model.name, model.size_mb);

        match download_file(&client, &model_file_url(model_id, model.name), &file_path).await {
            Ok(true) => info!("Successfully downloaded {}", model.name),
            Ok(false) if !model.required => {
                warn!("{} is not published for {}, defaults will be used", model.name, model_id);
            }
            Ok(false) => {
                return Err(anyhow::anyhow!("{} not found in repository {}", model.name, model_id));
            }
            Err(e) => {
                error!("Failed to download {}: {:#}", model.name, e);
                return Err(e);
            }
        }
    }

    println!("🎉 Model download completed, stored at: {}", model_dir.display());
    info!("Download of {} completed", model_id);
    Ok(())
}

/// Returns `Ok(false)` when the file does not exist upstream.
async fn download_file(client: &Client, url: &str, dest_path: &Path) -> Result<bool> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to request {}", url))?;

    if response.status() == StatusCode::NOT_FOUND {
        return Ok(false);
    }
    if !response.status().is_success() {
        return Err(anyhow::anyhow!("Download of {} failed with status: {}", url, response.status()));
    }

    if let Some(parent) = dest_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let total_size = response.content_length().unwrap_or(0);
    let mut downloaded = 0u64;
    let mut next_report = 0u64;
    let mut stream = response.bytes_stream();

    // write to a side file so an interrupted download is not mistaken for a complete one
    let partial_path = dest_path.with_extension("part");
    let mut file = tokio::fs::File::create(&partial_path)
        .await
        .with_context(|| format!("Failed to create file: {}", partial_path.display()))?;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| "Error reading download stream")?;

        file.write_all(&chunk).await.with_context(|| "Error writing to file")?;

        downloaded += chunk.len() as u64;

        if total_size > 0 && downloaded >= next_report {
            let progress = (downloaded as f64 / total_size as f64) * 100.0;
            println!(
                "   📊 Progress: {:.1}% ({:.1} MB / {:.1} MB)",
                progress,
                downloaded as f64 / (1024.0 * 1024.0),
                total_size as f64 / (1024.0 * 1024.0)
            );
            next_report = downloaded + 50 * 1024 * 1024;
        }
    }

    file.flush().await.with_context(|| "Failed to flush file")?;
    drop(file);

    tokio::fs::rename(&partial_path, dest_path)
        .await
        .with_context(|| format!("Failed to move download into place: {}", dest_path.display()))?;

    Ok(true)
}

/// Get the default model directory using system-standard locations
pub fn get_default_model_dir() -> PathBuf {
    let model_dir = if cfg!(target_os = "macos") {
        // macOS: ~/Library/Caches/BlipCaption/models
        dirs::cache_dir()
            .map(|cache| cache.join("BlipCaption").join("models"))
            .unwrap_or_else(|| PathBuf::from("data/blip"))
    } else if cfg!(target_os = "windows") {
        // Windows: %APPDATA%\BlipCaption\models
        dirs::config_dir()
            .map(|config| config.join("BlipCaption").join("models"))
            .unwrap_or_else(|| PathBuf::from("data/blip"))
    } else {
        // Linux: ~/.local/share/blip-caption/models
        dirs::data_local_dir()
            .map(|data| data.join("blip-caption").join("models"))
            .unwrap_or_else(|| PathBuf::from("data/blip"))
    };

    if let Err(e) = std::fs::create_dir_all(&model_dir) {
        info!("Could not create model directory {}, falling back to local: {}", model_dir.display(), e);
        let fallback = PathBuf::from("data/blip");
        if std::fs::create_dir_all(&fallback).is_err() {
            PathBuf::from(".")
        } else {
            fallback
        }
    } else {
        model_dir
    }
}
