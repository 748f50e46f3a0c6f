use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::CaptionError;

/// The parts of BLIP's `config.json` the caption loop needs.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BlipConfig {
    #[serde(default)]
    pub text_config: TextConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TextConfig {
    /// Decoder start token, `[DEC]` in BLIP's vocabulary.
    pub bos_token_id: i64,
    /// `[SEP]`, which BLIP emits to end a caption.
    pub sep_token_id: i64,
    pub pad_token_id: i64,
    pub vocab_size: usize,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            bos_token_id: 30522,
            sep_token_id: 102,
            pad_token_id: 0,
            vocab_size: 30524,
        }
    }
}

impl TextConfig {
    pub fn is_special(&self, token_id: i64) -> bool {
        token_id == self.bos_token_id || token_id == self.sep_token_id || token_id == self.pad_token_id
    }
}

/// Reads a JSON config, falling back to defaults when the file is absent.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, CaptionError> {
    if !path.exists() {
        tracing::info!("{} not found, using built-in defaults", path.display());
        return Ok(T::default());
    }

    let raw = std::fs::read_to_string(path)
        .map_err(|e| CaptionError::ModelLoad(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&raw).map_err(|e| CaptionError::ModelLoad(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parses_text_config() {
        let json = r#"{
            "architectures": ["BlipForConditionalGeneration"],
            "text_config": {"bos_token_id": 30522, "sep_token_id": 102, "pad_token_id": 0, "vocab_size": 30524, "hidden_size": 768},
            "vision_config": {"image_size": 384}
        }"#;
        let config: BlipConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.text_config, TextConfig::default());
        assert!(config.text_config.is_special(102));
        assert!(!config.text_config.is_special(1037));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config: BlipConfig = load_json_or_default(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.text_config.bos_token_id, 30522);
    }

    #[test]
    fn test_malformed_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_json_or_default::<BlipConfig>(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelLoad);
    }
}
