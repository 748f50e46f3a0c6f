use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::blip::{download::get_default_model_dir, GenerationParams};
use crate::error::CaptionError;

/// ONNX export of `Salesforce/blip-image-captioning-large`.
pub const DEFAULT_MODEL_ID: &str = "Xenova/blip-image-captioning-large";
pub const DEFAULT_SERVER_PORT: u16 = 7860;

/// Set by Hugging Face Spaces; its presence selects the hosted mode.
const HOSTED_MARKER_VAR: &str = "SPACE_ID";

/// Where the web front-end is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deployment {
    /// Behind a hosting platform's proxy, no public link.
    Hosted,
    /// Developer machine, loopback only, public link requested.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub share: bool,
    pub show_error: bool,
}

/// Process-wide settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub deployment: Deployment,
    pub model_id: String,
    pub model_dir: Option<PathBuf>,
    pub generation: GenerationParams,
    pub server: ServerSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, CaptionError> {
        let settings = Self::from_lookup(env_lookup)?;
        tracing::info!(
            "Configuration loaded: running in {:?} mode, model {}",
            settings.deployment,
            settings.model_id
        );
        Ok(settings)
    }

    /// Resolves settings from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CaptionError> {
        let deployment = if lookup(HOSTED_MARKER_VAR).is_some() {
            Deployment::Hosted
        } else {
            Deployment::Local
        };

        let port = parse_var(&lookup, "BLIP_SERVER_PORT")?.unwrap_or(DEFAULT_SERVER_PORT);
        let server = match deployment {
            Deployment::Hosted => ServerSettings {
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                share: false,
                show_error: true,
            },
            Deployment::Local => ServerSettings {
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
                share: true,
                show_error: true,
            },
        };

        let defaults = GenerationParams::default();
        let generation = GenerationParams::new(
            parse_var(&lookup, "BLIP_MAX_LENGTH")?.unwrap_or(defaults.max_length),
            parse_var(&lookup, "BLIP_NUM_BEAMS")?.unwrap_or(defaults.num_beams),
        )
        .map_err(|e| CaptionError::Config(e.to_string()))?;

        Ok(Self {
            deployment,
            model_id: lookup("BLIP_MODEL_ID")
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            model_dir: lookup("BLIP_MODEL_DIR").map(PathBuf::from),
            generation,
            server,
        })
    }

    /// Local directory holding the model files for `model_id`.
    pub fn resolved_model_dir(&self) -> PathBuf {
        self.model_dir.clone().unwrap_or_else(|| {
            get_default_model_dir().join(self.model_id.replace('/', "--"))
        })
    }
}

/// A set variable counts as present even when its value is not UTF-8.
fn env_lookup(key: &str) -> Option<String> {
    std::env::var_os(key).map(|value| value.to_string_lossy().into_owned())
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, CaptionError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CaptionError::Config(format!("{key} has an invalid value: {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_local_mode_without_marker() {
        let settings = Settings::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(settings.deployment, Deployment::Local);
        assert!(settings.server.share);
        assert_eq!(settings.server.addr, "127.0.0.1:7860".parse::<SocketAddr>().unwrap());
        assert_eq!(settings.model_id, DEFAULT_MODEL_ID);
        assert_eq!(settings.generation, GenerationParams::default());
    }

    #[test]
    fn test_hosted_mode_with_marker() {
        let settings = Settings::from_lookup(lookup_from(&[("SPACE_ID", "user/app")])).unwrap();
        assert_eq!(settings.deployment, Deployment::Hosted);
        assert!(!settings.server.share);
        assert!(settings.server.show_error);
        assert_eq!(settings.server.addr, "0.0.0.0:7860".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("BLIP_MODEL_ID", "someone/blip-base"),
            ("BLIP_MAX_LENGTH", "30"),
            ("BLIP_NUM_BEAMS", " 3 "),
            ("BLIP_SERVER_PORT", "8080"),
            ("BLIP_MODEL_DIR", "/tmp/models"),
        ]))
        .unwrap();
        assert_eq!(settings.model_id, "someone/blip-base");
        assert_eq!(settings.generation.max_length, 30);
        assert_eq!(settings.generation.num_beams, 3);
        assert_eq!(settings.server.addr.port(), 8080);
        assert_eq!(settings.resolved_model_dir(), PathBuf::from("/tmp/models"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_variable_counts_as_present() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let key = "BLIP_CAPTION_TEST_NON_UTF8_MARKER";
        std::env::set_var(key, OsStr::from_bytes(b"user/\xffapp"));
        let value = env_lookup(key);
        std::env::remove_var(key);

        assert!(value.is_some());
        assert_eq!(env_lookup(key), None);

        let settings = Settings::from_lookup(|k| if k == HOSTED_MARKER_VAR { value.clone() } else { None }).unwrap();
        assert_eq!(settings.deployment, Deployment::Hosted);
    }

    #[test]
    fn test_malformed_numbers_are_rejected() {
        let err = Settings::from_lookup(lookup_from(&[("BLIP_NUM_BEAMS", "five")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = Settings::from_lookup(lookup_from(&[("BLIP_MAX_LENGTH", "0")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
