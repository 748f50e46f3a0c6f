/// Errors raised while loading the captioning model or serving a request.
///
/// `ModelLoad` and `Config` only happen at startup and are fatal. The other
/// kinds are per-request and get flattened into a message by
/// [`caption_or_message`] at the front-end boundary.
#[derive(thiserror::Error, Debug)]
pub enum CaptionError {
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("failed to decode image: {0}")]
    ImageDecode(String),

    #[error("{0}")]
    Generation(String),

    #[error("model is not initialized, call initialize() first")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Tag of a [`CaptionError`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ModelLoad,
    ImageDecode,
    Generation,
    NotInitialized,
    Config,
}

impl CaptionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptionError::ModelLoad(_) => ErrorKind::ModelLoad,
            CaptionError::ImageDecode(_) => ErrorKind::ImageDecode,
            CaptionError::Generation(_) => ErrorKind::Generation,
            CaptionError::NotInitialized => ErrorKind::NotInitialized,
            CaptionError::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn generation(e: impl std::fmt::Display) -> Self {
        CaptionError::Generation(e.to_string())
    }

    pub(crate) fn model_load(e: impl std::fmt::Display) -> Self {
        CaptionError::ModelLoad(e.to_string())
    }
}

impl From<ort::Error> for CaptionError {
    fn from(e: ort::Error) -> Self {
        CaptionError::Generation(format!("onnx runtime: {e}"))
    }
}

impl From<ndarray::ShapeError> for CaptionError {
    fn from(e: ndarray::ShapeError) -> Self {
        CaptionError::Generation(format!("tensor shape: {e}"))
    }
}

/// Flattens a caption result into the string shown to the user.
pub fn caption_or_message(result: Result<String, CaptionError>) -> String {
    match result {
        Ok(caption) => caption,
        Err(e) => format!("Error generating caption: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caption_passes_through() {
        let out = caption_or_message(Ok("a dog on the grass".to_string()));
        assert_eq!(out, "a dog on the grass");
    }

    #[test]
    fn test_errors_become_messages() {
        let out = caption_or_message(Err(CaptionError::ImageDecode("truncated png".into())));
        assert_eq!(out, "Error generating caption: failed to decode image: truncated png");

        let out = caption_or_message(Err(CaptionError::Generation("out of memory".into())));
        assert_eq!(out, "Error generating caption: out of memory");
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(CaptionError::NotInitialized.kind(), ErrorKind::NotInitialized);
        assert_eq!(CaptionError::model_load("missing").kind(), ErrorKind::ModelLoad);
        assert_eq!(CaptionError::generation("boom").kind(), ErrorKind::Generation);
    }
}
