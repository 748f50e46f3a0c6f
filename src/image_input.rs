use std::path::{Path, PathBuf};

use image::{DynamicImage, RgbImage};

use crate::error::CaptionError;

/// Where a request's image comes from.
pub enum ImageSource {
    /// A file on disk, decoded from whatever format it is stored in.
    Path(PathBuf),
    /// Encoded bytes, e.g. a form upload.
    Bytes(Vec<u8>),
    /// An image that was already decoded by the caller.
    Decoded(DynamicImage),
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        ImageSource::Path(path.to_path_buf())
    }
}

impl From<DynamicImage> for ImageSource {
    fn from(image: DynamicImage) -> Self {
        ImageSource::Decoded(image)
    }
}

/// Produces the 3-channel RGB image the model expects.
///
/// Grayscale, palette and alpha images are all flattened to RGB8.
pub fn normalize(source: ImageSource) -> Result<RgbImage, CaptionError> {
    let image = match source {
        ImageSource::Path(path) => load_path(&path)?,
        ImageSource::Bytes(bytes) => image::load_from_memory(&bytes)
            .map_err(|e| CaptionError::ImageDecode(e.to_string()))?,
        ImageSource::Decoded(image) => image,
    };

    tracing::debug!(
        "Normalizing {}x{} image ({:?}) to RGB8",
        image.width(),
        image.height(),
        image.color()
    );

    Ok(image.to_rgb8())
}

fn load_path(path: &Path) -> Result<DynamicImage, CaptionError> {
    if !path.exists() {
        return Err(CaptionError::ImageDecode(format!(
            "file not found: {}",
            path.display()
        )));
    }

    // guess from content so mislabeled extensions still decode
    image::ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| CaptionError::ImageDecode(format!("{}: {}", path.display(), e)))?
        .decode()
        .map_err(|e| CaptionError::ImageDecode(format!("{}: {}", path.display(), e)))
}
