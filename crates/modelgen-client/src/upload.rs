use std::path::Path;

use image::ImageFormat;

use crate::error::{ClientError, Result};

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// An image that passed the local checks and may be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

impl ImageFile {
    pub fn read(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ClientError::UnsupportedImage(format!("{} has no file name", path.display())))?
            .to_string();
        check_extension(&file_name)?;

        let size = std::fs::metadata(path)?.len();
        if size > MAX_IMAGE_BYTES as u64 {
            return Err(too_large(size));
        }
        let bytes = std::fs::read(path)?;
        Self::validate(file_name, bytes)
    }

    /// Extension, magic bytes and size are all checked before anything is sent.
    pub fn validate(file_name: impl Into<String>, bytes: Vec<u8>) -> Result<Self> {
        let file_name = file_name.into();
        check_extension(&file_name)?;
        if bytes.is_empty() {
            return Err(ClientError::UnsupportedImage("file is empty".to_string()));
        }
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(too_large(bytes.len() as u64));
        }

        let content_type = match image::guess_format(&bytes) {
            Ok(ImageFormat::Png) => "image/png",
            Ok(ImageFormat::Jpeg) => "image/jpeg",
            Ok(ImageFormat::WebP) => "image/webp",
            Ok(other) => {
                return Err(ClientError::UnsupportedImage(format!(
                    "{other:?} images are not accepted"
                )));
            }
            Err(_) => {
                return Err(ClientError::UnsupportedImage(
                    "content is not a recognised image".to_string(),
                ));
            }
        };

        Ok(Self {
            file_name,
            content_type,
            bytes,
        })
    }
}

fn check_extension(file_name: &str) -> Result<()> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(ClientError::UnsupportedImage(format!(
            "`{file_name}` must be one of: {}",
            ALLOWED_EXTENSIONS.join(", ")
        )))
    }
}

fn too_large(size: u64) -> ClientError {
    ClientError::UnsupportedImage(format!(
        "file is {size} bytes, the limit is {MAX_IMAGE_BYTES}"
    ))
}
