use std::collections::BTreeMap;
use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use image::ImageFormat;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use thiserror::Error;
use tracing::info;

pub const PREVIEW_EDGE: u32 = 256;
const RECONSTRUCT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("image-to-3D conversion is not configured")]
    Unavailable,
    #[error("reconstruction service error: {0}")]
    Service(String),
    #[error("reconstruction returned an unusable mesh: {0}")]
    InvalidMesh(#[from] modelgen_mesh::MeshError),
}

impl From<reqwest::Error> for ReconstructError {
    fn from(err: reqwest::Error) -> Self {
        Self::Service(err.to_string())
    }
}

/// Converts a single photo into a mesh.
#[async_trait]
pub trait ImageReconstructor: Send + Sync {
    /// Returns binary or ASCII STL bytes.
    async fn reconstruct(
        &self,
        image: Vec<u8>,
        file_name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, ReconstructError>;
}

/// Posts the image and parameters as a multipart form and expects STL back.
pub struct HttpReconstructor {
    http: Client,
    url: String,
}

impl HttpReconstructor {
    pub fn new(url: impl Into<String>) -> Result<Self, ReconstructError> {
        Ok(Self {
            http: Client::builder().timeout(RECONSTRUCT_TIMEOUT).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ImageReconstructor for HttpReconstructor {
    async fn reconstruct(
        &self,
        image: Vec<u8>,
        file_name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, ReconstructError> {
        let mut form = Form::new().part("image", Part::bytes(image).file_name(file_name.to_string()));
        for (name, value) in parameters {
            form = form.text(name.clone(), value.clone());
        }

        let response = self.http.post(&self.url).multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReconstructError::Service(format!(
                "{} returned {status}",
                self.url
            )));
        }
        let bytes = response.bytes().await?.to_vec();
        modelgen_mesh::parse_stl(&bytes)?;
        info!(url = %self.url, bytes = bytes.len(), "image reconstructed");
        Ok(bytes)
    }
}

/// Used when no reconstruction endpoint is configured.
#[derive(Debug, Default)]
pub struct UnavailableReconstructor;

#[async_trait]
impl ImageReconstructor for UnavailableReconstructor {
    async fn reconstruct(
        &self,
        _image: Vec<u8>,
        _file_name: &str,
        _parameters: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>, ReconstructError> {
        Err(ReconstructError::Unavailable)
    }
}

/// Square PNG thumbnail of the source photo, shown until a render exists.
pub fn preview_from_image(bytes: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let thumbnail = image::load_from_memory(bytes)?.thumbnail_exact(PREVIEW_EDGE, PREVIEW_EDGE);
    let mut png = Cursor::new(Vec::new());
    thumbnail.write_to(&mut png, ImageFormat::Png)?;
    Ok(png.into_inner())
}
