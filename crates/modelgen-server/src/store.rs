//! File-backed persistence under the data directory.
//!
//! ```text
//! data/
//!   models/{user}/{model}/meta.json, {model}.scad, {model}.stl, {model}.obj, preview.png
//!   uploads/{user}/{file_id}
//!   ledgers/{user}.json
//!   orders/{order_id}.json
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::security::secure_join;

pub const MODELS_PER_PAGE: usize = 12;
const PREVIEW_FILE: &str = "preview.png";
const META_FILE: &str = "meta.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("invalid identifier `{0}`")]
    InvalidId(String),
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// `{prefix}_{8 hex chars}`.
pub fn new_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..8])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Parametric,
    Image,
}

impl ModelType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parametric => "parametric",
            Self::Image => "image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "parametric" => Some(Self::Parametric),
            "image" => Some(Self::Image),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub value: String,
    pub default: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub model_id: String,
    pub user_id: String,
    pub model_type: ModelType,
    /// Template or shape name for parametric models.
    #[serde(default)]
    pub shape: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
}

impl SortOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "newest" => Some(Self::Newest),
            "oldest" => Some(Self::Oldest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// 1-based.
    pub page: usize,
    pub sort: SortOrder,
    pub model_type: Option<ModelType>,
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for dir in ["models", "uploads", "ledgers", "orders"] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        debug!(root = %root.display(), "store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, components: &[&str]) -> StoreResult<PathBuf> {
        secure_join(&self.root, components)
            .ok_or_else(|| StoreError::InvalidId(components.join("/")))
    }

    pub fn model_dir(&self, user_id: &str, model_id: &str) -> StoreResult<PathBuf> {
        self.path(&["models", user_id, model_id])
    }

    pub fn artifact_path(&self, user_id: &str, model_id: &str, ext: &str) -> StoreResult<PathBuf> {
        self.path(&["models", user_id, model_id, &format!("{model_id}.{ext}")])
    }

    pub fn preview_path(&self, user_id: &str, model_id: &str) -> StoreResult<PathBuf> {
        self.path(&["models", user_id, model_id, PREVIEW_FILE])
    }

    pub async fn save_model(&self, meta: &ModelMeta) -> StoreResult<()> {
        let dir = self.model_dir(&meta.user_id, &meta.model_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        write_json_atomic(&dir.join(META_FILE), meta).await
    }

    pub async fn load_model(&self, user_id: &str, model_id: &str) -> StoreResult<ModelMeta> {
        let path = self.model_dir(user_id, model_id)?.join(META_FILE);
        read_json(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("model `{model_id}`")))
    }

    pub async fn write_artifact(
        &self,
        user_id: &str,
        model_id: &str,
        ext: &str,
        bytes: &[u8],
    ) -> StoreResult<PathBuf> {
        let path = self.artifact_path(user_id, model_id, ext)?;
        write_atomic(&path, bytes).await?;
        Ok(path)
    }

    pub async fn read_artifact(
        &self,
        user_id: &str,
        model_id: &str,
        ext: &str,
    ) -> StoreResult<Vec<u8>> {
        let path = self.artifact_path(user_id, model_id, ext)?;
        read_file(&path, || format!("{ext} file for model `{model_id}`")).await
    }

    pub async fn read_preview(&self, user_id: &str, model_id: &str) -> StoreResult<Vec<u8>> {
        let path = self.preview_path(user_id, model_id)?;
        read_file(&path, || format!("preview for model `{model_id}`")).await
    }

    pub async fn write_preview(
        &self,
        user_id: &str,
        model_id: &str,
        png: &[u8],
    ) -> StoreResult<PathBuf> {
        let path = self.preview_path(user_id, model_id)?;
        write_atomic(&path, png).await?;
        Ok(path)
    }

    /// Deletes the rendered mesh, OBJ export and preview of a model.
    pub async fn remove_renders(&self, user_id: &str, model_id: &str) -> StoreResult<()> {
        let paths = [
            self.artifact_path(user_id, model_id, "stl")?,
            self.artifact_path(user_id, model_id, "obj")?,
            self.preview_path(user_id, model_id)?,
        ];
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// One page of the user's models plus whether more pages follow.
    pub async fn list_models(
        &self,
        user_id: &str,
        query: &ListQuery,
    ) -> StoreResult<(Vec<ModelMeta>, bool)> {
        let dir = self.path(&["models", user_id])?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
            Err(err) => return Err(err.into()),
        };

        let mut models = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(META_FILE);
            match read_json::<ModelMeta>(&path).await {
                Ok(Some(meta)) => models.push(meta),
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), %err, "skipping unreadable model"),
            }
        }

        if let Some(model_type) = query.model_type {
            models.retain(|meta| meta.model_type == model_type);
        }
        match query.sort {
            SortOrder::Newest => models.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            SortOrder::Oldest => models.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        }

        let start = query.page.max(1).saturating_sub(1) * MODELS_PER_PAGE;
        let has_more = models.len() > start + MODELS_PER_PAGE;
        let page = models
            .into_iter()
            .skip(start)
            .take(MODELS_PER_PAGE)
            .collect();
        Ok((page, has_more))
    }

    pub async fn save_upload(&self, user_id: &str, file_id: &str, bytes: &[u8]) -> StoreResult<()> {
        let path = self.path(&["uploads", user_id, file_id])?;
        write_atomic(&path, bytes).await
    }

    pub async fn read_upload(&self, user_id: &str, file_id: &str) -> StoreResult<Vec<u8>> {
        let path = self.path(&["uploads", user_id, file_id])?;
        read_file(&path, || format!("upload `{file_id}`")).await
    }

    /// The user's uploads, newest first. Files that are not stored images
    /// are skipped.
    pub async fn list_uploads(&self, user_id: &str) -> StoreResult<Vec<UploadInfo>> {
        let dir = self.path(&["uploads", user_id])?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut uploads = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(file_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(file_type) = upload_type(&file_id) else {
                continue;
            };
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            uploads.push(UploadInfo {
                file_id,
                file_size: metadata.len(),
                file_type,
                uploaded_at: metadata.modified().map(DateTime::<Utc>::from)?,
            });
        }
        uploads.sort_by(|a, b| {
            b.uploaded_at
                .cmp(&a.uploaded_at)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        Ok(uploads)
    }

    pub async fn read_record<T: DeserializeOwned>(
        &self,
        kind: &str,
        id: &str,
    ) -> StoreResult<Option<T>> {
        let path = self.path(&[kind, &format!("{id}.json")])?;
        read_json(&path).await
    }

    pub async fn write_record<T: Serialize>(&self, kind: &str, id: &str, value: &T) -> StoreResult<()> {
        let path = self.path(&[kind, &format!("{id}.json")])?;
        write_json_atomic(&path, value).await
    }

    /// Every record of `kind`, skipping unreadable ones.
    pub async fn read_records<T: DeserializeOwned>(&self, kind: &str) -> StoreResult<Vec<T>> {
        let dir = self.path(&[kind])?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_json::<T>(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), %err, "skipping unreadable record"),
            }
        }
        Ok(records)
    }
}

pub async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn read_file(path: &Path, what: impl FnOnce() -> String) -> StoreResult<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(what())),
        Err(err) => Err(err.into()),
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(StoreError::Encode)?;
    write_atomic(path, &bytes).await
}

/// Writes to a sibling temp file, syncs, then renames over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}
