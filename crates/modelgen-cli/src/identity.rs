use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use modelgen_client::{ClientConfig, HttpBackend};
use tracing::{debug, info};

/// Reads the user id saved by an earlier run, if any.
pub async fn load(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let user_id = text.trim();
            Ok((!user_id.is_empty()).then(|| user_id.to_string()))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

pub async fn save(path: &Path, user_id: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, format!("{user_id}\n"))
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Opens a session, reusing the saved user id so models and balance carry
/// over between invocations.
pub async fn connect(config: &ClientConfig, path: &Path) -> Result<HttpBackend> {
    let backend = match load(path).await? {
        Some(user_id) => {
            debug!(user_id, "resuming saved identity");
            HttpBackend::resume(config, &user_id).await?
        }
        None => HttpBackend::connect(config).await?,
    };

    let user_id = &backend.context().user_id;
    if load(path).await?.as_deref() != Some(user_id.as_str()) {
        save(path, user_id).await?;
        info!(user_id, path = %path.display(), "identity saved");
    }
    Ok(backend)
}
