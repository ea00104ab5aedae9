use std::path::{Path, PathBuf};

use tracing::info;

use crate::backend::Backend;
use crate::error::Result;
use crate::wire::{ModelDetails, ModelPage, ModelQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Newest => "newest",
            Self::Oldest => "oldest",
        }
    }
}

/// Paged view over the user's saved models.
pub struct ModelLibrary<'a> {
    backend: &'a dyn Backend,
    sort: SortOrder,
    model_type: Option<String>,
    page: u32,
    has_more: bool,
}

impl<'a> ModelLibrary<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self {
            backend,
            sort: SortOrder::default(),
            model_type: None,
            page: 0,
            has_more: true,
        }
    }

    pub fn sorted(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn of_type(mut self, model_type: impl Into<String>) -> Self {
        self.model_type = Some(model_type.into());
        self
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Fetches the following page. Returns `None` once the backend reported
    /// there is nothing more.
    pub async fn next_page(&mut self) -> Result<Option<ModelPage>> {
        if !self.has_more {
            return Ok(None);
        }
        let query = ModelQuery {
            page: self.page + 1,
            sort: Some(self.sort.as_str().to_string()),
            model_type: self.model_type.clone(),
        };
        let page = self.backend.my_models(&query).await?;
        self.page += 1;
        self.has_more = page.has_more;
        Ok(Some(page))
    }

    pub async fn details(&self, model_id: &str) -> Result<ModelDetails> {
        self.backend.model_details(model_id).await
    }

    /// Writes `{model_id}.{format}` into `dir` and returns its path.
    pub async fn download(&self, model_id: &str, format: &str, dir: &Path) -> Result<PathBuf> {
        let bytes = self.backend.download_model(model_id, format).await?;
        let path = dir.join(format!("{model_id}.{format}"));
        tokio::fs::write(&path, &bytes).await?;
        info!(model_id, format, path = %path.display(), bytes = bytes.len(), "model downloaded");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{FakeBackend, box_stl};

    use super::{ModelLibrary, SortOrder};

    #[tokio::test]
    async fn pages_until_backend_reports_no_more() {
        let backend = FakeBackend::new();
        let mut library = ModelLibrary::new(&backend)
            .sorted(SortOrder::Oldest)
            .of_type("image");

        let first = library.next_page().await.expect("page 1").expect("has page 1");
        assert_eq!(first.models[0].model_id, "model_page1");
        assert_eq!(first.models[0].model_type, "image");
        assert!(library.has_more());

        let second = library.next_page().await.expect("page 2").expect("has page 2");
        assert_eq!(second.models[0].model_id, "model_page2");
        assert!(!library.has_more());

        assert!(library.next_page().await.expect("no error").is_none());
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn download_writes_named_file() {
        let backend = FakeBackend::new();
        let stl = box_stl([1.0, 1.0, 1.0]);
        backend.put_asset("/model/u1/m1.stl", stl.clone());
        let dir = tempfile::tempdir().expect("temp dir should be created");

        let library = ModelLibrary::new(&backend);
        let path = library
            .download("m1", "stl", dir.path())
            .await
            .expect("download succeeds");
        assert_eq!(path, dir.path().join("m1.stl"));
        assert_eq!(std::fs::read(&path).expect("file exists"), stl);

        assert!(library.download("m9", "stl", dir.path()).await.is_err());
        assert!(!dir.path().join("m9.stl").exists());
    }
}
