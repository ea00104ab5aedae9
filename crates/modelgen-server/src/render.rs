use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

const RENDER_TIMEOUT: Duration = Duration::from_secs(120);
const PREVIEW_SIZE: &str = "800,600";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("CAD toolchain `{0}` is not installed")]
    Unavailable(PathBuf),
    #[error("CAD toolchain failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },
    #[error("CAD toolchain timed out after {0:?}")]
    Timeout(Duration),
    #[error("CAD toolchain I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Turns a program on disk into printable and viewable artifacts.
#[async_trait]
pub trait CadRenderer: Send + Sync {
    async fn render_mesh(&self, source: &Path, output: &Path) -> Result<(), RenderError>;

    async fn render_preview(&self, source: &Path, output: &Path) -> Result<(), RenderError>;
}

/// Shells out to the `openscad` command-line tool.
#[derive(Debug, Clone)]
pub struct OpenScadRenderer {
    binary: PathBuf,
    timeout: Duration,
}

impl OpenScadRenderer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: RENDER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[&OsStr]) -> Result<(), RenderError> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(binary = %self.binary.display(), ?args, "running CAD toolchain");

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(RenderError::Unavailable(self.binary.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| RenderError::Timeout(self.timeout))??;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(status = %output.status, %stderr, "CAD toolchain failed");
            Err(RenderError::Failed {
                status: output.status.to_string(),
                stderr,
            })
        }
    }
}

#[async_trait]
impl CadRenderer for OpenScadRenderer {
    async fn render_mesh(&self, source: &Path, output: &Path) -> Result<(), RenderError> {
        self.run(&[OsStr::new("-o"), output.as_os_str(), source.as_os_str()])
            .await
    }

    async fn render_preview(&self, source: &Path, output: &Path) -> Result<(), RenderError> {
        let size = format!("--imgsize={PREVIEW_SIZE}");
        self.run(&[
            OsStr::new("-o"),
            output.as_os_str(),
            OsStr::new(&size),
            OsStr::new("--autocenter"),
            OsStr::new("--viewall"),
            source.as_os_str(),
        ])
        .await
    }
}
