use thiserror::Error;

/// Everything a user-initiated action can fail with.
///
/// The first four variants are the transport taxonomy: the request never
/// completed, the server answered with a non-success status, the server
/// answered `success: false`, or the body did not have the expected shape.
/// The rest are raised locally before any request is made.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network failure: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server responded {status}: {message}")]
    Status { status: u16, message: String },

    #[error("{0}")]
    Rejected(String),

    #[error("unexpected response payload: {0}")]
    Malformed(String),

    #[error("mesh could not be read: {0}")]
    Mesh(#[from] modelgen_mesh::MeshError),

    #[error("unsupported image: {0}")]
    UnsupportedImage(String),

    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    #[error("message is empty")]
    EmptyMessage,

    #[error("no model has been generated yet")]
    NoActiveModel,

    #[error("no chat session is open")]
    NoSession,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// True when the failure was detected locally and nothing was sent.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedImage(_)
                | Self::UnknownParameter(_)
                | Self::EmptyMessage
                | Self::NoActiveModel
                | Self::NoSession
                | Self::Config(_)
                | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
