use std::env;
use std::time::Duration;

use reqwest::Url;

use crate::error::{ClientError, Result};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base(base_url)?,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Reads `MODELGEN_API_URL` and `MODELGEN_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        let url = env::var("MODELGEN_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let mut config = Self::new(&url)?;
        if let Ok(raw) = env::var("MODELGEN_TIMEOUT_SECS") {
            let secs = raw.parse::<u64>().map_err(|err| {
                ClientError::Config(format!("MODELGEN_TIMEOUT_SECS must be an integer: {err}"))
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Identity and CSRF token for the current user, handed out by the backend
/// at bootstrap and attached to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub user_id: String,
    pub csrf_token: String,
}

// A base without a trailing slash would make `Url::join` drop its last segment.
fn normalize_base(raw: &str) -> Result<Url> {
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    let url = Url::parse(&with_slash)
        .map_err(|err| ClientError::Config(format!("invalid API url `{raw}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ClientError::Config(format!(
            "API url must be http or https, got `{}`",
            url.scheme()
        )));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::ClientConfig;

    #[test]
    fn base_url_gains_trailing_slash() {
        let config = ClientConfig::new("http://localhost:9000/app").expect("url should parse");
        assert_eq!(config.base_url.as_str(), "http://localhost:9000/app/");
        assert_eq!(
            config
                .base_url
                .join("api/chat/start")
                .expect("join should succeed")
                .as_str(),
            "http://localhost:9000/app/api/chat/start"
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(ClientConfig::new("ftp://example.com").is_err());
        assert!(ClientConfig::new("not a url").is_err());
    }
}
