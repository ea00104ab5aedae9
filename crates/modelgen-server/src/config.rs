use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::payments::Package;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimit {
    pub limit: usize,
    pub window_secs: u64,
}

impl RateLimit {
    pub const fn new(limit: usize, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    /// Session issuance, keyed by peer address.
    pub session: RateLimit,
    pub chat_start: RateLimit,
    pub chat_message: RateLimit,
    pub generate: RateLimit,
    pub upload: RateLimit,
    pub image_to_3d: RateLimit,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            session: RateLimit::new(30, 60),
            chat_start: RateLimit::new(10, 60),
            chat_message: RateLimit::new(20, 60),
            generate: RateLimit::new(10, 60),
            upload: RateLimit::new(5, 60),
            image_to_3d: RateLimit::new(2, 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Costs {
    pub parametric: u64,
    pub image: u64,
}

impl Default for Costs {
    fn default() -> Self {
        Self {
            parametric: 5,
            image: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LanguageModelConfig {
    /// OpenAI-compatible chat completions endpoint. Templates only when unset.
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub max_retries: usize,
    pub timeout_secs: u64,
}

impl Default for LanguageModelConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            model: "mistral-7b-instruct".to_string(),
            max_retries: 3,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub free_generations: u32,
    pub max_image_bytes: usize,
    pub costs: Costs,
    pub rate_limits: RateLimits,
    /// Idle sessions, chat transcripts and CSRF tokens are dropped after this.
    pub session_idle_secs: u64,
    pub language_model: LanguageModelConfig,
    /// Path to the `openscad` binary.
    pub openscad: PathBuf,
    pub reconstruct_url: Option<String>,
    pub razorpay: Option<RazorpayConfig>,
    pub packages: Vec<Package>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: PathBuf::from("data"),
            free_generations: 5,
            max_image_bytes: 10 * 1024 * 1024,
            costs: Costs::default(),
            rate_limits: RateLimits::default(),
            session_idle_secs: 24 * 60 * 60,
            language_model: LanguageModelConfig::default(),
            openscad: PathBuf::from("openscad"),
            reconstruct_url: None,
            razorpay: None,
            packages: Package::defaults(),
        }
    }
}

impl ServerConfig {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    /// Defaults, then the TOML file named by `MODELGEN_CONFIG`, then
    /// individual environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var_os("MODELGEN_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|name| env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(bind) = lookup("MODELGEN_BIND") {
            self.bind = bind.parse().map_err(|err| ConfigError::Invalid {
                name: "MODELGEN_BIND",
                message: format!("{err}"),
            })?;
        }
        if let Some(dir) = lookup("MODELGEN_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("MODELGEN_LLM_URL") {
            self.language_model.url = Some(url);
        }
        if let Some(key) = lookup("MODELGEN_LLM_KEY") {
            self.language_model.api_key = Some(key);
        }
        if let Some(model) = lookup("MODELGEN_LLM_MODEL") {
            self.language_model.model = model;
        }
        if let Some(openscad) = lookup("MODELGEN_OPENSCAD") {
            self.openscad = PathBuf::from(openscad);
        }
        if let Some(url) = lookup("MODELGEN_RECONSTRUCT_URL") {
            self.reconstruct_url = Some(url);
        }
        match (lookup("RAZORPAY_KEY_ID"), lookup("RAZORPAY_KEY_SECRET")) {
            (Some(key_id), Some(key_secret)) if !key_id.is_empty() && !key_secret.is_empty() => {
                self.razorpay = Some(RazorpayConfig { key_id, key_secret });
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::Invalid {
                    name: "RAZORPAY_KEY_ID",
                    message: "RAZORPAY_KEY_ID and RAZORPAY_KEY_SECRET must be set together"
                        .to_string(),
                });
            }
            _ => {}
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.packages.is_empty() {
            return Err(ConfigError::Invalid {
                name: "packages",
                message: "at least one token package is required".to_string(),
            });
        }
        if self.session_idle_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "session_idle_secs",
                message: "must be greater than zero".to_string(),
            });
        }
        if let Some(package) = self.packages.iter().find(|package| package.tokens == 0) {
            return Err(ConfigError::Invalid {
                name: "packages",
                message: format!("package `{}` grants no tokens", package.id),
            });
        }
        Ok(())
    }
}
