//! Configuration of the protector, read from a JSON file. Every field has a default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_REVIEW_URL: &str = "chrome-extension://dominion/transaction.html";
const DEFAULT_POPUP_WIDTH: u32 = 360;
const DEFAULT_POPUP_HEIGHT: u32 = 600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProtectorConfig {
    /// Page of the extension that hosts the review popup.
    pub review_url: Url,
    pub popup_width: u32,
    pub popup_height: u32,
    /// Features a wallet must expose on top of `standard:connect` and `standard:events`.
    pub required_features: Vec<String>,
    /// When set, a review left undecided for that many seconds is canceled.
    pub review_timeout_secs: Option<u64>,
}

impl Default for ProtectorConfig {
    fn default() -> Self {
        Self {
            review_url: default_review_url(),
            popup_width: DEFAULT_POPUP_WIDTH,
            popup_height: DEFAULT_POPUP_HEIGHT,
            required_features: Vec::new(),
            review_timeout_secs: None,
        }
    }
}

fn default_review_url() -> Url {
    match Url::parse(DEFAULT_REVIEW_URL) {
        Ok(url) => url,
        Err(e) => unreachable!("default review url is valid: {e}"),
    }
}

impl ProtectorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.popup_width == 0 || self.popup_height == 0 {
            return Err(ConfigError::Invalid("popup size must not be zero".into()));
        }
        if self.review_url.cannot_be_a_base() {
            return Err(ConfigError::Invalid(format!(
                "{} cannot host the review page",
                self.review_url
            )));
        }
        Ok(())
    }

    pub fn review_timeout(&self) -> Option<Duration> {
        self.review_timeout_secs.map(Duration::from_secs)
    }
}
