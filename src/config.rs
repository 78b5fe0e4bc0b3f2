//! Runtime configuration.

use crate::error::{GeminiError, Result};
use std::path::PathBuf;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: Url,
    pub api_key: Option<String>,
    /// Per-request timeout; `0` disables it.
    pub timeout_secs: u64,
    /// Alternative tool catalog; the embedded Gemini catalog is used when unset.
    pub catalog: Option<PathBuf>,
}

impl Config {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url.trim()).map_err(|e| {
            GeminiError::Config(format!("Invalid base URL '{base_url}': {e}"))
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(GeminiError::Config(format!(
                "Base URL must be http or https, got '{}'",
                base_url.scheme()
            )));
        }
        if base_url.query().is_some() || base_url.fragment().is_some() {
            return Err(GeminiError::Config(
                "Base URL must not carry a query string or fragment".into(),
            ));
        }
        Ok(Self {
            base_url,
            api_key: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            catalog: None,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_catalog(mut self, catalog: Option<PathBuf>) -> Self {
        self.catalog = catalog;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
            api_key: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            catalog: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unparseable_and_non_http_urls() {
        assert!(matches!(Config::new("not a url"), Err(GeminiError::Config(_))));
        assert!(matches!(Config::new("ftp://example.com"), Err(GeminiError::Config(_))));
        assert!(matches!(
            Config::new("https://example.com/?key=x"),
            Err(GeminiError::Config(_))
        ));
    }

    #[test]
    fn blank_api_key_is_treated_as_unset() {
        let cfg = Config::new(DEFAULT_BASE_URL)
            .expect("valid")
            .with_api_key(Some("  ".into()));
        assert_eq!(cfg.api_key, None);

        let cfg = Config::default().with_api_key(Some(" k ".into()));
        assert_eq!(cfg.api_key.as_deref(), Some("k"));
    }
}
