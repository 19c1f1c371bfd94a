//! Configuration loading and run-store path resolution

use crate::error::{Error, Result};
use crate::types::Marketplace;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fixed weights for the candidate scoring formula
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Weight of the binary identifier-overlap signal (highest)
    #[serde(default = "default_identifier_weight")]
    pub identifier: f64,
    /// Weight of the title token-set overlap ratio
    #[serde(default = "default_title_weight")]
    pub title: f64,
    /// Weight of the binary brand-equality signal
    #[serde(default = "default_brand_weight")]
    pub brand: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            identifier: default_identifier_weight(),
            title: default_title_weight(),
            brand: default_brand_weight(),
        }
    }
}

fn default_identifier_weight() -> f64 {
    0.6
}
fn default_title_weight() -> f64 {
    0.3
}
fn default_brand_weight() -> f64 {
    0.1
}

/// Connection settings for one upstream catalog service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub endpoint: String,
    /// Bearer token sent on every request. Loading/refresh mechanics live
    /// outside this system; this is the value only.
    #[serde(default)]
    pub access_token: String,
    /// Token-bucket size, matching the service's published quota
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

fn default_requests_per_second() -> u32 {
    2
}

/// Full configuration surface consumed by the matching pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Marketplaces each input EAN is resolved on
    pub marketplaces: Vec<Marketplace>,
    pub worker_pool_size: usize,
    pub cache_ttl_seconds: u64,
    /// Minimum score a candidate must exceed to be matched
    pub match_threshold: f64,
    /// Minimum lead over the runner-up required for an unambiguous match
    pub separation_margin: f64,
    pub scoring_weights: ScoringWeights,
    pub max_retry_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Run-store (SQLite) path; optional third tier of path resolution
    pub run_store: Option<String>,
    pub primary: SourceConfig,
    pub fallback: SourceConfig,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            marketplaces: vec![Marketplace::DE],
            worker_pool_size: 4,
            cache_ttl_seconds: 86_400,
            match_threshold: 0.75,
            separation_margin: 0.05,
            scoring_weights: ScoringWeights::default(),
            max_retry_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 8_000,
            run_store: None,
            primary: SourceConfig {
                endpoint: "https://catalog.eu.example-primary.com".to_string(),
                access_token: String::new(),
                requests_per_second: default_requests_per_second(),
            },
            fallback: SourceConfig {
                endpoint: "https://search.eu.example-fallback.com".to_string(),
                access_token: String::new(),
                requests_per_second: 1,
            },
        }
    }
}

impl MatcherConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Validate value ranges; called once after loading
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(Error::Config("worker_pool_size must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.match_threshold) {
            return Err(Error::Config(format!(
                "match_threshold must be in [0, 1], got {}",
                self.match_threshold
            )));
        }
        if self.separation_margin < 0.0 {
            return Err(Error::Config(format!(
                "separation_margin must be non-negative, got {}",
                self.separation_margin
            )));
        }
        let w = &self.scoring_weights;
        if w.identifier < 0.0 || w.title < 0.0 || w.brand < 0.0 {
            return Err(Error::Config("scoring weights must be non-negative".to_string()));
        }
        if w.identifier + w.title + w.brand <= 0.0 {
            return Err(Error::Config("scoring weights must not all be zero".to_string()));
        }
        if self.max_retry_attempts == 0 {
            return Err(Error::Config("max_retry_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Load configuration following the resolution priority:
/// 1. Explicit `--config` path (must exist)
/// 2. Platform config file (`<config dir>/eanmatch/config.toml`) if present
/// 3. Compiled defaults
///
/// Access tokens may additionally be overridden by the
/// `EANMATCH_PRIMARY_TOKEN` / `EANMATCH_FALLBACK_TOKEN` environment
/// variables (values only; credential management is out of scope).
pub fn load_config(explicit_path: Option<&Path>) -> Result<MatcherConfig> {
    let mut config = match explicit_path {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("cannot read config file {}: {}", path.display(), e))
            })?;
            tracing::debug!(path = %path.display(), "Loaded config file");
            parse_config(&contents)?
        }
        None => match default_config_path() {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path)?;
                tracing::debug!(path = %path.display(), "Loaded config file");
                parse_config(&contents)?
            }
            _ => MatcherConfig::default(),
        },
    };

    if let Ok(token) = std::env::var("EANMATCH_PRIMARY_TOKEN") {
        config.primary.access_token = token;
    }
    if let Ok(token) = std::env::var("EANMATCH_FALLBACK_TOKEN") {
        config.fallback.access_token = token;
    }

    config.validate()?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<MatcherConfig> {
    toml::from_str(contents).map_err(|e| Error::Config(format!("invalid config file: {}", e)))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("eanmatch").join("config.toml"))
}

/// Resolve the run-store (SQLite) path following the priority order:
/// 1. Command-line argument (highest priority)
/// 2. `EANMATCH_RUN_STORE` environment variable
/// 3. `run_store` key in the config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_run_store_path(cli_arg: Option<&Path>, config: &MatcherConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var("EANMATCH_RUN_STORE") {
        return PathBuf::from(path);
    }

    if let Some(path) = &config.run_store {
        return PathBuf::from(path);
    }

    default_run_store_path()
}

/// OS-dependent default run-store location
fn default_run_store_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("eanmatch").join("eanmatch.db"))
        .unwrap_or_else(|| PathBuf::from("./eanmatch_data/eanmatch.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MatcherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.cache_ttl(), Duration::from_secs(86_400));
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: MatcherConfig = toml::from_str(
            r#"
            marketplaces = ["DE", "FR"]
            worker_pool_size = 8

            [primary]
            endpoint = "https://catalog.example.com"
            access_token = "token-a"
            requests_per_second = 5
            "#,
        )
        .unwrap();

        assert_eq!(
            config.marketplaces,
            vec![Marketplace::DE, Marketplace::FR]
        );
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.primary.requests_per_second, 5);
        // Untouched sections keep their defaults
        assert_eq!(config.match_threshold, 0.75);
        assert_eq!(config.fallback.requests_per_second, 1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = MatcherConfig::default();
        config.worker_pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = MatcherConfig::default();
        config.match_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = MatcherConfig::default();
        config.scoring_weights.identifier = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn cli_argument_wins_path_resolution() {
        let config = MatcherConfig {
            run_store: Some("/from/config.db".to_string()),
            ..Default::default()
        };
        let path = resolve_run_store_path(Some(Path::new("/from/cli.db")), &config);
        assert_eq!(path, PathBuf::from("/from/cli.db"));
    }

    #[test]
    fn config_file_path_used_without_cli_or_env() {
        let config = MatcherConfig {
            run_store: Some("/from/config.db".to_string()),
            ..Default::default()
        };
        // Note: assumes EANMATCH_RUN_STORE is not set in the test environment
        if std::env::var("EANMATCH_RUN_STORE").is_err() {
            let path = resolve_run_store_path(None, &config);
            assert_eq!(path, PathBuf::from("/from/config.db"));
        }
    }
}
