use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::ledger::is_null_account;

pub const DEFAULT_STATE_PATH: &str = "save-ledger.json";
pub const DEFAULT_CUSTODY: &str = "save-ledger";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("custody account must not be the null address")]
    NullCustody,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub state_path: PathBuf,
    pub custody_account: String,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            custody_account: DEFAULT_CUSTODY.to_string(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    /// Defaults, then the optional JSON file, then `SAVE_LEDGER_*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies overrides from `lookup`, which stands in for the process
    /// environment.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("SAVE_LEDGER_STATE") {
            self.state_path = PathBuf::from(path);
        }
        if let Some(custody) = lookup("SAVE_LEDGER_CUSTODY") {
            self.custody_account = custody;
        }
        if let Some(filter) = lookup("SAVE_LEDGER_LOG") {
            self.log_filter = filter;
        }
        self.custody_account = self.custody_account.trim().to_string();
        if is_null_account(&self.custody_account) {
            return Err(ConfigError::NullCustody);
        }
        Ok(self)
    }
}

/// Installs the stderr subscriber; `RUST_LOG` wins over the configured filter.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
