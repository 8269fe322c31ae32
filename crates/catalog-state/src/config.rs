//! catalog.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::RegisterRequest;

const DEFAULT_WAIT: Duration = Duration::from_secs(5 * 60);
const MAX_WAIT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub query: QueryConfig,
    /// Registrations applied by [`CatalogConfig::apply_seeds`].
    #[serde(default)]
    pub register: Vec<SeedRegistration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file. The store is kept in memory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Wait used when a blocking query asks for none (e.g. "5m").
    pub default_wait: Option<String>,
    /// Upper bound on any blocking query wait (e.g. "10m").
    pub max_wait: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeedRegistration {
    pub index: u64,
    #[serde(flatten)]
    pub request: RegisterRequest,
}

impl CatalogConfig {
    pub fn from_file(path: &Path) -> StateResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StateError::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> StateResult<Self> {
        toml::from_str(content).map_err(|e| StateError::Config(e.to_string()))
    }

    /// Open the store this config points at.
    pub fn open_store(&self) -> StateResult<StateStore> {
        match &self.store.path {
            Some(path) => StateStore::open(path),
            None => StateStore::open_in_memory(),
        }
    }

    /// Apply the seed registrations in order.
    pub fn apply_seeds(&self, store: &StateStore) -> StateResult<()> {
        for seed in &self.register {
            store.ensure_registration(seed.index, &seed.request)?;
        }
        debug!(count = self.register.len(), "seed registrations applied");
        Ok(())
    }
}

impl QueryConfig {
    pub fn default_wait(&self) -> StateResult<Duration> {
        parse_setting("default_wait", self.default_wait.as_deref(), DEFAULT_WAIT)
    }

    pub fn max_wait(&self) -> StateResult<Duration> {
        parse_setting("max_wait", self.max_wait.as_deref(), MAX_WAIT)
    }

    /// Resolve a caller's requested wait: zero means the default, anything
    /// above the maximum is capped.
    pub fn clamp_wait(&self, requested: Duration) -> StateResult<Duration> {
        let wait = if requested.is_zero() {
            self.default_wait()?
        } else {
            requested
        };
        Ok(wait.min(self.max_wait()?))
    }
}

fn parse_setting(name: &str, value: Option<&str>, default: Duration) -> StateResult<Duration> {
    match value {
        Some(s) => parse_duration(s)
            .ok_or_else(|| StateError::Config(format!("invalid {name} duration: {s:?}"))),
        None => Ok(default),
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
