//! Agent configuration read from the environment.
//!
//! | Variable                   | Default                      |
//! |----------------------------|------------------------------|
//! | `STORAGE_PATH`             | `./data/storefront-sync.sled` |
//! | `PORT`                     | `5000`                       |
//! | `SUPABASE_URL`             | unset (mock catalog)         |
//! | `SUPABASE_ANON_KEY`        | unset (mock catalog)         |
//! | `SYNC_POLL_SECS`           | `30`                         |
//! | `SYNC_TIMEOUT_SECS`        | `10`                         |
//! | `SYNC_QUEUE_FAILED_WRITES` | `true`                       |
//! | `SYNC_WATCHED`             | every collection             |

use std::str::FromStr;
use std::time::Duration;

use crate::gateway::RestConfig;
use crate::model::EntityType;
use crate::storage::StorageConfig;
use crate::sync::SyncConfig;

const DEFAULT_PORT: u16 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {name}={value:?}: {reason}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
    pub reason: String,
}

/// Everything the agent binary needs to start
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub port: u16,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    /// Remote database; `None` serves the built-in mock catalog
    pub rest: Option<RestConfig>,
}

impl AgentConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let port = parse(&var, "PORT", |v| v.parse::<u16>().map_err(|e| e.to_string()))?
            .unwrap_or(DEFAULT_PORT);

        let storage = match var("STORAGE_PATH") {
            Some(path) => StorageConfig::new(path),
            None => StorageConfig::default(),
        };

        let mut sync = SyncConfig::default();
        if let Some(secs) = parse(&var, "SYNC_POLL_SECS", parse_secs)? {
            sync = sync.with_poll_interval(secs);
        }
        if let Some(secs) = parse(&var, "SYNC_TIMEOUT_SECS", parse_secs)? {
            sync = sync.with_call_timeout(secs);
        }
        if let Some(enabled) = parse(&var, "SYNC_QUEUE_FAILED_WRITES", parse_bool)? {
            sync = sync.with_queue_failed_writes(enabled);
        }
        if let Some(watched) = parse(&var, "SYNC_WATCHED", parse_watched)? {
            sync = sync.with_watched(watched);
        }

        let rest = match (var("SUPABASE_URL"), var("SUPABASE_ANON_KEY")) {
            (Some(url), Some(key)) => Some(RestConfig::new(url, key)),
            _ => None,
        };

        Ok(Self {
            port,
            storage,
            sync,
            rest,
        })
    }
}

fn parse<T, V>(
    var: &V,
    name: &'static str,
    convert: impl Fn(&str) -> Result<T, String>,
) -> Result<Option<T>, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    let Some(value) = var(name) else {
        return Ok(None);
    };
    convert(value.trim()).map(Some).map_err(|reason| ConfigError {
        name,
        value,
        reason,
    })
}

fn parse_secs(value: &str) -> Result<Duration, String> {
    match value.parse::<u64>() {
        Ok(0) => Err("must be at least 1 second".to_string()),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err("expected true or false".to_string()),
    }
}

fn parse_watched(value: &str) -> Result<Vec<EntityType>, String> {
    let mut watched = Vec::new();
    for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let entity_type = EntityType::from_str(name).map_err(|e| e.to_string())?;
        if !watched.contains(&entity_type) {
            watched.push(entity_type);
        }
    }
    if watched.is_empty() {
        return Err("no collections listed".to_string());
    }
    Ok(watched)
}
