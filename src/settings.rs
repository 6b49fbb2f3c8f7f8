//! Adapter tuning settings.
//!
//! Defaults are persisted to a per-user config file. Environment variables
//! (`QOREDB_DS_*`) override any stored values so managed deployments can
//! pin timeouts and pool sizes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::error::{DataSourceError, EngineResult};
use crate::engine::pool::PoolConfig;
use crate::engine::timeout::{DEFAULT_QUERY_TIMEOUT_MS, SQLSERVER_QUERY_TIMEOUT_MS};

const CONFIG_FILE: &str = "datasource.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_connections: usize,
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout_ms: 600_000,
            acquire_timeout_ms: 30_000,
            sweep_interval_ms: 30_000,
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        PoolConfig::default()
            .with_min_connections(settings.min_connections)
            .with_max_connections(settings.max_connections.max(1))
            .with_idle_timeout(Duration::from_millis(settings.idle_timeout_ms))
            .with_acquire_timeout(Duration::from_millis(settings.acquire_timeout_ms))
            .with_sweep_interval(Duration::from_millis(settings.sweep_interval_ms.max(1)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    pub default_query_timeout_ms: u64,
    pub sqlserver_query_timeout_ms: u64,
    pub pool: PoolSettings,
    /// How long a warm Snowflake connection stays reusable
    pub warm_reuse_window_ms: u64,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            default_query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            sqlserver_query_timeout_ms: SQLSERVER_QUERY_TIMEOUT_MS,
            pool: PoolSettings::default(),
            warm_reuse_window_ms: 300_000,
        }
    }
}

fn config_path() -> PathBuf {
    if cfg!(windows) {
        let appdata = std::env::var_os("APPDATA")
            .unwrap_or_else(|| std::env::var_os("USERPROFILE").unwrap_or_default());
        let mut path = PathBuf::from(appdata);
        path.push("QoreDB");
        path.push(CONFIG_FILE);
        path
    } else {
        let home = std::env::var_os("HOME").unwrap_or_default();
        let mut path = PathBuf::from(home);
        path.push(".qoredb");
        path.push(CONFIG_FILE);
        path
    }
}

fn load_from_file(path: &Path) -> Option<AdapterSettings> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(settings) => Some(settings),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Ignoring unreadable adapter settings");
            None
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: String) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring non-numeric override");
            None
        }
    }
}

impl AdapterSettings {
    pub fn warm_reuse_window(&self) -> Duration {
        Duration::from_millis(self.warm_reuse_window_ms)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::from(&self.pool)
    }

    /// Applies `QOREDB_DS_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let u64_var = |key: &str| lookup(key).and_then(|raw| parse_number::<u64>(key, raw));
        let usize_var = |key: &str| lookup(key).and_then(|raw| parse_number::<usize>(key, raw));

        if let Some(value) = u64_var("QOREDB_DS_QUERY_TIMEOUT_MS") {
            self.default_query_timeout_ms = value;
        }
        if let Some(value) = u64_var("QOREDB_DS_SQLSERVER_QUERY_TIMEOUT_MS") {
            self.sqlserver_query_timeout_ms = value;
        }
        if let Some(value) = usize_var("QOREDB_DS_POOL_MIN") {
            self.pool.min_connections = value;
        }
        if let Some(value) = usize_var("QOREDB_DS_POOL_MAX") {
            self.pool.max_connections = value;
        }
        if let Some(value) = u64_var("QOREDB_DS_POOL_IDLE_TIMEOUT_MS") {
            self.pool.idle_timeout_ms = value;
        }
        if let Some(value) = u64_var("QOREDB_DS_POOL_ACQUIRE_TIMEOUT_MS") {
            self.pool.acquire_timeout_ms = value;
        }
        if let Some(value) = u64_var("QOREDB_DS_POOL_SWEEP_INTERVAL_MS") {
            self.pool.sweep_interval_ms = value;
        }
        if let Some(value) = u64_var("QOREDB_DS_WARM_REUSE_WINDOW_MS") {
            self.warm_reuse_window_ms = value;
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let mut settings = load_from_file(path).unwrap_or_default();
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings
    }

    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    pub fn save_to_file(&self) -> EngineResult<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DataSourceError::configuration(format!("Failed to create config directory: {}", e))
            })?;
        }

        let payload = serde_json::to_string_pretty(self)
            .map_err(|e| DataSourceError::configuration(format!("Save failed: {}", e)))?;
        fs::write(&path, payload)
            .map_err(|e| DataSourceError::configuration(format!("Save failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let settings = AdapterSettings::default();
        assert_eq!(settings.default_query_timeout_ms, 60_000);
        assert_eq!(settings.sqlserver_query_timeout_ms, 120_000);
        assert_eq!(settings.warm_reuse_window(), Duration::from_secs(300));

        let pool = settings.pool_config();
        assert_eq!(pool.min_connections, 1);
        assert_eq!(pool.max_connections, 10);
        assert_eq!(pool.idle_timeout, Duration::from_secs(600));
        assert_eq!(pool.acquire_timeout, Duration::from_secs(30));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: AdapterSettings =
            serde_json::from_str(r#"{"pool": {"max_connections": 3}, "default_query_timeout_ms": 5000}"#)
                .unwrap();
        assert_eq!(settings.pool.max_connections, 3);
        assert_eq!(settings.pool.min_connections, 1);
        assert_eq!(settings.default_query_timeout_ms, 5_000);
        assert_eq!(settings.sqlserver_query_timeout_ms, 120_000);
    }

    #[test]
    fn env_overrides_win_and_bad_values_are_ignored() {
        let vars: HashMap<&str, &str> = [
            ("QOREDB_DS_POOL_MAX", "4"),
            ("QOREDB_DS_QUERY_TIMEOUT_MS", "not-a-number"),
            ("QOREDB_DS_WARM_REUSE_WINDOW_MS", " 1000 "),
        ]
        .into_iter()
        .collect();

        let mut settings = AdapterSettings::default();
        settings.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.pool.max_connections, 4);
        assert_eq!(settings.default_query_timeout_ms, 60_000);
        assert_eq!(settings.warm_reuse_window_ms, 1_000);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("qoredb-datasource-missing-settings.json");
        let _ = fs::remove_file(&path);
        let settings = load_from_file(&path);
        assert!(settings.is_none());
    }
}
