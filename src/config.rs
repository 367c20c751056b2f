use std::str::FromStr;
use std::time::Duration;
use std::{env, path::PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::coalescer::CoalescerSettings;
use crate::error::ConfigError;
use crate::queue::QueueSettings;

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Reads the process environment after loading an optional `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(err) => warn!(error = %err, "could not parse {}", env_file.display()),
            }
        } else {
            info!("no .env at {}, using process environment", env_file.display());
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// Fixed in-memory configuration, for tests and embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Box::new(Self { map })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Typed settings read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub nats_url: String,
    pub log_level: String,
    pub flows_dir: PathBuf,
    pub queue: QueueSettings,
    pub coalescer: CoalescerSettings,
    pub crm_base_url: String,
    pub crm_access_token: String,
    pub dialer_api_url: String,
    pub dialer_api_key: String,
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            nats_url: "nats://localhost:4222".into(),
            log_level: "info".into(),
            flows_dir: PathBuf::from("./flows"),
            queue: QueueSettings::default(),
            coalescer: CoalescerSettings::default(),
            crm_base_url: String::new(),
            crm_access_token: String::new(),
            dialer_api_url: String::new(),
            dialer_api_key: String::new(),
            shutdown_grace: Duration::from_millis(5000),
        }
    }
}

impl Settings {
    pub async fn load(config: &ConfigManager) -> Result<Settings, ConfigError> {
        let rps: usize = positive(config, "DISPATCH_RPS", 7).await?;
        let max_batch: usize = positive(config, "DISPATCH_MAX_BATCH", 200).await?;
        let queue = QueueSettings {
            requests_per_second: rps,
            max_batch,
            queue_depth: positive(config, "DISPATCH_QUEUE_DEPTH", 1000).await?,
            max_in_flight: positive(config, "DISPATCH_MAX_IN_FLIGHT", rps).await?,
        };
        let coalescer = CoalescerSettings {
            window: Duration::from_millis(positive(config, "COALESCE_WINDOW_MS", 2000).await?),
            flush_size: positive(config, "COALESCE_FLUSH_SIZE", 100).await?,
            max_batch,
        };
        Ok(Settings {
            nats_url: text(config, "NATS_URL", "nats://localhost:4222").await,
            log_level: text(config, "LOG_LEVEL", "info").await,
            flows_dir: PathBuf::from(text(config, "FLOWS_DIR", "./flows").await),
            queue,
            coalescer,
            crm_base_url: text(config, "CRM_BASE_URL", "").await,
            crm_access_token: text(config, "CRM_ACCESS_TOKEN", "").await,
            dialer_api_url: text(config, "DIALER_API_URL", "").await,
            dialer_api_key: text(config, "DIALER_API_KEY", "").await,
            shutdown_grace: Duration::from_millis(positive(config, "SHUTDOWN_GRACE_MS", 5000).await?),
        })
    }
}

async fn text(config: &ConfigManager, key: &str, default: &str) -> String {
    config
        .get(key)
        .await
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

async fn positive<T>(config: &ConfigManager, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = config.get(key).await.filter(|v| !v.trim().is_empty()) else {
        return Ok(default);
    };
    let invalid = |reason: String| ConfigError::Invalid {
        key: key.to_string(),
        value: raw.clone(),
        reason,
    };
    let value: T = raw.trim().parse().map_err(|e: T::Err| invalid(e.to_string()))?;
    if value <= T::default() {
        return Err(invalid("must be greater than zero".to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn map_config_manager_basic() {
        let mgr = MapConfigManager::from_pairs([("foo", "bar"), ("empty", "")]);
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));
        assert_eq!(mgr.get("empty").await, Some(String::new()));
        assert_eq!(mgr.get("missing").await, None);

        let config = ConfigManager(mgr);
        let copy = config.clone();
        assert_eq!(copy.get("foo").await, Some("bar".to_string()));
        assert_eq!(format!("{copy:?}"), "MapConfigManager(2 entries)");
    }

    #[tokio::test]
    async fn env_config_manager_reads_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "LEADFLOW_TEST_RPS=9\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(mgr.get("LEADFLOW_TEST_RPS").await, Some("9".to_string()));
    }

    #[tokio::test]
    async fn settings_defaults() {
        let settings = Settings::load(&ConfigManager(MapConfigManager::new())).await.unwrap();
        assert_eq!(settings.nats_url, "nats://localhost:4222");
        assert_eq!(settings.queue, QueueSettings::default());
        assert_eq!(settings.coalescer, CoalescerSettings::default());
        assert_eq!(settings.shutdown_grace, Duration::from_secs(5));
        assert_eq!(settings.flows_dir, PathBuf::from("./flows"));
        assert_eq!(settings, Settings::default());
    }

    #[tokio::test]
    async fn settings_overrides_and_in_flight_follows_rps() {
        let config = ConfigManager(MapConfigManager::from_pairs([
            ("DISPATCH_RPS", "3"),
            ("DISPATCH_MAX_BATCH", "50"),
            ("COALESCE_WINDOW_MS", "250"),
        ]));
        let settings = Settings::load(&config).await.unwrap();
        assert_eq!(settings.queue.requests_per_second, 3);
        assert_eq!(settings.queue.max_in_flight, 3);
        assert_eq!(settings.coalescer.max_batch, 50);
        assert_eq!(settings.coalescer.window, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn zero_or_garbage_is_rejected() {
        let config = ConfigManager(MapConfigManager::from_pairs([("DISPATCH_RPS", "0")]));
        assert!(matches!(
            Settings::load(&config).await,
            Err(ConfigError::Invalid { key, .. }) if key == "DISPATCH_RPS"
        ));
        let config = ConfigManager(MapConfigManager::from_pairs([("COALESCE_FLUSH_SIZE", "lots")]));
        assert!(Settings::load(&config).await.is_err());
    }
}
