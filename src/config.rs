//! Configuration binding and hot reload.
//!
//! Endpoint settings bind from YAML into typed structs and are held as an
//! atomically swappable snapshot. Lookups read the current snapshot; a
//! `reload` re-reads the source and swaps, leaving in-flight executions on
//! the snapshot they captured.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no endpoint named '{name}' is configured")]
    UnknownEndpoint { name: String },

    #[error("invalid duration '{value}': expected HH:MM:SS")]
    InvalidDuration { value: String },

    #[error("settings source unavailable: {0}")]
    Source(String),
}

/// Serde adapter for `"HH:MM:SS(.fff)"` duration strings, the form the
/// hierarchical configuration uses.
pub mod duration_str {
    use super::ConfigError;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn parse(value: &str) -> Result<Duration, ConfigError> {
        let invalid = || ConfigError::InvalidDuration {
            value: value.to_string(),
        };
        let parts: Vec<&str> = value.split(':').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let hours: u64 = parts[0].parse().map_err(|_| invalid())?;
        let minutes: u64 = parts[1].parse().map_err(|_| invalid())?;
        let seconds: f64 = parts[2].parse().map_err(|_| invalid())?;
        if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
            return Err(invalid());
        }
        let total = (hours * 3600 + minutes * 60) as f64 + seconds;
        Ok(Duration::from_secs_f64(total))
    }

    pub fn format(duration: &Duration) -> String {
        let total_ms = duration.as_millis();
        let hours = total_ms / 3_600_000;
        let minutes = (total_ms % 3_600_000) / 60_000;
        let seconds = (total_ms % 60_000) / 1000;
        let millis = total_ms % 1000;
        if millis == 0 {
            format!("{hours:02}:{minutes:02}:{seconds:02}")
        } else {
            format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
        }
    }

    pub fn serialize<S: Serializer>(duration: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format(duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(de)?;
        parse(&raw).map_err(de::Error::custom)
    }
}

/// Raw per-endpoint settings as they appear in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub uri: String,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    pub retries: u32,
    #[serde(with = "duration_str")]
    pub retry_delay_seed: Duration,
    #[serde(with = "duration_str")]
    pub retry_delay_maximum: Duration,
    pub failure_threshold: f64,
    #[serde(with = "duration_str")]
    pub failure_sampling_duration: Duration,
    pub failure_minimum_throughput: u32,
    #[serde(with = "duration_str")]
    pub failure_break_duration: Duration,
    pub rate_limit: u32,
    #[serde(with = "duration_str")]
    pub rate_limit_period: Duration,
    pub isolate: bool,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            uri: String::new(),
            timeout: Duration::from_secs(5),
            retries: 0,
            retry_delay_seed: Duration::from_secs(1),
            retry_delay_maximum: Duration::from_secs(10),
            failure_threshold: 0.5,
            failure_sampling_duration: Duration::from_secs(30),
            failure_minimum_throughput: 10,
            failure_break_duration: Duration::from_secs(60),
            rate_limit: 0,
            rate_limit_period: Duration::from_secs(60),
            isolate: false,
        }
    }
}

/// Root of the `api` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiSettings {
    #[serde(default)]
    pub api: ApiSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_operation_prefix")]
    pub operation_prefix: String,
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointSettings>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            operation_prefix: default_operation_prefix(),
            endpoints: HashMap::new(),
        }
    }
}

fn default_operation_prefix() -> String {
    "Api".to_string()
}

/// Immutable per-lookup snapshot of one dependency's settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub name: String,
    pub uri: String,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay_seed: Duration,
    pub retry_delay_maximum: Duration,
    pub failure_threshold: f64,
    pub failure_sampling_duration: Duration,
    pub failure_minimum_throughput: u32,
    pub failure_break_duration: Duration,
    pub rate_limit: u32,
    pub rate_limit_period: Duration,
    pub isolate: bool,
}

impl EndpointConfig {
    fn from_settings(name: &str, settings: &EndpointSettings) -> Self {
        Self {
            name: name.to_string(),
            uri: settings.uri.clone(),
            timeout: settings.timeout,
            retries: settings.retries,
            retry_delay_seed: settings.retry_delay_seed,
            retry_delay_maximum: settings.retry_delay_maximum,
            failure_threshold: settings.failure_threshold,
            failure_sampling_duration: settings.failure_sampling_duration,
            failure_minimum_throughput: settings.failure_minimum_throughput,
            failure_break_duration: settings.failure_break_duration,
            rate_limit: settings.rate_limit,
            rate_limit_period: settings.rate_limit_period,
            isolate: settings.isolate,
        }
    }
}

/// A live source of settings, re-queried on every reload.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn load(&self) -> Result<ApiSettings, ConfigError>;
}

/// Loads settings from a YAML file on disk.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SettingsSource for FileSource {
    async fn load(&self) -> Result<ApiSettings, ConfigError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

/// In-memory source whose contents can be replaced between reloads. Hosts
/// use it when settings come from an outer configuration system; tests use
/// it to drive reload behavior.
pub struct StaticSource {
    current: Mutex<ApiSettings>,
}

impl StaticSource {
    pub fn new(settings: ApiSettings) -> Self {
        Self {
            current: Mutex::new(settings),
        }
    }

    /// Replace the settings the next `load` will observe.
    pub fn replace(&self, settings: ApiSettings) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = settings;
        }
    }
}

#[async_trait]
impl SettingsSource for StaticSource {
    async fn load(&self) -> Result<ApiSettings, ConfigError> {
        self.current
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| ConfigError::Source("settings lock poisoned".to_string()))
    }
}

/// Hot-reloadable settings store.
pub struct ConfigStore {
    source: Arc<dyn SettingsSource>,
    snapshot: ArcSwap<ApiSettings>,
}

impl ConfigStore {
    /// Load the initial snapshot from the source.
    pub async fn new(source: Arc<dyn SettingsSource>) -> Result<Self, ConfigError> {
        let initial = source.load().await?;
        Ok(Self {
            source,
            snapshot: ArcSwap::from_pointee(initial),
        })
    }

    /// Current settings snapshot.
    pub fn snapshot(&self) -> Arc<ApiSettings> {
        self.snapshot.load_full()
    }

    /// The operation-key prefix of the current snapshot.
    pub fn operation_prefix(&self) -> String {
        self.snapshot.load().api.operation_prefix.clone()
    }

    /// Per-lookup snapshot of one endpoint's settings.
    pub fn endpoint(&self, name: &str) -> Result<EndpointConfig, ConfigError> {
        let snapshot = self.snapshot.load();
        snapshot
            .api
            .endpoints
            .get(name)
            .map(|settings| EndpointConfig::from_settings(name, settings))
            .ok_or_else(|| ConfigError::UnknownEndpoint {
                name: name.to_string(),
            })
    }

    /// Re-read the source and atomically swap the snapshot.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let fresh = self.source.load().await?;
        self.snapshot.store(Arc::new(fresh));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hms_durations() {
        assert_eq!(
            duration_str::parse("00:00:05").unwrap(),
            Duration::from_secs(5)
        );
        assert_eq!(
            duration_str::parse("00:01:00").unwrap(),
            Duration::from_secs(60)
        );
        assert_eq!(
            duration_str::parse("01:30:00").unwrap(),
            Duration::from_secs(5400)
        );
        assert_eq!(
            duration_str::parse("00:00:00.250").unwrap(),
            Duration::from_millis(250)
        );
        assert!(duration_str::parse("5s").is_err());
        assert!(duration_str::parse("00:99:00").is_err());
    }

    #[test]
    fn formats_round_trip() {
        for duration in [
            Duration::from_secs(5),
            Duration::from_secs(90),
            Duration::from_millis(1500),
            Duration::from_secs(3600),
        ] {
            let text = duration_str::format(&duration);
            assert_eq!(duration_str::parse(&text).unwrap(), duration);
        }
    }

    #[test]
    fn binds_yaml_settings() {
        let yaml = r#"
api:
  operation_prefix: Api
  endpoints:
    movies:
      uri: "https://upstream/api"
      timeout: "00:00:05"
      retries: 2
      retry_delay_seed: "00:00:01"
      retry_delay_maximum: "00:00:10"
      failure_threshold: 0.5
      failure_sampling_duration: "00:00:30"
      failure_minimum_throughput: 2
      failure_break_duration: "00:01:00"
      rate_limit: 10
      rate_limit_period: "00:01:00"
      isolate: false
"#;
        let settings: ApiSettings = serde_yaml::from_str(yaml).unwrap();
        let movies = &settings.api.endpoints["movies"];
        assert_eq!(movies.timeout, Duration::from_secs(5));
        assert_eq!(movies.retries, 2);
        assert_eq!(movies.failure_minimum_throughput, 2);
        assert_eq!(movies.rate_limit, 10);
        assert_eq!(movies.rate_limit_period, Duration::from_secs(60));
        assert!(!movies.isolate);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let yaml = r#"
api:
  endpoints:
    users:
      uri: "https://upstream/users"
"#;
        let settings: ApiSettings = serde_yaml::from_str(yaml).unwrap();
        let users = &settings.api.endpoints["users"];
        assert_eq!(users.timeout, Duration::from_secs(5));
        assert_eq!(users.retries, 0);
        assert_eq!(users.rate_limit, 0);
        assert_eq!(settings.api.operation_prefix, "Api");
    }

    #[tokio::test]
    async fn store_reload_swaps_snapshot() {
        let mut settings = ApiSettings::default();
        settings
            .api
            .endpoints
            .insert("movies".to_string(), EndpointSettings::default());
        let source = Arc::new(StaticSource::new(settings.clone()));
        let store = ConfigStore::new(source.clone()).await.unwrap();
        assert_eq!(store.endpoint("movies").unwrap().retries, 0);

        settings.api.endpoints.get_mut("movies").unwrap().retries = 4;
        source.replace(settings);
        assert_eq!(store.endpoint("movies").unwrap().retries, 0);
        store.reload().await.unwrap();
        assert_eq!(store.endpoint("movies").unwrap().retries, 4);
    }

    #[tokio::test]
    async fn file_source_loads_yaml() {
        let path = std::env::temp_dir().join(format!(
            "callguard-settings-{}.yaml",
            std::process::id()
        ));
        let yaml = r#"
api:
  endpoints:
    movies:
      uri: "https://upstream/api"
      timeout: "00:00:03"
"#;
        tokio::fs::write(&path, yaml).await.unwrap();
        let store = ConfigStore::new(Arc::new(FileSource::new(&path)))
            .await
            .unwrap();
        assert_eq!(
            store.endpoint("movies").unwrap().timeout,
            Duration::from_secs(3)
        );
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn unknown_endpoint_is_an_error() {
        let source = Arc::new(StaticSource::new(ApiSettings::default()));
        let store = ConfigStore::new(source).await.unwrap();
        assert!(matches!(
            store.endpoint("nope"),
            Err(ConfigError::UnknownEndpoint { .. })
        ));
    }
}
