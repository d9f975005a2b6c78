//! # Sync Configuration
//!
//! Configuration management for the gateway and the collection engines.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FORREST_HOST=example.org                                           │
//! │     FORREST_USERNAME=alice                                             │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/sync/sync.toml (Linux)                                   │
//! │     ~/Library/Application Support/com.forrest.sync/sync.toml (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     http://{events,tree}.localhost:80, user "user"                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [server]
//! scheme = "https"
//! host = "example.org"
//! port = 443
//! username = "alice"
//!
//! [gateway]
//! reconnect_backoff_ms = 5000
//!
//! [engine]
//! busy_timeout_secs = 30
//!
//! [[collections]]
//! name = "tasks"
//!
//! [[collections]]
//! name = "contacts"
//! indexes = { by_email = "email" }
//! ```

use forrest_core::{
    validate_collection_name, FreshnessWindow, IndexSchema, RecordId, Watermark,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

const DAY_SECS: u64 = 24 * 3600;

// =============================================================================
// Server Settings
// =============================================================================

/// Where the backend lives.
///
/// The two bases are derived as `{scheme}://events.{host}:{port}` and
/// `{scheme}://tree.{host}:{port}` unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// `http` or `https`.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Account whose event stream is followed.
    #[serde(default = "default_username")]
    pub username: String,

    /// Full events base URL, replacing the derived one.
    #[serde(default)]
    pub events_url: Option<String>,

    /// Full tree base URL, replacing the derived one.
    #[serde(default)]
    pub tree_url: Option<String>,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    80
}

fn default_username() -> String {
    "user".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            scheme: default_scheme(),
            host: default_host(),
            port: default_port(),
            username: default_username(),
            events_url: None,
            tree_url: None,
        }
    }
}

// =============================================================================
// Gateway Settings
// =============================================================================

/// Event stream behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Fixed delay before re-opening a closed stream (milliseconds).
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,

    /// Connection timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Consecutive stream failures before giving up.
    /// Set to 0 for infinite retries.
    #[serde(default)]
    pub max_retries: u32,

    /// Watermarks younger than this are left to the stream replay (seconds).
    #[serde(default = "default_freshness_short")]
    pub freshness_short_secs: u64,

    /// Watermarks older than this are too old for the event log (seconds).
    #[serde(default = "default_freshness_long")]
    pub freshness_long_secs: u64,
}

fn default_reconnect_backoff() -> u64 {
    5000
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_freshness_short() -> u64 {
    3600
}
fn default_freshness_long() -> u64 {
    25 * DAY_SECS
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            reconnect_backoff_ms: default_reconnect_backoff(),
            connect_timeout_secs: default_connect_timeout(),
            max_retries: 0,
            freshness_short_secs: default_freshness_short(),
            freshness_long_secs: default_freshness_long(),
        }
    }
}

impl GatewaySettings {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn freshness_window(&self) -> FreshnessWindow {
        FreshnessWindow {
            short: Duration::from_secs(self.freshness_short_secs),
            long: Duration::from_secs(self.freshness_long_secs),
        }
    }
}

// =============================================================================
// Engine Settings
// =============================================================================

/// Per-collection engine behaviour, shared by all collections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Busy flag clears itself (and alerts) after this long (seconds).
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,

    /// A last-update mark older than this triggers a full bootstrap (seconds).
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,

    /// Delay before local record lists and the watermark are written
    /// (milliseconds). 0 writes immediately.
    #[serde(default = "default_persist_debounce")]
    pub persist_debounce_ms: u64,
}

fn default_busy_timeout() -> u64 {
    30
}
fn default_staleness() -> u64 {
    25 * DAY_SECS
}
fn default_persist_debounce() -> u64 {
    500
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            busy_timeout_secs: default_busy_timeout(),
            staleness_secs: default_staleness(),
            persist_debounce_ms: default_persist_debounce(),
        }
    }
}

impl EngineSettings {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

// =============================================================================
// Storage & Collections
// =============================================================================

/// Local database location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file. Defaults to `forrest.db` in the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// One synchronised collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,

    /// Index name to record field. Present means the collection is kept in
    /// an indexed table; absent means a plain persisted list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<IndexSchema>,
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        CollectionConfig {
            name: name.into(),
            indexes: None,
        }
    }
}

// =============================================================================
// Endpoints
// =============================================================================

/// Resolved backend URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    events: Url,
    tree: Url,
}

impl Endpoints {
    /// Builds endpoints from explicit base URLs.
    pub fn new(events: &str, tree: &str) -> SyncResult<Self> {
        Ok(Endpoints {
            events: parse_base(events)?,
            tree: parse_base(tree)?,
        })
    }

    pub fn events_base(&self) -> &Url {
        &self.events
    }

    pub fn tree_base(&self) -> &Url {
        &self.tree
    }

    /// `GET {events}/batch/{since}`
    pub fn event_batch(&self, since: &Watermark) -> SyncResult<Url> {
        join(&self.events, &["batch", &since.since_segment()])
    }

    /// `GET {events}/stream/{username}/{since}`
    pub fn stream(&self, username: &str, since: &Watermark) -> SyncResult<Url> {
        join(&self.events, &["stream", username, &since.since_segment()])
    }

    /// `GET {tree}/batch/{collection}`
    pub fn collection_batch(&self, collection: &str) -> SyncResult<Url> {
        join(&self.tree, &["batch", collection])
    }

    /// `POST {tree}/rest/{collection}/`
    pub fn collection(&self, collection: &str) -> SyncResult<Url> {
        join(&self.tree, &["rest", collection, ""])
    }

    /// `GET|PUT {tree}/rest/{collection}/{id}`
    pub fn record(&self, collection: &str, id: &RecordId) -> SyncResult<Url> {
        join(&self.tree, &["rest", collection, id.as_str()])
    }

    /// `DELETE {tree}/rest/{collection}/{id}/{target}`
    pub fn record_target(&self, collection: &str, id: &RecordId, target: &str) -> SyncResult<Url> {
        join(&self.tree, &["rest", collection, id.as_str(), target])
    }
}

fn parse_base(raw: &str) -> SyncResult<Url> {
    let url = Url::parse(raw).map_err(|e| SyncError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SyncError::InvalidUrl(format!(
            "{raw}: scheme must be http or https"
        )));
    }
    if url.cannot_be_a_base() {
        return Err(SyncError::InvalidUrl(format!("{raw}: not a base URL")));
    }
    Ok(url)
}

/// Appends percent-encoded path segments to `base`.
fn join(base: &Url, segments: &[&str]) -> SyncResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| SyncError::InvalidUrl(format!("{base}: not a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if !matches!(self.server.scheme.as_str(), "http" | "https") {
            return Err(SyncError::InvalidConfig(format!(
                "scheme must be http or https, got: {}",
                self.server.scheme
            )));
        }

        if self.server.host.trim().is_empty() {
            return Err(SyncError::InvalidConfig("host must not be empty".into()));
        }

        if self.server.username.trim().is_empty() {
            return Err(SyncError::InvalidConfig("username must not be empty".into()));
        }

        // Surfaces bad overrides as InvalidUrl
        self.endpoints()?;

        if self.gateway.reconnect_backoff_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "reconnect_backoff_ms must be greater than 0".into(),
            ));
        }

        if self.gateway.freshness_short_secs >= self.gateway.freshness_long_secs {
            return Err(SyncError::InvalidConfig(
                "freshness_short_secs must be less than freshness_long_secs".into(),
            ));
        }

        if self.engine.busy_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "busy_timeout_secs must be greater than 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for collection in &self.collections {
            validate_collection_name(&collection.name)?;
            if !seen.insert(collection.name.as_str()) {
                return Err(SyncError::InvalidConfig(format!(
                    "collection '{}' is configured twice",
                    collection.name
                )));
            }
            if let Some(indexes) = &collection.indexes {
                indexes.resolved()?;
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("FORREST_HOST") {
            debug!(host = %host, "Overriding host from environment");
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("FORREST_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.server.port = p,
                Err(_) => warn!(port = %port, "Ignoring invalid FORREST_PORT"),
            }
        }

        if let Ok(scheme) = std::env::var("FORREST_SCHEME") {
            self.server.scheme = scheme.to_lowercase();
        }

        if let Ok(username) = std::env::var("FORREST_USERNAME") {
            self.server.username = username;
        }

        if let Ok(url) = std::env::var("FORREST_EVENTS_URL") {
            debug!(url = %url, "Overriding events URL from environment");
            self.server.events_url = Some(url);
        }

        if let Ok(url) = std::env::var("FORREST_TREE_URL") {
            debug!(url = %url, "Overriding tree URL from environment");
            self.server.tree_url = Some(url);
        }

        if let Ok(path) = std::env::var("FORREST_DB_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "forrest", "sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Resolves the events and tree base URLs.
    pub fn endpoints(&self) -> SyncResult<Endpoints> {
        let server = &self.server;
        let derived = |sub: &str| {
            format!("{}://{}.{}:{}", server.scheme, sub, server.host, server.port)
        };
        let events = server.events_url.clone().unwrap_or_else(|| derived("events"));
        let tree = server.tree_url.clone().unwrap_or_else(|| derived("tree"));
        Endpoints::new(&events, &tree)
    }

    /// Returns the SQLite file to open.
    pub fn database_path(&self) -> PathBuf {
        self.storage.database_path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "forrest", "sync")
                .map(|dirs| dirs.data_dir().join("forrest.db"))
                .unwrap_or_else(|| PathBuf::from("forrest.db"))
        })
    }

    pub fn username(&self) -> &str {
        &self.server.username
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forrest_core::Timestamp;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.server.port, 80);
        assert_eq!(config.gateway.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(config.engine.busy_timeout(), Duration::from_secs(30));
        assert_eq!(config.gateway.freshness_window(), FreshnessWindow::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_endpoints() {
        let mut config = SyncConfig::default();
        config.server.scheme = "https".into();
        config.server.host = "example.org".into();
        config.server.port = 8443;

        let endpoints = config.endpoints().unwrap();
        assert_eq!(
            endpoints.events_base().as_str(),
            "https://events.example.org:8443/"
        );
        assert_eq!(
            endpoints.collection_batch("tasks").unwrap().as_str(),
            "https://tree.example.org:8443/batch/tasks"
        );
    }

    #[test]
    fn test_endpoint_paths() {
        let endpoints = Endpoints::new("http://127.0.0.1:9000", "http://127.0.0.1:9001/api/").unwrap();
        let id = RecordId::from("a b");
        let mark = Watermark::at(Timestamp::from_millis(42));

        assert_eq!(
            endpoints.stream("alice", &Watermark::default()).unwrap().as_str(),
            "http://127.0.0.1:9000/stream/alice/"
        );
        assert_eq!(
            endpoints.event_batch(&mark).unwrap().as_str(),
            "http://127.0.0.1:9000/batch/42"
        );
        assert_eq!(
            endpoints.collection("tasks").unwrap().as_str(),
            "http://127.0.0.1:9001/api/rest/tasks/"
        );
        assert_eq!(
            endpoints.record("tasks", &id).unwrap().as_str(),
            "http://127.0.0.1:9001/api/rest/tasks/a%20b"
        );
        assert_eq!(
            endpoints.record_target("tasks", &id, "").unwrap().as_str(),
            "http://127.0.0.1:9001/api/rest/tasks/a%20b/"
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.server.scheme = "ftp".into();
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
        config.server.scheme = "http".into();

        config.server.events_url = Some("not a url".into());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));
        config.server.events_url = None;

        config.collections = vec![CollectionConfig::new("tasks"), CollectionConfig::new("tasks")];
        assert!(config.validate().is_err());

        config.collections = vec![CollectionConfig::new("bad-name")];
        assert!(config.validate().is_err());

        for reserved in ["forrestUpdateQuery", "forrestLastUpdate", "tasksLastUpdate"] {
            config.collections = vec![CollectionConfig::new(reserved)];
            assert!(
                matches!(config.validate(), Err(SyncError::InvalidConfig(_))),
                "{reserved}"
            );
        }

        config.collections = vec![CollectionConfig::new("tasks")];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_str = r#"
            [server]
            host = "example.org"
            username = "alice"

            [[collections]]
            name = "tasks"

            [[collections]]
            name = "contacts"
            indexes = { by_email = "email" }
        "#;
        let config: SyncConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 80);
        assert_eq!(config.collections.len(), 2);
        assert!(config.collections[0].indexes.is_none());
        assert_eq!(
            config.collections[1].indexes.as_ref().unwrap().field_for("by_email"),
            Some("email")
        );

        let written = toml::to_string_pretty(&config).unwrap();
        assert!(written.contains("[server]"));
        assert!(written.contains("[[collections]]"));
    }
}
