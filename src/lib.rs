//! Chat Stream Client
//!
//! Client-side protocol engine for a streaming chat service:
//! - WebSocket connection with heartbeat supervision and exponential reconnect
//! - Inbound frame routing with sequence gating and fragment reassembly
//! - Generation lifecycle (send / stop / sync) with a watchdog
//! - Offline outbound queue and debounced draft persistence
//! - REST client for conversation listing and file uploads

pub mod api;
pub mod chat;
pub mod connection;
pub mod events;
pub mod protocol;
pub mod stream;

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chat::{DraftStore, EngineConfig, Session};
use connection::{ConnectionConfig, ReconnectPolicy, WsConnector};
use stream::ReassemblyConfig;

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: ServerYamlConfig,
    pub session: SessionYamlConfig,
    pub connection: ConnectionYamlConfig,
    pub generation: GenerationYamlConfig,
    pub draft: DraftYamlConfig,
    pub fragments: FragmentsYamlConfig,
}

/// Server endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerYamlConfig {
    pub ws_url: String,
    pub api_url: String,
}

impl Default for ServerYamlConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8000/ws/chat".into(),
            api_url: "http://localhost:8000".into(),
        }
    }
}

/// Per-session settings sent with every message
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionYamlConfig {
    pub project_id: Option<String>,
    pub provider: String,
    pub role: String,
    pub turbo_mode: bool,
}

impl Default for SessionYamlConfig {
    fn default() -> Self {
        let session = Session::default();
        Self {
            project_id: None,
            provider: session.provider,
            role: session.role,
            turbo_mode: false,
        }
    }
}

/// Reconnect and heartbeat tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionYamlConfig {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    pub idle_heartbeat_secs: u64,
    pub streaming_heartbeat_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionYamlConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: connection::backoff::DEFAULT_BASE_DELAY.as_millis() as u64,
            max_attempts: connection::backoff::DEFAULT_MAX_ATTEMPTS,
            idle_heartbeat_secs: connection::heartbeat::DEFAULT_IDLE_WINDOW.as_secs(),
            streaming_heartbeat_secs: connection::heartbeat::DEFAULT_STREAMING_WINDOW.as_secs(),
            connect_timeout_secs: connection::DEFAULT_CONNECT_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationYamlConfig {
    pub watchdog_secs: u64,
}

impl Default for GenerationYamlConfig {
    fn default() -> Self {
        Self {
            watchdog_secs: chat::generation::DEFAULT_WATCHDOG.as_secs(),
        }
    }
}

/// Draft persistence. `path` defaults to the platform data directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DraftYamlConfig {
    pub path: Option<PathBuf>,
    pub debounce_ms: u64,
    pub max_age_hours: i64,
}

impl Default for DraftYamlConfig {
    fn default() -> Self {
        Self {
            path: None,
            debounce_ms: chat::draft::DEFAULT_DEBOUNCE.as_millis() as u64,
            max_age_hours: chat::draft::DEFAULT_MAX_AGE_HOURS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FragmentsYamlConfig {
    pub ttl_secs: u64,
    pub max_buffers: usize,
}

impl Default for FragmentsYamlConfig {
    fn default() -> Self {
        let defaults = ReassemblyConfig::default();
        Self {
            ttl_secs: defaults.ttl.as_secs(),
            max_buffers: defaults.max_buffers,
        }
    }
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub ws_url: String,
    pub api_url: String,
    pub project_id: Option<String>,
    pub provider: String,
    pub role: String,
    pub turbo_mode: bool,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub idle_heartbeat_secs: u64,
    pub streaming_heartbeat_secs: u64,
    pub connect_timeout_secs: u64,
    pub watchdog_secs: u64,
    pub draft_path: PathBuf,
    pub draft_debounce_ms: u64,
    pub draft_max_age_hours: i64,
    pub fragment_ttl_secs: u64,
    pub fragment_max_buffers: usize,
}

impl Config {
    /// Load configuration from environment variables only.
    /// Equivalent to from_yaml_and_env(None).
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD. If the file doesn't
    /// exist, falls back to pure env var / defaults.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let yaml = Self::load_yaml(yaml_path);

        Ok(Self {
            ws_url: std::env::var("CHAT_WS_URL").unwrap_or(yaml.server.ws_url),
            api_url: std::env::var("CHAT_API_URL").unwrap_or(yaml.server.api_url),
            project_id: std::env::var("CHAT_PROJECT_ID")
                .ok()
                .filter(|s| !s.is_empty())
                .or(yaml.session.project_id),
            provider: std::env::var("CHAT_PROVIDER").unwrap_or(yaml.session.provider),
            role: std::env::var("CHAT_ROLE").unwrap_or(yaml.session.role),
            turbo_mode: std::env::var("CHAT_TURBO_MODE")
                .ok()
                .and_then(|s| parse_flag(&s))
                .unwrap_or(yaml.session.turbo_mode),
            reconnect_base_delay_ms: std::env::var("CHAT_RECONNECT_BASE_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(yaml.connection.base_delay_ms),
            reconnect_max_attempts: std::env::var("CHAT_RECONNECT_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(yaml.connection.max_attempts),
            idle_heartbeat_secs: yaml.connection.idle_heartbeat_secs,
            streaming_heartbeat_secs: yaml.connection.streaming_heartbeat_secs,
            connect_timeout_secs: yaml.connection.connect_timeout_secs,
            watchdog_secs: yaml.generation.watchdog_secs,
            draft_path: std::env::var("CHAT_DRAFT_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .or(yaml.draft.path)
                .unwrap_or_else(DraftStore::default_path),
            draft_debounce_ms: yaml.draft.debounce_ms,
            draft_max_age_hours: yaml.draft.max_age_hours,
            fragment_ttl_secs: yaml.fragments.ttl_secs,
            fragment_max_buffers: yaml.fragments.max_buffers,
        })
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ws_url: self.ws_url.clone(),
            connection: ConnectionConfig {
                reconnect: ReconnectPolicy {
                    base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
                    max_attempts: self.reconnect_max_attempts,
                },
                idle_heartbeat: Duration::from_secs(self.idle_heartbeat_secs),
                streaming_heartbeat: Duration::from_secs(self.streaming_heartbeat_secs),
            },
            reassembly: ReassemblyConfig {
                ttl: Duration::from_secs(self.fragment_ttl_secs),
                max_buffers: self.fragment_max_buffers,
            },
            watchdog: Duration::from_secs(self.watchdog_secs),
            draft_debounce: Duration::from_millis(self.draft_debounce_ms),
        }
    }

    pub fn connector(&self) -> WsConnector {
        WsConnector::with_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    /// Session settings, optionally resuming an existing conversation.
    /// An explicit project id wins over the configured one.
    pub fn session(&self, conversation_id: Option<String>, project_id: Option<String>) -> Session {
        Session {
            conversation_id,
            project_id: project_id.or_else(|| self.project_id.clone()),
            provider: self.provider.clone(),
            role: self.role.clone(),
            turbo_mode: self.turbo_mode,
        }
    }

    pub fn draft_store(&self) -> DraftStore {
        DraftStore::new(self.draft_path.clone(), self.draft_max_age_hours)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================
