//! Configuration for the sync agent.
//!
//! Everything lives under `./sync_agent_configs/`:
//! - `env.json` selects debug mode and can override the control-channel URL.
//! - `sync_agent.json` carries the agent identity entered on the dashboard:
//!   `uuid` + `key` authenticate the control channel, `dbkey` is the local
//!   master key for the credential vault and is never transmitted.
//!
//! The dashboard owns writing these files; the agent only reads them.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Directory holding `env.json` and `sync_agent.json`, relative to the
/// process working directory.
pub const CONFIG_DIR: &str = "sync_agent_configs";

/// Filename of the local state database, shared by the supervisor, the
/// worker, and large-table worker processes.
pub const STATE_DB_FILE: &str = "sync_info.db";

const PROD_WEBSOCKET_URL: &str = "wss://api.mirrorpoint.io/slave-driver/websocket/";
const DEV_WEBSOCKET_URL: &str = "wss://dev.mirrorpoint.io:8001/slave-driver/websocket/";
const PROD_INGEST_URL: &str = "https://api.mirrorpoint.io/slave-driver/data-ingest/";
const DEV_INGEST_URL: &str = "http://slave-driver:8001/slave-driver/data-ingest/";

/// Contents of `env.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvConfig {
    #[serde(default)]
    pub debug: bool,
    /// Overrides the control-channel endpoint in debug mode.
    #[serde(default)]
    pub url: Option<String>,
}

/// Contents of `sync_agent.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentIdentity {
    /// Agent UUID, assigned by the remote service.
    pub uuid: String,
    /// Agent key used in the control-channel auth handshake.
    pub key: String,
    /// Local master key (two concatenated 32-hex tokens). Input to the
    /// credential vault; never leaves this machine.
    pub dbkey: String,
}

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub env: EnvConfig,
    pub identity: AgentIdentity,
    /// Path to the local state database.
    pub state_db: PathBuf,
}

impl Config {
    /// Load configuration from the default `./sync_agent_configs/` directory.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(CONFIG_DIR))
    }

    /// Load configuration from an explicit config directory.
    pub fn load_from(dir: &Path) -> Result<Self, ConfigError> {
        let env = read_json::<EnvConfig>(&dir.join("env.json")).unwrap_or_default();
        let identity_path = dir.join("sync_agent.json");
        let identity: AgentIdentity =
            read_json(&identity_path).map_err(|e| match e {
                ConfigError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    ConfigError::MissingFile {
                        path: identity_path.display().to_string(),
                        hint: "Enter the agent credentials on the dashboard first".to_string(),
                    }
                }
                other => other,
            })?;

        if identity.dbkey.len() != 64 || !identity.dbkey.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ConfigError::InvalidValue {
                key: "dbkey".to_string(),
                message: "expected a 64-character hex string".to_string(),
            });
        }

        Ok(Self {
            env,
            identity,
            state_db: PathBuf::from(STATE_DB_FILE),
        })
    }

    /// Control-channel endpoint. Debug mode honours `env.json.url`.
    pub fn websocket_url(&self) -> String {
        if self.env.debug {
            self.env
                .url
                .clone()
                .unwrap_or_else(|| DEV_WEBSOCKET_URL.to_string())
        } else {
            PROD_WEBSOCKET_URL.to_string()
        }
    }

    /// Ingest endpoint for large-table uploads.
    pub fn ingest_url(&self) -> String {
        if self.env.debug {
            DEV_INGEST_URL.to_string()
        } else {
            PROD_INGEST_URL.to_string()
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Read `versioning/version.txt` (format `YYYY.MM.DD.N`). Returns a
/// placeholder when the file is absent, e.g. in test checkouts.
pub fn version() -> String {
    std::fs::read_to_string("versioning/version.txt")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unversioned".to_string())
}
