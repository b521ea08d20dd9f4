//! Error types for the sync agent.

use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State store error: {0}")]
    State(#[from] StateError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing config file: {path}. {hint}")]
    MissingFile { path: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local state store errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to open state database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("State database has no {0} row")]
    MissingRow(&'static str),

    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Credential vault errors. The vault treats every failure as terminal for
/// the source being configured; the RPC surface maps them all to
/// "Invalid credentials.".
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Ciphertext is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Ciphertext length {len} is not a multiple of the {cipher} block size")]
    BlockAlignment { cipher: &'static str, len: usize },

    #[error("Cipher rejected key: {0}")]
    InvalidKey(String),

    #[error("Decrypted payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Control channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Connect to {url} failed: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("Channel disconnected: {0}")]
    Disconnected(String),

    #[error("Agent is not authenticated")]
    NotAuthenticated,

    #[error("Invalid message frame: {0}")]
    InvalidMessage(String),

    #[error("Malformed auth token: {0}")]
    MalformedToken(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Source adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("No adapter registered for engine type {0:?}")]
    UnknownEngine(String),

    #[error("Driver for {engine} is not available: {reason}")]
    NoDriver { engine: &'static str, reason: String },

    #[error("Connection to source failed: {0}")]
    SourceConnect(String),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Source has no live connection; refresh_conn has not succeeded")]
    NotConnected,

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Source is missing its decrypted secret")]
    MissingSecret,
}

/// Sync engine errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Table is already processing data")]
    TableAlreadyProcessing,

    #[error("Table config is missing required field {0}")]
    MissingField(&'static str),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("State store error: {0}")]
    State(#[from] StateError),
}

/// Large-table worker and supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("Upload to {url} failed: {reason}")]
    Upload { url: String, reason: String },

    #[error("Ingest endpoint returned status {0}")]
    IngestStatus(u16),

    #[error("Invalid job spec: {0}")]
    BadJobSpec(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV encoding failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
