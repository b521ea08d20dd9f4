//! Control-channel frame and message types.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::ChannelError;
use crate::model::{Claims, SyncStatus};
use crate::rows::WirePayload;

/// Frame received from the remote service.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub message_type: String,
    #[serde(default)]
    pub message_body: Value,
}

/// Frame sent to the remote service. Every frame carries the current bearer
/// token.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub token: Option<String>,
    pub message_type: String,
    pub message_body: Value,
}

/// Message queued for sending; the transport attaches the token.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message_type: String,
    pub message_body: Value,
}

/// RPC correlation identifiers, echoed verbatim on replies.
#[derive(Debug, Clone, Default)]
pub struct RpcMeta {
    pub request_id: Option<Value>,
    pub queue_name: Option<Value>,
}

impl RpcMeta {
    pub fn from_body(body: &Value) -> Option<Self> {
        let request_id = body.get("request_id")?.clone();
        Some(Self {
            request_id: Some(request_id),
            queue_name: body.get("queue_name").cloned(),
        })
    }

    /// Reply envelope: `{message, error_message, request_id, queue_name}`.
    pub fn reply(&self, message: Value, error_message: &str) -> Value {
        serde_json::json!({
            "message": message,
            "error_message": error_message,
            "request_id": self.request_id,
            "queue_name": self.queue_name,
        })
    }
}

fn payload_or_empty<S: Serializer>(
    payload: &Option<WirePayload>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match payload {
        Some(payload) => payload.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

/// Result of one in-process batch pull, shipped as a `data_update` message.
#[derive(Debug, Clone, Serialize)]
pub struct DataUpdate {
    pub sync_status: SyncStatus,
    pub agent_uuid: String,
    pub table_uuid: String,
    pub primary_key: Option<String>,
    pub crawler_step: i64,
    pub crawler_step_info: Option<String>,
    #[serde(serialize_with = "payload_or_empty")]
    pub new_rows: Option<WirePayload>,
    #[serde(serialize_with = "payload_or_empty")]
    pub updated_rows: Option<WirePayload>,
    #[serde(serialize_with = "payload_or_empty")]
    pub deleted_rows_check: Option<WirePayload>,
    pub check_for_deleted_rows_counter: i64,
    /// `last_update` of the most recent recorded sync cycle.
    pub last_sync: String,
    pub run_datasets: bool,
}

/// Decode the claims object from the bearer token's middle segment
/// (base64url, padded out to a multiple of four).
pub fn decode_claims(token: &str) -> Result<Claims, ChannelError> {
    use base64::Engine;

    let segment = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ChannelError::MalformedToken("token has no claims segment".to_string()))?;
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| ChannelError::MalformedToken(e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| ChannelError::MalformedToken(e.to_string()))
}

/// Payload size in MB, for send logging.
pub fn size_in_mb(serialized: &str) -> f64 {
    serialized.len() as f64 / 1_048_576.0
}
