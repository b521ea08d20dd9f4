//! End-to-end control-channel tests: a real websocket server on a random
//! port plays the remote service, the full agent stack (transport,
//! dispatcher, vault, engine) runs against it.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use common::MockAdapter;
use mirrorpoint_agent::adapters::AdapterRegistry;
use mirrorpoint_agent::agent::Agent;
use mirrorpoint_agent::channel::control_channel;
use mirrorpoint_agent::config::{AgentIdentity, Config, EnvConfig};
use mirrorpoint_agent::rows::Cell;
use mirrorpoint_agent::state::{AgentErrorKind, StateStore};
use mirrorpoint_agent::vault;
use mirrorpoint_agent::{engine, worker};

const TIMEOUT: Duration = Duration::from_secs(10);
const MASTER_KEY: &str = "6f1d921bfd9b1492db15e1e92be73cf9bc91f840a18cf4a0a92121c7e42f23e4";
const SOURCE_UUID: &str = "3b6cbe17-4a97-49c0-8a9d-e8e761e84a10";

fn is_bind_permission_error<E: std::fmt::Display>(err: &E) -> bool {
    err.to_string().contains("Operation not permitted")
        || err.to_string().contains("Permission denied")
}

fn bearer_token(paused: bool) -> String {
    let encode = |v: &Value| {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(v.to_string())
    };
    format!(
        "{}.{}.sig",
        encode(&json!({"alg": "HS256"})),
        encode(&json!({"paused": paused, "sub": "agent-1"})),
    )
}

/// The fake remote: answers the handshake with `auth_reply`, then forwards
/// every frame it receives to `frames_tx` and replays anything pushed on
/// `push_rx`.
async fn spawn_server(
    auth_reply: Value,
) -> Option<(String, mpsc::Receiver<Value>, mpsc::Sender<Value>)> {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if is_bind_permission_error(&e) => return None,
        Err(e) => panic!("failed to bind test server: {e}"),
    };
    let addr = listener.local_addr().unwrap();
    let (frames_tx, frames_rx) = mpsc::channel::<Value>(64);
    let (push_tx, mut push_rx) = mpsc::channel::<Value>(16);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept failed");
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("ws upgrade failed");

        // First frame after connect is the credentials handshake.
        let handshake = match timeout(TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                serde_json::from_str::<Value>(text.as_str()).unwrap()
            }
            other => panic!("expected auth handshake, got {other:?}"),
        };
        assert!(handshake.get("agent_uuid").is_some());
        assert!(handshake.get("key").is_some());

        let auth = json!({"message_type": "auth", "message_body": auth_reply});
        ws.send(Message::Text(auth.to_string().into()))
            .await
            .expect("auth reply failed");

        loop {
            tokio::select! {
                pushed = push_rx.recv() => {
                    let Some(frame) = pushed else { break };
                    if ws
                        .send(Message::Text(frame.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                incoming = ws.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let frame: Value =
                                serde_json::from_str(text.as_str()).unwrap();
                            if frames_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    }
                }
            }
        }
    });

    Some((
        format!("ws://{addr}/slave-driver/websocket/"),
        frames_rx,
        push_tx,
    ))
}

struct TestAgent {
    agent: Arc<Agent>,
    _dir: tempfile::TempDir,
}

async fn start_agent(url: String, adapter: MockAdapter) -> TestAgent {
    let dir = tempfile::tempdir().unwrap();
    let state_db = dir.path().join("sync_info.db");
    let store = Arc::new(StateStore::open(&state_db).await.unwrap());

    let config = Config {
        env: EnvConfig {
            debug: true,
            url: Some(url.clone()),
        },
        identity: AgentIdentity {
            uuid: "agent-1".to_string(),
            key: "agent-key".to_string(),
            dbkey: MASTER_KEY.to_string(),
        },
        state_db: PathBuf::from(state_db),
    };

    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(adapter));

    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (channel, handle) = control_channel(
        url,
        config.identity.clone(),
        Arc::clone(&store),
        inbound_tx,
    );
    let agent = Agent::new(config, registry, store, handle);
    tokio::spawn(channel.run());
    tokio::spawn(Arc::clone(&agent).dispatch(inbound_rx));

    TestAgent { agent, _dir: dir }
}

async fn wait_for_auth(agent: &Arc<Agent>) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !agent.channel.auth().is_authenticated() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "agent never authenticated"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn next_frame(frames: &mut mpsc::Receiver<Value>) -> Value {
    timeout(TIMEOUT, frames.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("server closed")
}

/// Full cold-start path: `agent_info` push with a vault-wrapped secret ends
/// in a `data_update` with the pulled rows.
#[tokio::test]
async fn agent_info_push_triggers_data_update() {
    let Some((url, mut frames, push)) = spawn_server(json!(bearer_token(false))).await else {
        return;
    };

    let adapter = MockAdapter {
        initial: common::orders_batch(vec![
            vec![Cell::Int(1), common::ts(1, 0)],
            vec![Cell::Int(2), common::ts(2, 0)],
        ]),
        ..Default::default()
    };
    let handle = start_agent(url, adapter).await;
    wait_for_auth(&handle.agent).await;
    assert!(!handle.agent.channel.auth().claims.paused);

    let encrypted = vault::encrypt_secret("secret", MASTER_KEY, SOURCE_UUID).unwrap();
    let agent_info = json!({
        "message_type": "agent_info",
        "message_body": {
            SOURCE_UUID: {
                "source_name": "warehouse",
                "engine_type": "mock",
                "key": encrypted,
                "creds": {"user": "svc", "ip": "127.0.0.1", "port": 3306, "db_name": "shop"},
                "tables": {
                    "t-orders": {
                        "table_name": "orders",
                        "primary_key": "id",
                        "last_update": "updated_at",
                        "sync_status": 1,
                        "crawler_step": 1,
                        "batch_pull_size": 2,
                    }
                }
            }
        }
    });
    push.send(agent_info).await.unwrap();

    let update = loop {
        let frame = next_frame(&mut frames).await;
        if frame["message_type"] == "data_update" {
            break frame;
        }
    };
    let body = &update["message_body"];
    assert_eq!(body["sync_status"], 1);
    assert_eq!(body["crawler_step"], 1);
    assert_eq!(body["table_uuid"], "t-orders");
    assert_eq!(
        body["new_rows"]["columns"],
        json!(["id", "updated_at"])
    );
    assert_eq!(update["token"], json!(bearer_token(false)));

    // The secret round-tripped through the vault into the live source.
    let source = handle.agent.source_clone(SOURCE_UUID).await.unwrap();
    assert!(source.connected);
}

/// Paused claims: heartbeats still flow, table work is skipped, no
/// `data_update` goes out.
#[tokio::test]
async fn paused_claim_skips_sync_work() {
    let Some((url, mut frames, _push)) = spawn_server(json!(bearer_token(true))).await else {
        return;
    };

    let adapter = MockAdapter {
        initial: common::orders_batch(vec![vec![Cell::Int(1), common::ts(1, 0)]]),
        ..Default::default()
    };
    let handle = start_agent(url, adapter).await;
    wait_for_auth(&handle.agent).await;
    assert!(handle.agent.channel.auth().claims.paused);

    // A configured source is present, yet the cycle must not touch it.
    handle
        .agent
        .sources
        .write()
        .await
        .insert(
            SOURCE_UUID.to_string(),
            common::mock_source(
                SOURCE_UUID,
                json!({
                    "t-orders": {
                        "table_name": "orders",
                        "last_update": "updated_at",
                        "sync_status": 1,
                    }
                }),
            ),
        );

    handle
        .agent
        .channel
        .send_heartbeat("agent-1")
        .await
        .unwrap();
    engine::sync(Arc::clone(&handle.agent)).await;

    let heartbeat = next_frame(&mut frames).await;
    assert_eq!(heartbeat["message_type"], "heartbeat");
    assert_eq!(heartbeat["message_body"]["agent_uuid"], "agent-1");

    // Nothing else arrives.
    let extra = timeout(Duration::from_millis(700), frames.recv()).await;
    assert!(extra.is_err(), "unexpected frame: {extra:?}");
}

/// RPC frames get replies with the correlation identifiers echoed; handler
/// failures reply `message=false` with the error text.
#[tokio::test]
async fn rpc_replies_echo_correlation_ids() {
    let Some((url, mut frames, push)) = spawn_server(json!(bearer_token(false))).await else {
        return;
    };

    let handle = start_agent(url, MockAdapter::default()).await;
    wait_for_auth(&handle.agent).await;

    handle
        .agent
        .sources
        .write()
        .await
        .insert(
            SOURCE_UUID.to_string(),
            common::mock_source(SOURCE_UUID, json!({})),
        );

    // Known source: table listing comes back.
    push.send(json!({
        "message_type": "GET_TABLES_AND_VIEWS",
        "message_body": {
            "source_uuid": SOURCE_UUID,
            "request_id": 7,
            "queue_name": "q-1",
        }
    }))
    .await
    .unwrap();

    let reply = next_frame(&mut frames).await;
    assert_eq!(reply["message_type"], "GET_TABLES_AND_VIEWS");
    let body = &reply["message_body"];
    assert_eq!(body["request_id"], 7);
    assert_eq!(body["queue_name"], "q-1");
    assert_eq!(body["error_message"], "");
    assert_eq!(body["message"]["TableNames"], json!(["orders"]));

    // Unknown source: message=false with the error text.
    push.send(json!({
        "message_type": "GET_TABLE_COLUMNS",
        "message_body": {
            "source_uuid": "missing",
            "table_name": "orders",
            "request_id": 8,
            "queue_name": "q-1",
        }
    }))
    .await
    .unwrap();

    let reply = next_frame(&mut frames).await;
    let body = &reply["message_body"];
    assert_eq!(body["request_id"], 8);
    assert_eq!(body["message"], json!(false));
    assert!(
        body["error_message"]
            .as_str()
            .unwrap()
            .contains("unknown source")
    );
}

/// A `false` auth reply records the failure and keeps the channel open.
#[tokio::test]
async fn rejected_auth_is_recorded() {
    let Some((url, _frames, _push)) = spawn_server(json!(false)).await else {
        return;
    };

    let handle = start_agent(url, MockAdapter::default()).await;

    // The transport connects and records it even though auth fails.
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let status = handle
            .agent
            .store
            .agent_error_status(AgentErrorKind::AgentConnection)
            .await
            .unwrap();
        if status == "Connected" {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection never recorded, status {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Give the auth frame time to land, then confirm no token was stored.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.agent.channel.auth().is_authenticated());
    assert_eq!(
        handle
            .agent
            .store
            .agent_error_status(AgentErrorKind::Authentication)
            .await
            .unwrap(),
        "Not Authenticated"
    );
}

/// UPDATE_TABLE_INFO replaces the table, resets the cursor, and dirties it.
#[tokio::test]
async fn update_table_info_resets_table_state() {
    let Some((url, mut frames, push)) = spawn_server(json!(bearer_token(false))).await else {
        return;
    };

    let handle = start_agent(url, MockAdapter::default()).await;
    wait_for_auth(&handle.agent).await;

    handle
        .agent
        .sources
        .write()
        .await
        .insert(
            SOURCE_UUID.to_string(),
            common::mock_source(
                SOURCE_UUID,
                json!({
                    "t-orders": {
                        "table_name": "orders",
                        "last_update": "updated_at",
                        "sync_status": 3,
                        "last_update_value": "2024-01-01 00:00:00",
                        "crawler_step": 9,
                    }
                }),
            ),
        );

    push.send(json!({
        "message_type": "UPDATE_TABLE_INFO",
        "message_body": {
            "fk_source_uuid": SOURCE_UUID,
            "pk_table_uuid": "t-orders",
            "table_name": "orders",
            "table_info": {
                "primary_key": "id",
                "last_update": "updated_at",
                "relevant_columns": ["id", "updated_at"],
            },
            "request_id": 11,
            "queue_name": "q-1",
        }
    }))
    .await
    .unwrap();

    let reply = next_frame(&mut frames).await;
    assert_eq!(reply["message_body"]["message"], json!(true));

    let source = handle.agent.source_clone(SOURCE_UUID).await.unwrap();
    let table = &source.tables["t-orders"];
    assert_eq!(table.sync_status.as_int(), 1);
    assert_eq!(table.crawler_step, 1);
    assert!(table.crawler_step_info.is_none());
    assert!(table.last_update_value.is_none());
    assert!(table.dirty);
}

/// The worker-side job spec survives the stdin hand-off that
/// `spawn_big_table_process` performs.
#[test]
fn big_table_job_spec_is_stable() {
    let job = worker::BigTableJob {
        source_uuid: SOURCE_UUID.to_string(),
        table_uuid: "t-big".to_string(),
        table: serde_json::from_value(json!({
            "table_name": "events",
            "primary_key": "id",
            "last_update": "at",
            "sync_status": 3,
            "large_table": true,
            "large_table_row_limit": 5_000_000,
        }))
        .unwrap(),
        engine_type: "mock".to_string(),
        connection: serde_json::from_value(json!({
            "user": "svc", "ip": "127.0.0.1", "port": 5432, "db_name": "shop"
        }))
        .unwrap(),
        secret: Some("secret".to_string()),
        token: Some(bearer_token(false)),
        ingest_url: "http://slave-driver:8001/slave-driver/data-ingest/".to_string(),
        state_db: PathBuf::from("sync_info.db"),
    };
    let bytes = serde_json::to_vec(&job).unwrap();
    let decoded: worker::BigTableJob = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(decoded.table.sync_status.as_int(), 3);
    assert_eq!(decoded.secret.as_deref(), Some("secret"));
}
