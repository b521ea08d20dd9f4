//! Large-table upload path against a local ingest sink.

mod common;

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::{orders_batch, ts};
use mirrorpoint_agent::rows::{Cell, RowBatch};
use mirrorpoint_agent::worker::{IngestClient, to_csv};

type Captured = (HeaderMap, Bytes);

async fn spawn_sink() -> Option<(String, mpsc::Receiver<Captured>)> {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if e.to_string().contains("Operation not permitted") => return None,
        Err(e) => panic!("failed to bind ingest sink: {e}"),
    };
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel::<Captured>(16);

    async fn handler(
        State(tx): State<mpsc::Sender<Captured>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        let _ = tx.send((headers, body)).await;
        StatusCode::OK
    }

    let app = Router::new()
        .route("/slave-driver/data-ingest/", post(handler))
        .with_state(tx);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Some((
        format!("http://{addr}/slave-driver/data-ingest/"),
        rx,
    ))
}

async fn next_upload(rx: &mut mpsc::Receiver<Captured>) -> Captured {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for upload")
        .expect("sink closed")
}

#[tokio::test]
async fn csv_upload_carries_required_headers() {
    let Some((url, mut rx)) = spawn_sink().await else {
        return;
    };
    let client =
        IngestClient::from_parts(url, "tok-123".to_string(), "t-big".to_string()).unwrap();

    let batch = orders_batch(vec![
        vec![Cell::Int(1), ts(1, 0)],
        vec![Cell::Int(2), Cell::Null],
    ]);
    client
        .post("initial_table_data", to_csv(&batch).unwrap(), &[])
        .await
        .unwrap();

    let (headers, body) = next_upload(&mut rx).await;
    assert_eq!(headers["Auth"], "tok-123");
    assert_eq!(headers["Table-Uuid"], "t-big");
    assert_eq!(headers["Message-Type"], "initial_table_data");
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert_eq!(text, "1,2024-01-01 00:00:00\n2,\\N\n");
}

#[tokio::test]
async fn update_upload_includes_key_and_column_headers() {
    let Some((url, mut rx)) = spawn_sink().await else {
        return;
    };
    let client =
        IngestClient::from_parts(url, "tok-123".to_string(), "t-big".to_string()).unwrap();

    let batch = orders_batch(vec![vec![Cell::Int(9), ts(3, 0)]]);
    client
        .post(
            "update_table_data",
            to_csv(&batch).unwrap(),
            &[
                ("Primary-Key", "id".to_string()),
                ("Columns", r#"["id","updated_at"]"#.to_string()),
            ],
        )
        .await
        .unwrap();

    let (headers, _body) = next_upload(&mut rx).await;
    assert_eq!(headers["Message-Type"], "update_table_data");
    assert_eq!(headers["Primary-Key"], "id");
    assert_eq!(headers["Columns"], r#"["id","updated_at"]"#);
}

#[tokio::test]
async fn deleted_rows_blob_round_trips_through_the_sink() {
    let Some((url, mut rx)) = spawn_sink().await else {
        return;
    };
    let client =
        IngestClient::from_parts(url, "tok-123".to_string(), "t-big".to_string()).unwrap();

    let keys = orders_batch(vec![
        vec![Cell::Int(1), ts(1, 0)],
        vec![Cell::Int(2), ts(2, 0)],
        vec![Cell::Int(3), ts(3, 0)],
    ]);
    client
        .post(
            "check_for_deleted_rows",
            keys.to_columnar_blob(),
            &[
                ("Primary-Key", "id".to_string()),
                ("Ordering-Key", "updated_at".to_string()),
            ],
        )
        .await
        .unwrap();

    let (headers, body) = next_upload(&mut rx).await;
    assert_eq!(headers["Message-Type"], "check_for_deleted_rows");
    assert_eq!(headers["Ordering-Key"], "updated_at");

    let decoded = RowBatch::from_columnar_blob(&body).unwrap();
    assert_eq!(decoded.columns, vec!["id", "updated_at"]);
    assert_eq!(decoded.rows.len(), 3);
    assert_eq!(decoded.rows[2][0], Cell::Int(3));
}

#[tokio::test]
async fn non_success_status_is_an_error() {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(_) => return,
    };
    let addr = listener.local_addr().unwrap();
    async fn unauthorized() -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
    let app = Router::new().route("/slave-driver/data-ingest/", post(unauthorized));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = IngestClient::from_parts(
        format!("http://{addr}/slave-driver/data-ingest/"),
        String::new(),
        "t-big".to_string(),
    )
    .unwrap();
    let err = client
        .post("table_metadata", Vec::new(), &[])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("401"));
}
