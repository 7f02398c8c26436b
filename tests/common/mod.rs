//! Mock location backend for integration tests

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

pub const ZONE_JSON: &str = r#"[{
    "safe_zone_id": "9b1f",
    "patient": "p-1",
    "latitude": "-33.456900",
    "longitude": "-70.648300",
    "radius_meters": 200,
    "address": "Av. Providencia 1234",
    "safe_exit_active": false
}]"#;

pub const HISTORY_JSON: &str = r#"[
    {"location_id": "c", "latitude": "-33.457000", "longitude": "-70.652000", "timestamp": "2026-10-16T12:02:00Z", "is_out_of_zone": true},
    {"location_id": "a", "latitude": "-33.456900", "longitude": "-70.650000", "timestamp": "2026-10-16T12:00:00Z", "is_out_of_zone": false},
    {"location_id": "b", "latitude": "-33.456950", "longitude": "-70.651000", "timestamp": "2026-10-16T12:01:00Z", "is_out_of_zone": false}
]"#;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Clone)]
pub struct MockBackend {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    update_status: Arc<AtomicU16>,
    zone_body: Arc<Mutex<String>>,
}

impl MockBackend {
    /// Status returned by the location update endpoint from now on
    pub fn set_update_status(&self, status: u16) {
        self.update_status.store(status, Ordering::Relaxed);
    }

    pub fn set_zone_body(&self, body: &str) {
        *self.zone_body.lock() = body.to_string();
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Bodies of location updates that were answered with 2xx
    pub fn accepted_updates(&self) -> Vec<serde_json::Value> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == "/api/safe-zone/location/update/" && r.body["accepted"] == true)
            .map(|r| r.body["payload"].clone())
            .collect()
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    backend: MockBackend,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let authorization =
        req.headers().get("authorization").and_then(|v| v.to_str().ok()).map(str::to_string);
    let raw = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };
    let payload: serde_json::Value = serde_json::from_slice(&raw).unwrap_or(serde_json::Value::Null);

    let (status, body) = match (&method, path.as_str()) {
        (&Method::POST, "/api/safe-zone/location/update/") => {
            let status = StatusCode::from_u16(backend.update_status.load(Ordering::Relaxed))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, r#"{"detail":"ok"}"#.to_string())
        }
        (&Method::GET, "/api/safe-zone/zone/") => (StatusCode::OK, backend.zone_body.lock().clone()),
        (&Method::GET, "/api/safe-zone/location/history/") => (StatusCode::OK, HISTORY_JSON.to_string()),
        (&Method::POST, "/api/safe-zone/safe-exit/toggle/") => {
            let active = payload["active"].as_bool().unwrap_or(false);
            (
                StatusCode::OK,
                format!(r#"{{"safe_exit_active":{active},"message":"Salida segura actualizada"}}"#),
            )
        }
        _ => (StatusCode::NOT_FOUND, r#"{"detail":"Not found."}"#.to_string()),
    };

    backend.requests.lock().push(RecordedRequest {
        method: method.to_string(),
        path,
        authorization,
        body: serde_json::json!({ "payload": payload, "accepted": status.is_success() }),
    });

    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail"))
}

/// Bind on an ephemeral port and serve until the test runtime ends
pub async fn start_mock_backend() -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock backend");
    let addr = listener.local_addr().expect("mock backend addr");

    let backend = MockBackend {
        base_url: format!("http://{addr}"),
        requests: Arc::new(Mutex::new(Vec::new())),
        update_status: Arc::new(AtomicU16::new(201)),
        zone_body: Arc::new(Mutex::new(ZONE_JSON.to_string())),
    };

    let server = backend.clone();
    tokio::spawn(async move {
        while let Ok((stream, _addr)) = listener.accept().await {
            let io = TokioIo::new(stream);
            let backend = server.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let backend = backend.clone();
                    async move { handle_request(req, backend).await }
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    backend
}

/// Minimal config TOML pointing at the mock backend
pub fn config_toml(base_url: &str, store_path: &str) -> String {
    format!(
        r#"
[api]
base_url = "{base_url}"
timeout_ms = 2000
access_token = "test-token"

[store]
path = "{store_path}"

[queue]
drain_interval_secs = 0
"#
    )
}
