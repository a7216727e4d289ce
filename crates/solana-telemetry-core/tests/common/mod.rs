// Numan Thabit 2025
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use solana_telemetry_core::provider::{EndpointRole, ProviderClient, ProviderEndpoint};
use solana_telemetry_core::TelemetryMetrics;
use url::Url;

pub const PAYER: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
pub const SYSTEM: &str = "11111111111111111111111111111111";
pub const TOKEN: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
pub const TIP: &str = "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5";

type Responder = Arc<dyn Fn(&Value) -> (StatusCode, Value) + Send + Sync>;

#[derive(Clone)]
struct MockState {
    responder: Responder,
    hits: Arc<AtomicUsize>,
}

/// In-process JSON-RPC upstream bound to an ephemeral port.
pub struct MockUpstream {
    pub url: Url,
    hits: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn handle(State(state): State<MockState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let (status, payload) = (state.responder)(&body);
    (status, Json(payload))
}

pub async fn spawn_upstream<F>(responder: F) -> Result<MockUpstream>
where
    F: Fn(&Value) -> (StatusCode, Value) + Send + Sync + 'static,
{
    let hits = Arc::new(AtomicUsize::new(0));
    let state = MockState {
        responder: Arc::new(responder),
        hits: hits.clone(),
    };
    let app = Router::new().route("/", post(handle)).with_state(state);
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(MockUpstream {
        url: Url::parse(&format!("http://{addr}/"))?,
        hits,
    })
}

pub fn result(request: &Value, result: Value) -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({"jsonrpc": "2.0", "id": request["id"].clone(), "result": result}),
    )
}

pub fn rpc_error(request: &Value, code: i64, message: &str) -> (StatusCode, Value) {
    (
        StatusCode::OK,
        json!({
            "jsonrpc": "2.0",
            "id": request["id"].clone(),
            "error": {"code": code, "message": message}
        }),
    )
}

pub fn requested_slot(request: &Value) -> u64 {
    request["params"][0].as_u64().unwrap_or_default()
}

pub fn client(
    primary: &MockUpstream,
    fallback: Option<&MockUpstream>,
    metrics: TelemetryMetrics,
) -> Result<ProviderClient> {
    let primary = ProviderEndpoint::new(EndpointRole::Primary, primary.url.clone(), None);
    let fallback =
        fallback.map(|up| ProviderEndpoint::new(EndpointRole::Fallback, up.url.clone(), None));
    Ok(ProviderClient::new(
        primary,
        fallback,
        Duration::from_secs(5),
        metrics,
    )?)
}

/// Versioned block with one successful and one failed transaction.
pub fn block_payload(slot: u64) -> Value {
    json!({
        "blockTime": 1_700_000_000i64 + slot as i64,
        "blockhash": "11111111111111111111111111111111",
        "parentSlot": slot.saturating_sub(1),
        "transactions": [
            {
                "transaction": {
                    "signatures": [format!("ok-{slot}")],
                    "message": {
                        "accountKeys": [PAYER, SYSTEM],
                        "instructions": [{"programIdIndex": 1, "accounts": [0, 2], "data": ""}]
                    }
                },
                "meta": {
                    "err": null,
                    "fee": 10_000,
                    "preBalances": [1_000_000, 1, 0],
                    "postBalances": [985_000, 1, 5_000],
                    "loadedAddresses": {"writable": [TIP], "readonly": []},
                    "computeUnitsConsumed": 450
                },
                "version": 0
            },
            {
                "transaction": {
                    "signatures": [format!("bad-{slot}")],
                    "message": {
                        "accountKeys": [PAYER, TOKEN],
                        "instructions": [{"programIdIndex": 1, "accounts": [0], "data": ""}]
                    }
                },
                "meta": {
                    "err": {"InstructionError": [0, {"Custom": 42}]},
                    "fee": 5_000,
                    "preBalances": [985_000, 1],
                    "postBalances": [980_000, 1],
                    "computeUnitsConsumed": 300
                },
                "version": "legacy"
            }
        ]
    })
}
