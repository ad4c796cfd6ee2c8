//! HTTP surface: WebSocket upgrade, NIP-11 relay info, health and debug
//! endpoints, all on one listener.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Query as AxumQuery, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{filter::Filter, relay::Relay, ws};

const SUPPORTED_NIPS: &[u16] = &[1, 2, 4, 9, 11, 12, 16, 20, 33, 42, 45];

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
    /// Live subscriptions across all connections.
    subscriptions: usize,
}

/// NIP-11 relay information document.
#[derive(Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    contact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
    supported_nips: Vec<u16>,
    software: String,
    version: String,
    limitation: Limitation,
}

#[derive(Serialize, Deserialize)]
struct Limitation {
    max_message_length: usize,
    max_limit: usize,
    auth_required: bool,
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %listener.local_addr()?, "relay listening");
    serve_listener(listener, relay, shutdown).await
}

/// Serve on an already bound listener. Open WebSocket connections are closed
/// once `shutdown` resolves.
pub async fn serve_listener(
    listener: TcpListener,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let token = relay.shutdown_token().clone();
    let app = router(relay);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.await;
            token.cancel();
        })
        .await?;
    info!("relay stopped");
    Ok(())
}

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/query", get(query))
        .route("/filters", get(filters))
        .with_state(relay)
}

/// WebSocket upgrade, NIP-11 document or a plain banner, depending on the
/// request headers.
async fn root(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(ws) = ws {
        let cfg = relay.settings();
        let service_url = cfg
            .service_url
            .clone()
            .unwrap_or_else(|| service_url_from(&headers));
        return ws
            .max_message_size(cfg.max_message_size)
            .on_upgrade(move |socket| ws::run_connection(socket, relay, service_url))
            .into_response();
    }
    let wants_info = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/nostr+json"));
    if wants_info {
        return (
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::CONTENT_TYPE, "application/nostr+json"),
            ],
            Json(relay_info(&relay)),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        "keel nostr relay: connect with a websocket client\n",
    )
        .into_response()
}

fn relay_info(relay: &Relay) -> RelayInfo {
    let cfg = relay.settings();
    RelayInfo {
        name: cfg.relay_name.clone(),
        description: cfg.relay_description.clone(),
        pubkey: cfg.relay_pubkey.clone(),
        contact: cfg.relay_contact.clone(),
        icon: cfg.relay_icon.clone(),
        supported_nips: SUPPORTED_NIPS.to_vec(),
        software: "keel".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        limitation: Limitation {
            max_message_length: cfg.max_message_size,
            max_limit: relay.store().max_limit(),
            auth_required: cfg.auth_required,
        },
    }
}

/// `ws://` or `wss://` URL the client used to reach us.
fn service_url_from(headers: &HeaderMap) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim())
            .filter(|v| !v.is_empty())
    };
    let host = header_value("x-forwarded-host")
        .or_else(|| header_value(header::HOST.as_str()))
        .unwrap_or("localhost");
    let scheme = match header_value("x-forwarded-proto") {
        Some("https") | Some("wss") => "wss",
        _ => "ws",
    };
    format!("{scheme}://{host}")
}

async fn healthz(State(relay): State<Arc<Relay>>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        subscriptions: relay.listeners().subscription_count(),
    })
}

/// URL query parameters accepted by the `/query` endpoint.
#[derive(Deserialize)]
struct QueryParams {
    /// Comma-separated event ids.
    ids: Option<String>,
    /// Comma-separated hex public keys.
    authors: Option<String>,
    /// Comma-separated kind numbers (e.g. `1,30023`).
    kinds: Option<String>,
    /// Single `#d` tag value.
    d: Option<String>,
    /// Single `#t` topic value.
    t: Option<String>,
    /// Single `#e` reference.
    e: Option<String>,
    /// Single `#p` reference.
    p: Option<String>,
    /// Minimum `created_at` timestamp.
    since: Option<String>,
    /// Maximum `created_at` timestamp.
    until: Option<String>,
    /// Maximum number of events to return.
    limit: Option<String>,
}

/// Convert query string parameters into a [`Filter`].
///
/// Example: `/query?authors=<hex>&kinds=1,30023&since=1700000000`
fn params_to_filter(params: QueryParams) -> Result<Filter, String> {
    let mut obj = serde_json::Map::new();
    let list = |s: String| -> Value {
        Value::Array(s.split(',').map(|v| Value::String(v.trim().to_string())).collect())
    };
    if let Some(ids) = params.ids {
        obj.insert("ids".into(), list(ids));
    }
    if let Some(a) = params.authors {
        obj.insert("authors".into(), list(a));
    }
    if let Some(k) = params.kinds {
        let kinds = k
            .split(',')
            .map(|v| v.trim().parse::<u16>().map(Value::from))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("kinds: {e}"))?;
        obj.insert("kinds".into(), Value::Array(kinds));
    }
    for (name, value) in [("#d", params.d), ("#t", params.t), ("#e", params.e), ("#p", params.p)] {
        if let Some(v) = value {
            obj.insert(name.into(), Value::Array(vec![Value::String(v)]));
        }
    }
    for (name, value) in [
        ("since", params.since),
        ("until", params.until),
        ("limit", params.limit),
    ] {
        if let Some(v) = value {
            let n: u64 = v.parse().map_err(|e| format!("{name}: {e}"))?;
            obj.insert(name.into(), Value::from(n));
        }
    }
    Filter::from_value(&Value::Object(obj))
}

/// Matching events as newline-delimited JSON, newest first.
async fn query(
    State(relay): State<Arc<Relay>>,
    AxumQuery(params): AxumQuery<QueryParams>,
) -> Response {
    let filter = match params_to_filter(params) {
        Ok(f) => f,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let events = match relay.store().query_all(&filter).await {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "query failed");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    debug!(events = events.len(), "GET /query");
    let mut body = String::new();
    for ev in &events {
        match serde_json::to_string(ev) {
            Ok(line) => {
                body.push_str(&line);
                body.push('\n');
            }
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }
    ([(header::CONTENT_TYPE, "application/x-ndjson")], Body::from(body)).into_response()
}

/// Distinct filters of all live subscriptions.
async fn filters(State(relay): State<Arc<Relay>>) -> Json<Vec<Filter>> {
    Json(relay.listeners().listening_filters())
}
