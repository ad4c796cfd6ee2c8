//! NIP-01 WebSocket connections: one reader loop, one writer task.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    connection::{Connection, Outbox},
    handler,
    relay::Relay,
};

const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Serve one upgraded socket until the client leaves, stops answering pings,
/// or the relay shuts down.
pub async fn run_connection(socket: WebSocket, relay: Arc<Relay>, service_url: String) {
    let cfg = relay.settings();
    let token = relay.shutdown_token().child_token();
    let (conn, outbox) = Connection::new(service_url, cfg.outbound_queue, token.clone());
    let conn = Arc::new(conn);
    let (sink, mut stream) = socket.split();

    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let writer = tokio::spawn(write_loop(
        sink,
        outbox,
        token.clone(),
        Arc::clone(&last_pong),
        cfg.ping_period,
        cfg.pong_wait,
    ));
    debug!(conn = conn.id(), url = %conn.service_url(), "connection opened");

    if cfg.auth_required {
        conn.request_auth().await;
    }
    let mut authed = conn.subscribe_authed();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            Ok(()) = authed.changed() => {
                if let Some(pubkey) = authed.borrow().as_deref() {
                    info!(conn = conn.id(), %pubkey, "connection authenticated");
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handler::handle_frame(&relay, &conn, &text).await,
                Some(Ok(Message::Pong(_))) => *last_pong.lock() = Instant::now(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn = conn.id(), error = %e, "read failed");
                    break;
                }
            },
        }
    }

    token.cancel();
    relay.listeners().unregister_all(conn.id());
    let _ = writer.await;
    debug!(conn = conn.id(), "connection closed");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: Outbox,
    token: CancellationToken,
    last_pong: Arc<Mutex<Instant>>,
    ping_period: Duration,
    pong_wait: Duration,
) {
    let mut ticker = interval_at(Instant::now() + ping_period, ping_period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = outbox.recv() => {
                let Some(text) = next else { break };
                match timeout(WRITE_WAIT, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            _ = ticker.tick() => {
                if last_pong.lock().elapsed() > pong_wait {
                    debug!("pong timeout");
                    break;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    token.cancel();
    let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
}
