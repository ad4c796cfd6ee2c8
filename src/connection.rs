//! Per-socket state shared between the reader, the writer and the listener
//! registry.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{auth, envelope::RelayMessage};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// One client connection.
///
/// Frames are rendered to JSON before they are queued and only the socket's
/// writer task touches the socket itself. Frames answering the client's own
/// requests (replay, EOSE, OK, ...) and live fan-out travel in separate
/// bounded lanes, so a long replay never counts against the fan-out budget.
pub struct Connection {
    id: u64,
    challenge: String,
    service_url: String,
    authed: watch::Sender<Option<String>>,
    replies: mpsc::Sender<String>,
    live: mpsc::Sender<String>,
    token: CancellationToken,
    window: Mutex<(Instant, u32)>,
}

/// Receiving half of a connection's outbound lanes.
pub struct Outbox {
    replies: mpsc::Receiver<String>,
    live: mpsc::Receiver<String>,
}

impl Outbox {
    /// Next frame to write.
    ///
    /// Replies drain first: a listener is armed only after its EOSE is queued,
    /// so this keeps every live event behind the EOSE of its subscription.
    pub async fn recv(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            Some(text) = self.replies.recv() => Some(text),
            Some(text) = self.live.recv() => Some(text),
            else => None,
        }
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Result<String, mpsc::error::TryRecvError> {
        self.replies.try_recv().or_else(|_| self.live.try_recv())
    }
}

impl Connection {
    /// `capacity` bounds each lane.
    pub fn new(service_url: String, capacity: usize, token: CancellationToken) -> (Self, Outbox) {
        let (replies, replies_rx) = mpsc::channel(capacity.max(1));
        let (live, live_rx) = mpsc::channel(capacity.max(1));
        let (authed, _) = watch::channel(None);
        let conn = Connection {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            challenge: auth::new_challenge(),
            service_url,
            authed,
            replies,
            live,
            token,
            window: Mutex::new((Instant::now(), 0)),
        };
        let outbox = Outbox {
            replies: replies_rx,
            live: live_rx,
        };
        (conn, outbox)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn service_url(&self) -> &str {
        &self.service_url
    }

    /// Cancelled when the connection is torn down.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Queue a reply, waiting for room. Returns false once the connection is gone.
    pub async fn send(&self, msg: RelayMessage<'_>) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.token.cancelled() => false,
            sent = self.replies.send(msg.to_json()) => sent.is_ok(),
        }
    }

    /// Queue a live frame without waiting.
    ///
    /// A client that lets its live lane fill up is dropped rather than allowed
    /// to stall fan-out for everyone else.
    pub fn try_send(&self, msg: RelayMessage<'_>) -> bool {
        match self.live.try_send(msg.to_json()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = self.id, "live queue full, dropping connection");
                self.token.cancel();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Send this connection's AUTH challenge.
    pub async fn request_auth(&self) {
        self.send(RelayMessage::Auth(&self.challenge)).await;
    }

    pub fn authed_pubkey(&self) -> Option<String> {
        self.authed.borrow().clone()
    }

    /// Record the authenticated pubkey. Only the first call has any effect.
    pub fn authenticate(&self, pubkey: &str) -> bool {
        self.authed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(pubkey.to_string());
            true
        })
    }

    /// Watch for the transition to authenticated.
    pub fn subscribe_authed(&self) -> watch::Receiver<Option<String>> {
        self.authed.subscribe()
    }

    /// Count one event against a fixed one-minute window.
    pub fn admit_event(&self, per_minute: u32) -> bool {
        let mut window = self.window.lock();
        if window.0.elapsed() >= RATE_WINDOW {
            *window = (Instant::now(), 0);
        }
        if window.1 >= per_minute {
            return false;
        }
        window.1 += 1;
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A connection without a socket; frames land in the returned outbox.
    pub fn detached(capacity: usize) -> (std::sync::Arc<Connection>, Outbox) {
        let (conn, outbox) =
            Connection::new("ws://localhost:7777".into(), capacity, CancellationToken::new());
        (std::sync::Arc::new(conn), outbox)
    }
}
