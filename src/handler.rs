//! Dispatch of decoded client frames.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    auth,
    connection::Connection,
    envelope::{ClientMessage, RelayMessage},
    error::{EventError, ProtocolError, Reject},
    event::{unix_now, Event, KIND_DELETION},
    filter::Filter,
    relay::{Published, Relay},
};

/// Handle one text frame from `conn`.
pub async fn handle_frame(relay: &Arc<Relay>, conn: &Arc<Connection>, text: &str) {
    let msg = match ClientMessage::parse(text) {
        Ok(msg) => msg,
        Err(ProtocolError::BadFilter { sub_id, reason }) => {
            let reason = Reject::Invalid(reason).to_string();
            conn.send(RelayMessage::Closed {
                sub_id: &sub_id,
                reason: &reason,
            })
            .await;
            return;
        }
        Err(e @ ProtocolError::Malformed { .. }) => {
            conn.send(RelayMessage::Notice(&format!("invalid: {e}"))).await;
            return;
        }
        Err(e) => {
            debug!(conn = conn.id(), error = %e, "ignoring frame");
            return;
        }
    };
    match msg {
        ClientMessage::Event(ev) => handle_event(relay, conn, &ev).await,
        ClientMessage::Req { sub_id, filters } => handle_req(relay, conn, sub_id, filters).await,
        ClientMessage::Count { sub_id, filters } => {
            handle_count(relay, conn, &sub_id, filters).await
        }
        ClientMessage::Close(sub_id) => {
            relay.listeners().unregister(conn.id(), &sub_id);
        }
        ClientMessage::Auth(ev) => handle_auth(conn, &ev).await,
    }
}

async fn handle_event(relay: &Relay, conn: &Connection, ev: &Event) {
    let result = match ev.verify() {
        Ok(()) => accept(relay, conn, ev).await,
        Err(e @ (EventError::IdMismatch | EventError::BadSignature)) => {
            Err(Reject::Invalid(e.to_string()))
        }
        Err(EventError::Malformed(e)) => {
            Err(Reject::Error(format!("failed to verify signature: {e}")))
        }
    };
    let (accepted, reason) = match &result {
        Ok(Published::Duplicate) => (true, "duplicate: already have this event".to_string()),
        Ok(_) => (true, String::new()),
        Err(reject) => (false, reject.to_string()),
    };
    conn.send(RelayMessage::Ok {
        id: &ev.id,
        accepted,
        reason: &reason,
    })
    .await;
    if result.is_err_and(|r| r.is_auth_required()) {
        conn.request_auth().await;
    }
}

async fn accept(relay: &Relay, conn: &Connection, ev: &Event) -> Result<Published, Reject> {
    relay.check_event(conn, ev)?;
    if ev.kind == KIND_DELETION {
        relay.handle_deletion(ev).await
    } else {
        relay.publish(ev).await
    }
}

/// Validate, register unarmed, then replay stored events in the background.
/// The listener is armed after EOSE so live events never precede it.
async fn handle_req(
    relay: &Arc<Relay>,
    conn: &Arc<Connection>,
    sub_id: String,
    filters: Vec<Filter>,
) {
    for filter in &filters {
        if let Err(reject) = relay.check_filter(conn, filter) {
            if reject.is_auth_required() {
                conn.request_auth().await;
            }
            let reason = reject.to_string();
            conn.send(RelayMessage::Closed {
                sub_id: &sub_id,
                reason: &reason,
            })
            .await;
            return;
        }
    }

    let token = conn.token().child_token();
    let generation = relay
        .listeners()
        .register(conn, &sub_id, filters.clone(), token.clone());

    let relay = Arc::clone(relay);
    let conn = Arc::clone(conn);
    tokio::spawn(async move {
        let mut replays = JoinSet::new();
        for filter in filters {
            replays.spawn(replay(
                Arc::clone(&relay),
                Arc::clone(&conn),
                sub_id.clone(),
                filter,
                token.clone(),
            ));
        }
        while replays.join_next().await.is_some() {}
        if token.is_cancelled() {
            return;
        }
        if conn.send(RelayMessage::Eose(&sub_id)).await {
            relay.listeners().arm(conn.id(), &sub_id, generation);
        }
    });
}

async fn replay(
    relay: Arc<Relay>,
    conn: Arc<Connection>,
    sub_id: String,
    filter: Filter,
    token: CancellationToken,
) {
    let mut stream = match relay.store().query(&filter) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(conn = conn.id(), %sub_id, error = %e, "query failed");
            let notice = Reject::from(e).to_string();
            conn.send(RelayMessage::Notice(&notice)).await;
            return;
        }
    };
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            next = stream.next() => {
                let Some(ev) = next else { return };
                if !conn.send(RelayMessage::Event { sub_id: &sub_id, event: &ev }).await {
                    return;
                }
            }
        }
    }
}

async fn handle_count(relay: &Relay, conn: &Connection, sub_id: &str, filters: Vec<Filter>) {
    let allowed = if relay.settings().count_enabled {
        filters.iter().try_for_each(|f| relay.check_filter(conn, f))
    } else {
        Err(Reject::Unsupported(
            "this relay does not support NIP-45".into(),
        ))
    };
    let result = match allowed {
        Ok(()) => relay.count(filters).await.map_err(Reject::from),
        Err(reject) => Err(reject),
    };
    match result {
        Ok(count) => {
            conn.send(RelayMessage::Count { sub_id, count }).await;
        }
        Err(reject) => {
            if reject.is_auth_required() {
                conn.request_auth().await;
            }
            let reason = reject.to_string();
            conn.send(RelayMessage::Closed {
                sub_id,
                reason: &reason,
            })
            .await;
        }
    }
}

async fn handle_auth(conn: &Connection, ev: &Event) {
    let reason = match auth::validate_auth_event(ev, conn.challenge(), conn.service_url(), unix_now())
    {
        Ok(pubkey) => {
            if conn.authenticate(&pubkey) {
                info!(conn = conn.id(), %pubkey, "authenticated");
            }
            None
        }
        Err(e) => {
            debug!(conn = conn.id(), error = %e, "auth rejected");
            Some(Reject::Error(format!("failed to authenticate: {e}")).to_string())
        }
    };
    conn.send(RelayMessage::Ok {
        id: &ev.id,
        accepted: reason.is_none(),
        reason: reason.as_deref().unwrap_or_default(),
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::AUTH_KIND,
        connection::{testing::detached, Outbox},
        event::fixtures::{pubkey_of, signed},
        relay::testing::relay_with,
    };
    use serde_json::{json, Value};

    async fn frame(rx: &mut Outbox) -> Value {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    fn event_frame(ev: &Event) -> String {
        json!(["EVENT", ev]).to_string()
    }

    #[tokio::test]
    async fn event_gets_ok() {
        let (relay, _dir) = relay_with(|_| {});
        let (conn, mut rx) = detached(16);
        let ev = signed(1, 1, unix_now(), &[], "hi");
        handle_frame(&relay, &conn, &event_frame(&ev)).await;
        assert_eq!(frame(&mut rx).await, json!(["OK", ev.id, true, ""]));
        handle_frame(&relay, &conn, &event_frame(&ev)).await;
        assert_eq!(
            frame(&mut rx).await,
            json!(["OK", ev.id, true, "duplicate: already have this event"])
        );
    }

    #[tokio::test]
    async fn tampered_event_is_invalid() {
        let (relay, _dir) = relay_with(|_| {});
        let (conn, mut rx) = detached(16);
        let mut ev = signed(1, 1, unix_now(), &[], "hi");
        ev.content = "changed".into();
        handle_frame(&relay, &conn, &event_frame(&ev)).await;
        let ok = frame(&mut rx).await;
        assert_eq!(ok[2], false);
        assert!(ok[3].as_str().unwrap().starts_with("invalid:"));
    }

    #[tokio::test]
    async fn req_replays_then_eose_then_live() {
        let (relay, _dir) = relay_with(|_| {});
        let (conn, mut rx) = detached(16);
        let old = signed(1, 1, 10, &[], "old");
        relay.publish(&old).await.unwrap();

        handle_frame(&relay, &conn, &json!(["REQ", "s", {"kinds": [1]}]).to_string()).await;
        let first = frame(&mut rx).await;
        assert_eq!(first[0], "EVENT");
        assert_eq!(first[2]["id"], json!(old.id));
        assert_eq!(frame(&mut rx).await, json!(["EOSE", "s"]));

        let live = signed(2, 1, 20, &[], "live");
        relay.publish(&live).await.unwrap();
        let pushed = frame(&mut rx).await;
        assert_eq!(pushed[1], "s");
        assert_eq!(pushed[2]["id"], json!(live.id));

        handle_frame(&relay, &conn, r#"["CLOSE","s"]"#).await;
        relay.publish(&signed(3, 1, 30, &[], "after")).await.unwrap();
        assert_eq!(relay.listeners().subscription_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn live_event_during_own_replay_keeps_client() {
        let (relay, _dir) = relay_with(|_| {});
        let (conn, mut rx) = detached(8);
        for i in 0..40 {
            relay.publish(&signed(1, 1, 100 + i, &[], "old")).await.unwrap();
        }

        handle_frame(&relay, &conn, &json!(["REQ", "live", {"kinds": [7]}]).to_string()).await;
        assert_eq!(frame(&mut rx).await, json!(["EOSE", "live"]));

        // the replay of "hist" outgrows the queue while nothing is read
        handle_frame(&relay, &conn, &json!(["REQ", "hist", {"kinds": [1]}]).to_string()).await;
        tokio::task::yield_now().await;
        let reaction = signed(2, 7, 500, &[], "+");
        relay.publish(&reaction).await.unwrap();
        assert!(!conn.token().is_cancelled());

        let mut history = 0;
        let mut live = Vec::new();
        loop {
            let msg = frame(&mut rx).await;
            match (msg[0].as_str(), msg[1].as_str()) {
                (Some("EVENT"), Some("hist")) => history += 1,
                (Some("EVENT"), Some("live")) => live.push(msg[2]["id"].clone()),
                (Some("EOSE"), Some("hist")) => break,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(history, 40);
        if live.is_empty() {
            live.push(frame(&mut rx).await[2]["id"].clone());
        }
        assert_eq!(live, vec![json!(reaction.id)]);
        assert!(rx.try_recv().is_err());
        assert!(!conn.token().is_cancelled());
    }

    #[tokio::test]
    async fn invalid_filter_closes() {
        let (relay, _dir) = relay_with(|_| {});
        let (conn, mut rx) = detached(16);
        handle_frame(&relay, &conn, &json!(["REQ", "s", {"ids": ["abc"]}]).to_string()).await;
        let closed = frame(&mut rx).await;
        assert_eq!(closed[0], "CLOSED");
        assert!(closed[2].as_str().unwrap().starts_with("invalid:"));
        assert_eq!(relay.listeners().subscription_count(), 0);

        handle_frame(&relay, &conn, &json!(["REQ", "t", {"kinds": "x"}]).to_string()).await;
        assert_eq!(frame(&mut rx).await[0], "CLOSED");
    }

    #[tokio::test]
    async fn malformed_frames_get_notice() {
        let (relay, _dir) = relay_with(|_| {});
        let (conn, mut rx) = detached(16);
        handle_frame(&relay, &conn, r#"["EVENT", 42]"#).await;
        let notice = frame(&mut rx).await;
        assert_eq!(notice[0], "NOTICE");
        // unknown labels and garbage are dropped silently
        handle_frame(&relay, &conn, r#"["HELLO"]"#).await;
        handle_frame(&relay, &conn, "garbage").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn count_sums_filters() {
        let (relay, _dir) = relay_with(|_| {});
        let (conn, mut rx) = detached(16);
        relay.publish(&signed(1, 1, 10, &[], "a")).await.unwrap();
        relay.publish(&signed(1, 7, 10, &[], "b")).await.unwrap();
        let req = json!(["COUNT", "c", {"kinds": [1]}, {"kinds": [7]}]).to_string();
        handle_frame(&relay, &conn, &req).await;
        assert_eq!(frame(&mut rx).await, json!(["COUNT", "c", {"count": 2}]));
    }

    #[tokio::test]
    async fn count_can_be_disabled() {
        let (relay, _dir) = relay_with(|cfg| cfg.count_enabled = false);
        let (conn, mut rx) = detached(16);
        handle_frame(&relay, &conn, r#"["COUNT","c",{}]"#).await;
        assert_eq!(
            frame(&mut rx).await,
            json!(["CLOSED", "c", "unsupported: this relay does not support NIP-45"])
        );
    }

    #[tokio::test]
    async fn dm_reads_require_auth() {
        let (relay, _dir) = relay_with(|_| {});
        let (conn, mut rx) = detached(16);
        let me = pubkey_of(1);
        let req = json!(["REQ", "dm", {"kinds": [4], "#p": [me]}]).to_string();

        handle_frame(&relay, &conn, &req).await;
        assert_eq!(frame(&mut rx).await, json!(["AUTH", conn.challenge()]));
        let closed = frame(&mut rx).await;
        assert_eq!(closed[0], "CLOSED");
        assert!(closed[2].as_str().unwrap().starts_with("auth-required:"));

        let auth = signed(
            1,
            AUTH_KIND,
            unix_now(),
            &[&["relay", conn.service_url()], &["challenge", conn.challenge()]],
            "",
        );
        handle_frame(&relay, &conn, &json!(["AUTH", auth]).to_string()).await;
        assert_eq!(frame(&mut rx).await, json!(["OK", auth.id, true, ""]));
        assert_eq!(conn.authed_pubkey(), Some(me));

        handle_frame(&relay, &conn, &req).await;
        assert_eq!(frame(&mut rx).await, json!(["EOSE", "dm"]));
    }

    #[tokio::test]
    async fn bad_auth_is_refused() {
        let (relay, _dir) = relay_with(|_| {});
        let (conn, mut rx) = detached(16);
        let auth = signed(
            1,
            AUTH_KIND,
            unix_now(),
            &[&["relay", conn.service_url()], &["challenge", "wrong"]],
            "",
        );
        handle_frame(&relay, &conn, &json!(["AUTH", auth]).to_string()).await;
        let ok = frame(&mut rx).await;
        assert_eq!(ok[2], false);
        assert!(ok[3].as_str().unwrap().starts_with("error: failed to authenticate"));
        assert!(conn.authed_pubkey().is_none());
    }

    #[tokio::test]
    async fn deletion_flow() {
        let (relay, _dir) = relay_with(|_| {});
        let (conn, mut rx) = detached(16);
        let note = signed(1, 1, unix_now(), &[], "oops");
        handle_frame(&relay, &conn, &event_frame(&note)).await;
        frame(&mut rx).await;

        let foreign = signed(2, 5, unix_now(), &[&["e", note.id.as_str()]], "");
        handle_frame(&relay, &conn, &event_frame(&foreign)).await;
        assert_eq!(
            frame(&mut rx).await,
            json!(["OK", foreign.id, false, "blocked: you are not the author of this event"])
        );

        let own = signed(1, 5, unix_now(), &[&["e", note.id.as_str()]], "");
        handle_frame(&relay, &conn, &event_frame(&own)).await;
        assert_eq!(frame(&mut rx).await, json!(["OK", own.id, true, ""]));
        let left = relay
            .store()
            .query_all(&Filter::from_value(&json!({"kinds": [1]})).unwrap())
            .await
            .unwrap();
        assert!(left.is_empty());
    }
}
