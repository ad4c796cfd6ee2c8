//! NIP-42 authentication and the direct-message read guard.

use url::Url;

use crate::{
    error::{AuthError, Reject},
    event::{Event, KIND_ENCRYPTED_DM},
    filter::Filter,
};

pub const AUTH_KIND: u16 = 22242;

const MAX_CLOCK_SKEW_SECS: u64 = 600;

pub fn new_challenge() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Check an AUTH event against this connection's challenge and the relay URL.
///
/// Returns the authenticated pubkey.
pub fn validate_auth_event(
    ev: &Event,
    challenge: &str,
    service_url: &str,
    now: u64,
) -> Result<String, AuthError> {
    if ev.kind != AUTH_KIND {
        return Err(AuthError::WrongKind(ev.kind));
    }
    if ev.tag_values("challenge").next() != Some(challenge) {
        return Err(AuthError::ChallengeMismatch);
    }
    let claimed = ev
        .tag_values("relay")
        .next()
        .and_then(normalized_url)
        .ok_or(AuthError::BadRelayTag)?;
    let ours = normalized_url(service_url).ok_or(AuthError::RelayMismatch)?;
    if claimed.scheme() != ours.scheme()
        || claimed.host_str() != ours.host_str()
        || claimed.port_or_known_default() != ours.port_or_known_default()
        || claimed.path() != ours.path()
    {
        return Err(AuthError::RelayMismatch);
    }
    if ev.created_at.abs_diff(now) > MAX_CLOCK_SKEW_SECS {
        return Err(AuthError::Stale);
    }
    ev.verify()
        .map_err(|e| AuthError::Signature(e.to_string()))?;
    Ok(ev.pubkey.clone())
}

fn normalized_url(raw: &str) -> Option<Url> {
    let lowered = raw.trim().to_lowercase();
    Url::parse(lowered.trim_end_matches('/')).ok()
}

/// Kind-4 reads are limited to the parties of the conversation.
///
/// A filter asking for DMs must name the authenticated user as the only
/// author or as the only `#p` recipient.
pub fn check_dm_filter(filter: &Filter, authed: Option<&str>) -> Result<(), Reject> {
    let wants_dms = filter
        .kinds
        .as_ref()
        .is_some_and(|k| k.contains(&KIND_ENCRYPTED_DM));
    if !wants_dms {
        return Ok(());
    }
    let Some(me) = authed else {
        return Err(Reject::AuthRequired(
            "we can't serve DMs to unauthenticated users, does your client implement NIP-42?"
                .into(),
        ));
    };
    let authors = filter.authors.as_deref().unwrap_or_default();
    let receivers = filter.tags.get("p").map(Vec::as_slice).unwrap_or_default();
    let as_sender = authors.len() == 1 && receivers.len() < 2 && authors[0] == me;
    let as_receiver = receivers.len() == 1 && authors.len() < 2 && receivers[0] == me;
    if as_sender || as_receiver {
        Ok(())
    } else {
        Err(Reject::AuthRequired(
            "authenticated user does not have authorization for requested filters".into(),
        ))
    }
}
