//! Nostr event model: canonical hashing, signature checks and kind classes.

use secp256k1::{schnorr::Signature, Message, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EventError;

/// Kind used by NIP-09 deletion requests.
pub const KIND_DELETION: u16 = 5;
/// Kind used by NIP-04 direct messages.
pub const KIND_ENCRYPTED_DM: u16 = 4;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `d` – unique identifier for parameterized-replaceable events
/// - `a` – addresses a replaceable event as `kind:pubkey:d`
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name (first element), if any.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Primary tag value (second element), if any.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Core Nostr event persisted in the store and served to clients.
///
/// ```json
/// {
///   "id": "4376c65d2f232afbe9b882a35baa4f6fe8667c4e684749af565f981833ed6a65",
///   "pubkey": "6e468422dfb74a5738702a8823b9b28168abab8655faacb6853cd0ee15deee93",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["t", "news"], ["p", "<hex pubkey>"]],
///   "content": "hello",
///   "sig": "908a15e4...f5b28"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u16,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags such as `e`, `p` or `d`.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Storage policy implied by an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    Regular,
    Replaceable,
    ParameterizedReplaceable,
    Ephemeral,
}

impl KindClass {
    pub fn of(kind: u16) -> Self {
        match kind {
            0 | 3 | 10000..=19999 => KindClass::Replaceable,
            20000..=29999 => KindClass::Ephemeral,
            30000..=39999 => KindClass::ParameterizedReplaceable,
            _ => KindClass::Regular,
        }
    }
}

impl Event {
    pub fn class(&self) -> KindClass {
        KindClass::of(self.kind)
    }

    /// Value of the first `d` tag, or the empty string when there is none.
    pub fn d_tag(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.name() == Some("d"))
            .and_then(Tag::value)
            .unwrap_or("")
    }

    /// Iterate over the values of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// SHA-256 of `[0, pubkey, created_at, kind, tags, content]`.
    pub fn hash(&self) -> Result<[u8; 32], EventError> {
        let canonical = (
            0u8,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        let data = serde_json::to_vec(&canonical)
            .map_err(|e| EventError::Malformed(e.to_string()))?;
        Ok(Sha256::digest(&data).into())
    }

    /// Check that `id` matches the canonical hash and `sig` verifies against `pubkey`.
    pub fn verify(&self) -> Result<(), EventError> {
        let hash = self.hash()?;
        if hex::encode(hash) != self.id {
            return Err(EventError::IdMismatch);
        }
        let sig_bytes =
            hex::decode(&self.sig).map_err(|e| EventError::Malformed(format!("sig: {e}")))?;
        let sig = Signature::from_slice(&sig_bytes)
            .map_err(|e| EventError::Malformed(format!("sig: {e}")))?;
        let pk_bytes =
            hex::decode(&self.pubkey).map_err(|e| EventError::Malformed(format!("pubkey: {e}")))?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes)
            .map_err(|e| EventError::Malformed(format!("pubkey: {e}")))?;
        let msg = Message::from_digest_slice(&hash)
            .map_err(|e| EventError::Malformed(e.to_string()))?;
        SECP256K1
            .verify_schnorr(&sig, &msg, &pk)
            .map_err(|_| EventError::BadSignature)
    }
}

/// Returns true when `a` loses to `b` for a replaceable slot.
///
/// Newer `created_at` wins; on a tie the lexicographically smaller id wins.
pub fn is_older(a: &Event, b: &Event) -> bool {
    a.created_at < b.created_at || (a.created_at == b.created_at && a.id > b.id)
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Returns true for a 64 character lowercase hex string.
pub fn is_hex64(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Helpers for signing real events in tests.

    use super::*;
    use secp256k1::Keypair;

    pub fn keypair(seed: u8) -> Keypair {
        Keypair::from_seckey_slice(SECP256K1, &[seed; 32]).unwrap()
    }

    pub fn pubkey_of(seed: u8) -> String {
        hex::encode(keypair(seed).x_only_public_key().0.serialize())
    }

    /// Build and sign an event with the key derived from `seed`.
    pub fn signed(seed: u8, kind: u16, created_at: u64, tags: &[&[&str]], content: &str) -> Event {
        let kp = keypair(seed);
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(kp.x_only_public_key().0.serialize()),
            kind,
            created_at,
            tags: tags
                .iter()
                .map(|t| Tag(t.iter().map(|s| s.to_string()).collect()))
                .collect(),
            content: content.into(),
            sig: String::new(),
        };
        let hash = ev.hash().unwrap();
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash).unwrap();
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&msg, &kp);
        ev.sig = hex::encode(sig.as_ref());
        ev
    }
}
