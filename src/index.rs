//! Index key codec.
//!
//! Every key lives in one ordered keyspace and starts with a one byte family
//! prefix. Secondary index keys end with `created_at` (u32 BE) followed by the
//! serial (u32 BE) except for the id family, which ends with the serial only.
//!
//! | prefix | family            | layout after the prefix                    |
//! |--------|-------------------|--------------------------------------------|
//! | 0      | raw event         | serial                                     |
//! | 1      | created_at        | created_at, serial                         |
//! | 2      | id                | id[..8], serial                            |
//! | 3      | kind              | kind u16, created_at, serial               |
//! | 4      | pubkey            | pubkey[..8], created_at, serial            |
//! | 5      | pubkey + kind     | pubkey[..8], kind u16, created_at, serial  |
//! | 6      | tag (utf-8)       | value bytes, created_at, serial            |
//! | 7      | tag (32-byte hex) | value[..8], created_at, serial             |
//! | 8      | tag (address)     | kind u16, pubkey[..8], d bytes, ca, serial |
//! | 255    | schema version    | (none)                                     |
//! | 255    | next serial       | `1`, value holds the next serial (u32 BE)  |

use std::collections::HashSet;

use crate::{
    error::StoreError,
    event::{is_hex64, Event},
};

pub const RAW: u8 = 0;
pub const CREATED_AT: u8 = 1;
pub const ID: u8 = 2;
pub const KIND: u8 = 3;
pub const PUBKEY: u8 = 4;
pub const PUBKEY_KIND: u8 = 5;
pub const TAG: u8 = 6;
pub const TAG32: u8 = 7;
pub const TAG_ADDR: u8 = 8;
pub const VERSION: u8 = 255;

/// High-water mark of allocated serials. Survives deletes of the newest event.
pub const NEXT_SERIAL_KEY: [u8; 2] = [VERSION, 1];

/// Longest tag value that gets an index entry.
pub const MAX_INDEXED_TAG_VALUE: usize = 100;

pub type Key = Vec<u8>;

pub fn raw_key(serial: u32) -> [u8; 5] {
    let mut k = [RAW; 5];
    k[1..].copy_from_slice(&serial.to_be_bytes());
    k
}

/// Serial stored in the last four bytes of any index or raw key.
pub fn serial_of(key: &[u8]) -> Option<u32> {
    let tail = key.len().checked_sub(4).map(|at| &key[at..])?;
    Some(u32::from_be_bytes(tail.try_into().ok()?))
}

/// `created_at` stored just before the serial in timestamped keys.
pub fn created_at_of(key: &[u8]) -> Option<u32> {
    let start = key.len().checked_sub(8)?;
    Some(u32::from_be_bytes(key[start..start + 4].try_into().ok()?))
}

/// Latest `created_at` the store accepts. Keys hold 32-bit timestamps, so
/// later events could not be ordered against each other.
pub const MAX_KEY_TIMESTAMP: u64 = u32::MAX as u64;

/// Timestamps inside keys are clamped to 32 bits. Only filter bounds reach
/// the clamp; stored events never exceed [`MAX_KEY_TIMESTAMP`].
pub fn key_timestamp(created_at: u64) -> u32 {
    u32::try_from(created_at).unwrap_or(u32::MAX)
}

/// First eight bytes of a hex encoded 32-byte value.
pub fn hex_prefix(hex_str: &str) -> Result<[u8; 8], StoreError> {
    let head = hex_str
        .get(..16)
        .ok_or_else(|| StoreError::InvalidEvent(format!("{hex_str:?} is too short")))?;
    let mut out = [0u8; 8];
    hex::decode_to_slice(head, &mut out)
        .map_err(|e| StoreError::InvalidEvent(format!("{hex_str:?}: {e}")))?;
    Ok(out)
}

/// How a tag value is laid out inside the tag index families.
#[derive(Debug, PartialEq, Eq)]
pub enum TagValue<'a> {
    /// `kind:pubkey:d` reference to an addressable event.
    Addr {
        kind: u16,
        pubkey: [u8; 8],
        d: &'a str,
    },
    /// 64 hex characters, usually an event id or pubkey.
    Hex32([u8; 8]),
    Plain(&'a str),
}

impl<'a> TagValue<'a> {
    pub fn classify(value: &'a str) -> Self {
        if is_hex64(value) {
            if let Ok(prefix) = hex_prefix(value) {
                return TagValue::Hex32(prefix);
            }
        }
        let mut parts = value.splitn(3, ':');
        if let (Some(kind), Some(pk), Some(d)) = (parts.next(), parts.next(), parts.next()) {
            if !d.contains(':') && is_hex64(pk) {
                if let (Ok(kind), Ok(pubkey)) = (kind.parse::<u16>(), hex_prefix(pk)) {
                    return TagValue::Addr { kind, pubkey, d };
                }
            }
        }
        TagValue::Plain(value)
    }

    /// Index key prefix for this value, without timestamp or serial.
    pub fn prefix(&self) -> Key {
        match self {
            TagValue::Addr { kind, pubkey, d } => {
                let mut k = Vec::with_capacity(11 + d.len());
                k.push(TAG_ADDR);
                k.extend_from_slice(&kind.to_be_bytes());
                k.extend_from_slice(pubkey);
                k.extend_from_slice(d.as_bytes());
                k
            }
            TagValue::Hex32(prefix) => {
                let mut k = Vec::with_capacity(9);
                k.push(TAG32);
                k.extend_from_slice(prefix);
                k
            }
            TagValue::Plain(v) => {
                let mut k = Vec::with_capacity(1 + v.len());
                k.push(TAG);
                k.extend_from_slice(v.as_bytes());
                k
            }
        }
    }
}

/// True when a tag row gets an index entry.
pub fn is_indexable(tag: &[String]) -> bool {
    tag.len() >= 2
        && tag[0].chars().count() == 1
        && !tag[1].is_empty()
        && tag[1].len() <= MAX_INDEXED_TAG_VALUE
}

pub fn id_prefix(id: &str) -> Result<Key, StoreError> {
    let mut k = Vec::with_capacity(9);
    k.push(ID);
    k.extend_from_slice(&hex_prefix(id)?);
    Ok(k)
}

pub fn kind_prefix(kind: u16) -> Key {
    let mut k = vec![KIND];
    k.extend_from_slice(&kind.to_be_bytes());
    k
}

pub fn pubkey_prefix(pubkey: &str) -> Result<Key, StoreError> {
    let mut k = Vec::with_capacity(9);
    k.push(PUBKEY);
    k.extend_from_slice(&hex_prefix(pubkey)?);
    Ok(k)
}

pub fn pubkey_kind_prefix(pubkey: &str, kind: u16) -> Result<Key, StoreError> {
    let mut k = Vec::with_capacity(11);
    k.push(PUBKEY_KIND);
    k.extend_from_slice(&hex_prefix(pubkey)?);
    k.extend_from_slice(&kind.to_be_bytes());
    Ok(k)
}

fn with_suffix(mut prefix: Key, created_at: u32, serial: u32) -> Key {
    prefix.extend_from_slice(&created_at.to_be_bytes());
    prefix.extend_from_slice(&serial.to_be_bytes());
    prefix
}

/// Every secondary index key `ev` must be written under.
pub fn keys_for_event(ev: &Event, serial: u32) -> Result<Vec<Key>, StoreError> {
    let ca = key_timestamp(ev.created_at);
    let mut keys = Vec::with_capacity(5 + ev.tags.len());

    let mut id_key = id_prefix(&ev.id)?;
    id_key.extend_from_slice(&serial.to_be_bytes());
    keys.push(id_key);

    keys.push(with_suffix(vec![CREATED_AT], ca, serial));
    keys.push(with_suffix(kind_prefix(ev.kind), ca, serial));
    keys.push(with_suffix(pubkey_prefix(&ev.pubkey)?, ca, serial));
    keys.push(with_suffix(pubkey_kind_prefix(&ev.pubkey, ev.kind)?, ca, serial));

    let mut seen = HashSet::new();
    for tag in &ev.tags {
        if !is_indexable(&tag.0) || !seen.insert(tag.0[1].as_str()) {
            continue;
        }
        let prefix = TagValue::classify(&tag.0[1]).prefix();
        keys.push(with_suffix(prefix, ca, serial));
    }
    Ok(keys)
}

/// Count of tag rows that would produce an index entry.
pub fn indexable_tag_count(ev: &Event) -> usize {
    ev.tags.iter().filter(|t| is_indexable(&t.0)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::signed;

    #[test]
    fn raw_key_layout() {
        assert_eq!(raw_key(0x01020304), [0, 1, 2, 3, 4]);
        assert_eq!(serial_of(&raw_key(77)), Some(77));
    }

    #[test]
    fn classifies_tag_values() {
        let hex = "ab".repeat(32);
        assert!(matches!(TagValue::classify(&hex), TagValue::Hex32(p) if p == [0xab; 8]));
        let addr = format!("30023:{hex}:my-article");
        assert_eq!(
            TagValue::classify(&addr),
            TagValue::Addr {
                kind: 30023,
                pubkey: [0xab; 8],
                d: "my-article"
            }
        );
        let empty_d = format!("30023:{hex}:");
        assert!(matches!(TagValue::classify(&empty_d), TagValue::Addr { d: "", .. }));
        // a third colon makes it a plain value
        let extra = format!("30023:{hex}:a:b");
        assert_eq!(TagValue::classify(&extra), TagValue::Plain(&extra));
        assert_eq!(TagValue::classify("news"), TagValue::Plain("news"));
        assert_eq!(TagValue::classify(&hex.to_uppercase()), TagValue::Plain(&hex.to_uppercase()));
    }

    #[test]
    fn event_key_set() {
        let target = "cd".repeat(32);
        let long = "x".repeat(101);
        let ev = signed(
            1,
            1,
            0x0a0b0c0d,
            &[
                &["t", "news"],
                &["e", target.as_str()],
                &["p", target.as_str()],
                &["title", "ignored"],
                &["t", long.as_str()],
                &["x"],
            ],
            "",
        );
        let keys = keys_for_event(&ev, 9).unwrap();
        // id, created_at, kind, pubkey, pubkey+kind, t=news, e/p share one key
        assert_eq!(keys.len(), 7);
        assert_eq!(keys[0].len(), 1 + 8 + 4);
        assert_eq!(keys[0][0], ID);
        assert_eq!(keys[1], vec![CREATED_AT, 0x0a, 0x0b, 0x0c, 0x0d, 0, 0, 0, 9]);
        assert_eq!(&keys[2][..3], &[KIND, 0, 1]);
        assert_eq!(keys[5][0], TAG);
        assert_eq!(&keys[5][1..5], b"news");
        assert_eq!(keys[6][0], TAG32);
        assert_eq!(&keys[6][1..9], &[0xcd; 8]);
        for k in &keys {
            assert_eq!(serial_of(k), Some(9));
        }
        for k in &keys[1..] {
            assert_eq!(created_at_of(k), Some(0x0a0b0c0d));
        }
    }

    #[test]
    fn clamps_large_timestamps() {
        assert_eq!(key_timestamp(u64::MAX), u32::MAX);
        assert_eq!(key_timestamp(5), 5);
    }

    #[test]
    fn rejects_non_hex_pubkey() {
        let mut ev = signed(1, 1, 1, &[], "");
        ev.pubkey = "npub".into();
        assert!(keys_for_event(&ev, 1).is_err());
    }

    #[test]
    fn counts_indexable_tags() {
        let ev = signed(1, 1, 1, &[&["t", "a"], &["t", "a"], &["alt", "x"]], "");
        assert_eq!(indexable_tag_count(&ev), 2);
    }
}
