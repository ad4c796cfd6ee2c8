//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::storage::DEFAULT_MAX_LIMIT;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the event database.
    pub store_root: PathBuf,
    /// HTTP and WebSocket bind address, e.g. `127.0.0.1:7777`.
    pub bind: String,
    /// Canonical `ws(s)://` URL of this relay. Derived from request headers
    /// when unset.
    pub service_url: Option<String>,
    /// Verify Schnorr signatures on import.
    pub verify_sig: bool,
    /// Upper bound on results per filter.
    pub max_limit: usize,
    /// Require NIP-42 authentication before EVENT, REQ and COUNT.
    pub auth_required: bool,
    /// Answer NIP-45 COUNT requests.
    pub count_enabled: bool,
    /// Pubkeys allowed to delete anyone's events.
    pub owners: Vec<String>,
    pub relay_name: String,
    pub relay_description: String,
    pub relay_pubkey: Option<String>,
    pub relay_contact: Option<String>,
    pub relay_icon: Option<String>,
    /// Largest inbound WebSocket message in bytes.
    pub max_message_size: usize,
    pub ping_period: Duration,
    pub pong_wait: Duration,
    /// Frames buffered per connection before it is considered stuck.
    pub outbound_queue: usize,
    /// Per-connection EVENT budget, `0` disables the limit.
    pub max_events_per_minute: u32,
    /// How far ahead of the clock `created_at` may be, `0` disables the check.
    pub max_future_secs: u64,
    /// Longest tag value accepted, `0` disables the check.
    pub max_tag_value_len: usize,
    /// Most indexable tags accepted on one event, `0` disables the check.
    pub max_indexed_tags: usize,
}

impl Settings {
    /// Defaults for a store under `store_root`.
    pub fn with_root(store_root: impl Into<PathBuf>) -> Self {
        Settings {
            store_root: store_root.into(),
            bind: "127.0.0.1:7777".into(),
            service_url: None,
            verify_sig: true,
            max_limit: DEFAULT_MAX_LIMIT,
            auth_required: false,
            count_enabled: true,
            owners: Vec::new(),
            relay_name: "keel".into(),
            relay_description: String::new(),
            relay_pubkey: None,
            relay_contact: None,
            relay_icon: None,
            max_message_size: 512_000,
            ping_period: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            outbound_queue: 256,
            max_events_per_minute: 0,
            max_future_secs: 900,
            max_tag_value_len: 1024,
            max_indexed_tags: 1000,
        }
    }

    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = env::var("STORE_ROOT").context("STORE_ROOT is not set")?;
        let mut cfg = Settings::with_root(store_root);
        cfg.bind = env::var("BIND").context("BIND is not set")?;
        cfg.service_url = optional("SERVICE_URL");
        cfg.verify_sig = flag("VERIFY_SIG", cfg.verify_sig);
        cfg.max_limit = number("MAX_LIMIT", cfg.max_limit)?;
        cfg.auth_required = flag("AUTH_REQUIRED", cfg.auth_required);
        cfg.count_enabled = flag("COUNT_ENABLED", cfg.count_enabled);
        cfg.owners = csv_strings(env::var("OWNERS").unwrap_or_default());
        if let Some(name) = optional("RELAY_NAME") {
            cfg.relay_name = name;
        }
        cfg.relay_description = env::var("RELAY_DESCRIPTION").unwrap_or_default();
        cfg.relay_pubkey = optional("RELAY_PUBKEY");
        cfg.relay_contact = optional("RELAY_CONTACT");
        cfg.relay_icon = optional("RELAY_ICON");
        cfg.max_message_size = number("MAX_MESSAGE_SIZE", cfg.max_message_size)?;
        cfg.ping_period = Duration::from_secs(number("PING_PERIOD_SECS", 30)?);
        cfg.pong_wait = Duration::from_secs(number("PONG_WAIT_SECS", 60)?);
        cfg.outbound_queue = number("OUTBOUND_QUEUE", cfg.outbound_queue)?;
        cfg.max_events_per_minute = number("MAX_EVENTS_PER_MINUTE", cfg.max_events_per_minute)?;
        cfg.max_future_secs = number("MAX_FUTURE_SECS", cfg.max_future_secs)?;
        cfg.max_tag_value_len = number("MAX_TAG_VALUE_LEN", cfg.max_tag_value_len)?;
        cfg.max_indexed_tags = number("MAX_INDEXED_TAGS", cfg.max_indexed_tags)?;
        Ok(cfg)
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn flag(key: &str, default: bool) -> bool {
    match optional(key) {
        Some(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn number<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(v) => v.parse().with_context(|| format!("{key}={v:?} is not a number")),
        None => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) const ENV_KEYS: &[&str] = &[
    "STORE_ROOT",
    "BIND",
    "SERVICE_URL",
    "VERIFY_SIG",
    "MAX_LIMIT",
    "AUTH_REQUIRED",
    "COUNT_ENABLED",
    "OWNERS",
    "RELAY_NAME",
    "RELAY_DESCRIPTION",
    "RELAY_PUBKEY",
    "RELAY_CONTACT",
    "RELAY_ICON",
    "MAX_MESSAGE_SIZE",
    "PING_PERIOD_SECS",
    "PONG_WAIT_SECS",
    "OUTBOUND_QUEUE",
    "MAX_EVENTS_PER_MINUTE",
    "MAX_FUTURE_SECS",
    "MAX_TAG_VALUE_LEN",
    "MAX_INDEXED_TAGS",
];
