//! Relay core: write policies, publishing with replacement semantics,
//! deletion requests and fan-out to live subscriptions.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    auth,
    config::Settings,
    connection::Connection,
    error::{Reject, StoreError},
    event::{is_hex64, is_older, unix_now, Event, KindClass},
    filter::Filter,
    index,
    listener::Registry,
    storage::Store,
};

/// What happened to an accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Stored,
    /// Already present; accepted without side effects.
    Duplicate,
    /// Broadcast to listeners without being stored.
    Ephemeral,
    /// A newer version of this replaceable event is already stored.
    Superseded,
}

pub struct Relay {
    store: Store,
    listeners: Registry,
    settings: Settings,
    // serialises the read-compare-delete-save sequence of replaceable kinds
    replace_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl Relay {
    pub fn new(store: Store, settings: Settings) -> Arc<Self> {
        Arc::new(Relay {
            store,
            listeners: Registry::default(),
            settings,
            replace_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn listeners(&self) -> &Registry {
        &self.listeners
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Parent of every connection token.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run a store call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    /// Write policies applied to EVENT before anything touches the store.
    pub fn check_event(&self, conn: &Connection, ev: &Event) -> Result<(), Reject> {
        let cfg = &self.settings;
        if cfg.auth_required && conn.authed_pubkey().is_none() {
            return Err(Reject::AuthRequired(
                "this relay only accepts events from authenticated users".into(),
            ));
        }
        if cfg.max_events_per_minute > 0 && !conn.admit_event(cfg.max_events_per_minute) {
            return Err(Reject::RateLimited("slow down".into()));
        }
        if cfg.max_future_secs > 0 && ev.created_at > unix_now() + cfg.max_future_secs {
            return Err(Reject::Invalid(
                "event creation date is too far off from the current time".into(),
            ));
        }
        if ev.created_at > index::MAX_KEY_TIMESTAMP {
            return Err(Reject::Invalid(
                "event creation date is beyond the supported range".into(),
            ));
        }
        if cfg.max_tag_value_len > 0
            && ev
                .tags
                .iter()
                .flat_map(|t| t.0.iter().skip(1))
                .any(|v| v.len() > cfg.max_tag_value_len)
        {
            return Err(Reject::Invalid("tag value is too large".into()));
        }
        if cfg.max_indexed_tags > 0 && index::indexable_tag_count(ev) > cfg.max_indexed_tags {
            return Err(Reject::Invalid("too many indexable tags".into()));
        }
        Ok(())
    }

    /// Read policies applied to every REQ and COUNT filter.
    pub fn check_filter(&self, conn: &Connection, filter: &Filter) -> Result<(), Reject> {
        let authed = conn.authed_pubkey();
        if self.settings.auth_required && authed.is_none() {
            return Err(Reject::AuthRequired(
                "this relay only serves authenticated users".into(),
            ));
        }
        filter.validate().map_err(Reject::Invalid)?;
        auth::check_dm_filter(filter, authed.as_deref())
    }

    /// Store `ev` according to its kind class and notify listeners.
    pub async fn publish(&self, ev: &Event) -> Result<Published, Reject> {
        let outcome = match ev.class() {
            KindClass::Ephemeral => Published::Ephemeral,
            KindClass::Regular => self.save(ev).await?,
            KindClass::Replaceable | KindClass::ParameterizedReplaceable => {
                self.replace(ev).await?
            }
        };
        if matches!(outcome, Published::Stored | Published::Ephemeral) {
            let delivered = self.listeners.notify(ev);
            debug!(id = %ev.id, kind = ev.kind, delivered, "published");
        }
        Ok(outcome)
    }

    async fn save(&self, ev: &Event) -> Result<Published, StoreError> {
        let owned = ev.clone();
        match self.blocking(move |s| s.save(&owned)).await {
            Ok(()) => Ok(Published::Stored),
            Err(StoreError::Duplicate) => Ok(Published::Duplicate),
            Err(e) => Err(e),
        }
    }

    async fn replace(&self, ev: &Event) -> Result<Published, StoreError> {
        let _guard = self.replace_lock.lock().await;
        let d = (ev.class() == KindClass::ParameterizedReplaceable)
            .then(|| ev.d_tag().to_string());
        let (pubkey, kind) = (ev.pubkey.clone(), ev.kind);
        let existing = self
            .blocking(move |s| s.versions(&pubkey, kind, d.as_deref()))
            .await?;

        let mut superseded = false;
        for old in existing {
            if old.id == ev.id {
                return Ok(Published::Duplicate);
            }
            if is_older(&old, ev) {
                let id = old.id.clone();
                self.blocking(move |s| s.delete(&old)).await?;
                debug!(%id, by = %ev.id, "replaced");
            } else {
                superseded = true;
            }
        }
        if superseded {
            return Ok(Published::Superseded);
        }
        self.save(ev).await
    }

    /// Apply a NIP-09 deletion request, then keep the request itself.
    ///
    /// Every referenced event must belong to the requester unless the
    /// requester is an owner; otherwise nothing is deleted.
    pub async fn handle_deletion(&self, ev: &Event) -> Result<Published, Reject> {
        let owner = self.settings.owners.iter().any(|o| *o == ev.pubkey);
        let ids: Vec<String> = ev
            .tag_values("e")
            .filter(|v| is_hex64(v))
            .map(str::to_string)
            .collect();
        if !ids.is_empty() {
            let targets = self
                .store
                .query_all(&Filter {
                    ids: Some(ids),
                    ..Filter::default()
                })
                .await?;
            if !owner && targets.iter().any(|t| t.pubkey != ev.pubkey) {
                return Err(Reject::Blocked(
                    "you are not the author of this event".into(),
                ));
            }
            for target in targets {
                let id = target.id.clone();
                if self.blocking(move |s| s.delete(&target)).await? {
                    info!(%id, by = %ev.pubkey, "deleted");
                }
            }
        }
        self.publish(ev).await
    }

    /// Sum of the store counts for each filter.
    pub async fn count(&self, filters: Vec<Filter>) -> Result<i64, StoreError> {
        self.blocking(move |s| {
            filters
                .iter()
                .try_fold(0i64, |total, f| -> Result<i64, StoreError> {
                    Ok(total + s.count(f)?)
                })
        })
        .await
    }
}
