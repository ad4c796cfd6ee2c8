//! Embedded event store: one ordered redb table holding raw events and every
//! secondary index, plus the query engine that merges index scans.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
    thread::JoinHandle,
};

use parking_lot::RwLock;
use rand::{seq::SliceRandom, thread_rng};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    error::StoreError,
    event::Event,
    filter::Filter,
    index,
    migrate,
    query::{self, Scan},
};

pub(crate) const EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("events");

/// Store-wide upper bound on events returned by one query.
pub const DEFAULT_MAX_LIMIT: usize = 500;
/// Buffered hits per index scan before the producer waits on the merge.
const SCAN_BUFFER: usize = 12;
/// Deletes between two compaction attempts.
const COMPACT_EVERY: u64 = 256;
const DB_FILE: &str = "events.redb";
const EMPTY: &[u8] = &[];

type RawTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

/// Outcome of one background compaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compaction {
    Rewrote,
    Clean,
    Busy,
    Failed,
}

/// Persistent store for events and indexes rooted at a directory.
///
/// Cloning is cheap; every clone shares the same database handle.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    db: RwLock<Database>,
    path: PathBuf,
    max_limit: usize,
    next_serial: AtomicU32,
    deletes: AtomicU64,
    compactions: AtomicU64,
}

/// Lightweight view of a raw record used for duplicate checks.
#[derive(Deserialize)]
struct StoredId {
    id: String,
}

/// Events produced by [`Store::query`], newest first.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub async fn collect(mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(ev) = self.rx.recv().await {
            out.push(ev);
        }
        out
    }
}

impl Store {
    /// Open (or create) the store under `root` and bring its schema up to date.
    pub fn open(root: &Path, max_limit: usize) -> Result<Self, StoreError> {
        fs::create_dir_all(root)?;
        let path = root.join(DB_FILE);
        let db = Database::create(&path)?;
        {
            let txn = db.begin_write()?;
            txn.open_table(EVENTS)?;
            txn.commit()?;
        }
        migrate::run(&db)?;
        let after_last = match last_serial(&db)? {
            Some(s) => s
                .checked_add(1)
                .ok_or_else(|| StoreError::Corrupt("serial space exhausted".into()))?,
            None => 0,
        };
        let next_serial = serial_mark(&db)?.map_or(after_last, |mark| mark.max(after_last));
        info!(path = %path.display(), next_serial, "event store opened");
        Ok(Self {
            inner: Arc::new(Inner {
                db: RwLock::new(db),
                path,
                max_limit: max_limit.max(1),
                next_serial: AtomicU32::new(next_serial),
                deletes: AtomicU64::new(0),
                compactions: AtomicU64::new(0),
            }),
        })
    }

    /// Release this handle. The database closes once the last clone is gone.
    pub fn close(self) {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => {
                let path = inner.path.clone();
                drop(inner);
                info!(path = %path.display(), "event store closed");
            }
            Err(_) => debug!("store handle released, other handles remain"),
        }
    }

    pub fn max_limit(&self) -> usize {
        self.inner.max_limit
    }

    fn allocate_serial(&self) -> Result<u32, StoreError> {
        self.inner
            .next_serial
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |s| {
                s.checked_add(1)
            })
            .map_err(|_| StoreError::Corrupt("serial space exhausted".into()))
    }

    /// Write `ev` and all of its index keys in one transaction.
    ///
    /// Returns [`StoreError::Duplicate`] without touching the store when an
    /// event with the same id is already present.
    pub fn save(&self, ev: &Event) -> Result<(), StoreError> {
        if ev.created_at > index::MAX_KEY_TIMESTAMP {
            return Err(StoreError::InvalidEvent(
                "created_at is beyond the indexable range".into(),
            ));
        }
        let raw = serde_json::to_vec(ev)?;
        let db = self.inner.db.read();
        let txn = db.begin_write()?;
        let duplicate = {
            let mut table = txn.open_table(EVENTS)?;
            if find_serial(&table, &ev.id)?.is_some() {
                true
            } else {
                let serial = self.allocate_serial()?;
                let keys = index::keys_for_event(ev, serial)?;
                table.insert(index::raw_key(serial).as_slice(), raw.as_slice())?;
                // allocate_serial never hands out u32::MAX, so this cannot wrap
                table.insert(
                    index::NEXT_SERIAL_KEY.as_slice(),
                    (serial + 1).to_be_bytes().as_slice(),
                )?;
                for key in &keys {
                    table.insert(key.as_slice(), EMPTY)?;
                }
                false
            }
        };
        if duplicate {
            txn.abort()?;
            return Err(StoreError::Duplicate);
        }
        txn.commit()?;
        debug!(id = %ev.id, kind = ev.kind, "event saved");
        Ok(())
    }

    /// Remove `ev` and its index keys. Returns `false` when it was not stored.
    pub fn delete(&self, ev: &Event) -> Result<bool, StoreError> {
        let db = self.inner.db.read();
        let txn = db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(EVENTS)?;
            match find_serial(&table, &ev.id)? {
                None => false,
                Some(serial) => {
                    // keys come from the stored copy so they match what save wrote
                    let stored = load(&table, serial)?.ok_or_else(|| {
                        StoreError::Corrupt(format!("id index points at missing serial {serial}"))
                    })?;
                    for key in index::keys_for_event(&stored, serial)? {
                        table.remove(key.as_slice())?;
                    }
                    table.remove(index::raw_key(serial).as_slice())?;
                    true
                }
            }
        };
        if !removed {
            txn.abort()?;
            return Ok(false);
        }
        txn.commit()?;
        drop(db);
        debug!(id = %ev.id, "event deleted");

        let n = self.inner.deletes.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        if n % COMPACT_EVERY == 0 {
            // detached; the thread logs its own outcome
            drop(self.spawn_compaction());
        }
        Ok(true)
    }

    /// Best-effort background compaction; skipped while the store is in use.
    fn spawn_compaction(&self) -> JoinHandle<Compaction> {
        self.inner.compactions.fetch_add(1, AtomicOrdering::Relaxed);
        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            let Some(mut db) = inner.db.try_write() else {
                debug!("compaction skipped, store busy");
                return Compaction::Busy;
            };
            match db.compact() {
                Ok(true) => {
                    info!("store compacted");
                    Compaction::Rewrote
                }
                Ok(false) => {
                    debug!("compaction found nothing to rewrite");
                    Compaction::Clean
                }
                Err(e) => {
                    warn!(error = %e, "compaction failed");
                    Compaction::Failed
                }
            }
        })
    }

    #[cfg(test)]
    fn compactions(&self) -> u64 {
        self.inner.compactions.load(AtomicOrdering::Relaxed)
    }

    /// Stored versions of the replaceable address `pubkey`/`kind`, optionally
    /// narrowed to one `d` value.
    ///
    /// Walks the whole pubkey+kind family without a result limit, so the
    /// current version turns up however many other addresses the author has.
    pub fn versions(
        &self,
        pubkey: &str,
        kind: u16,
        d: Option<&str>,
    ) -> Result<Vec<Event>, StoreError> {
        let prefix = index::pubkey_kind_prefix(pubkey, kind)?;
        let key_len = prefix.len() + 8;
        let mut end = prefix.clone();
        end.extend_from_slice(&[0xff; 8]);

        let db = self.inner.db.read();
        let txn = db.begin_read()?;
        let table = txn.open_table(EVENTS)?;
        let mut out = Vec::new();
        for item in table.range(prefix.as_slice()..=end.as_slice())? {
            let (key, _) = item?;
            if key.value().len() != key_len {
                continue;
            }
            let Some(serial) = index::serial_of(key.value()) else {
                continue;
            };
            let ev = match load(&table, serial) {
                Ok(Some(ev)) => ev,
                Ok(None) => continue,
                Err(e) => {
                    warn!(serial, error = %e, "skipping undecodable record");
                    continue;
                }
            };
            if ev.pubkey == pubkey && ev.kind == kind && d.map_or(true, |d| ev.d_tag() == d) {
                out.push(ev);
            }
        }
        Ok(out)
    }

    /// Number of stored events matching `filter`. `limit` is not applied.
    pub fn count(&self, filter: &Filter) -> Result<i64, StoreError> {
        let plan = query::plan(filter, self.inner.max_limit)?;
        let db = self.inner.db.read();
        let txn = db.begin_read()?;
        let table = txn.open_table(EVENTS)?;
        let mut seen = HashSet::new();
        for scan in &plan.scans {
            let range = match table.range(scan.start.as_slice()..=scan.end.as_slice()) {
                Ok(range) => range,
                Err(e) => {
                    warn!(error = %e, "count scan failed");
                    continue;
                }
            };
            for item in range {
                let (key, _) = match item {
                    Ok(kv) => kv,
                    Err(e) => {
                        warn!(error = %e, "count scan aborted");
                        break;
                    }
                };
                let key = key.value();
                if key.len() != scan.key_len {
                    continue;
                }
                let Some(serial) = index::serial_of(key) else {
                    continue;
                };
                if seen.contains(&serial) {
                    continue;
                }
                if let Some(residual) = &plan.residual {
                    match load(&table, serial) {
                        Ok(Some(ev)) if residual.matches(&ev) => {}
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(serial, error = %e, "skipping unreadable record");
                            continue;
                        }
                    }
                }
                seen.insert(serial);
            }
        }
        Ok(seen.len() as i64)
    }

    /// Stream events matching `filter`, newest first, at most the effective limit.
    ///
    /// Each planned scan runs on the blocking pool and feeds a bounded channel;
    /// a merge task pulls from all of them through a max-heap. Must be called
    /// from within a Tokio runtime.
    pub fn query(&self, filter: &Filter) -> Result<EventStream, StoreError> {
        let plan = query::plan(filter, self.inner.max_limit)?;
        let residual = plan.residual.map(Arc::new);
        let mut sources = Vec::with_capacity(plan.scans.len());
        for scan in plan.scans {
            let (tx, rx) = mpsc::channel(SCAN_BUFFER);
            let inner = Arc::clone(&self.inner);
            let residual = residual.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = produce(&inner, &scan, residual.as_deref(), &tx) {
                    warn!(error = %e, "index scan aborted");
                }
            });
            sources.push(rx);
        }
        let (tx, rx) = mpsc::channel(SCAN_BUFFER);
        tokio::spawn(merge(sources, plan.limit, tx));
        Ok(EventStream { rx })
    }

    /// Run a query to completion.
    pub async fn query_all(&self, filter: &Filter) -> Result<Vec<Event>, StoreError> {
        Ok(self.query(filter)?.collect().await)
    }

    /// Write every raw event as one JSON object per line. Returns the count.
    pub fn export<W: Write>(&self, mut out: W) -> Result<usize, StoreError> {
        let db = self.inner.db.read();
        let txn = db.begin_read()?;
        let table = txn.open_table(EVENTS)?;
        let mut n = 0;
        for item in table.range(index::raw_key(0).as_slice()..=index::raw_key(u32::MAX).as_slice())? {
            let (_, raw) = item?;
            out.write_all(raw.value())?;
            out.write_all(b"\n")?;
            n += 1;
        }
        out.flush()?;
        Ok(n)
    }

    /// Drop every secondary index key and rebuild them from the raw records.
    pub fn reindex(&self) -> Result<usize, StoreError> {
        let db = self.inner.db.read();
        let txn = db.begin_write()?;
        let n = {
            let mut table = txn.open_table(EVENTS)?;
            rebuild_indexes(&mut table)?
        };
        txn.commit()?;
        info!(events = n, "indexes rebuilt");
        Ok(n)
    }

    /// Verify signatures for a random sample of stored events.
    pub fn verify_sample(&self, sample: usize) -> Result<usize, StoreError> {
        let db = self.inner.db.read();
        let txn = db.begin_read()?;
        let table = txn.open_table(EVENTS)?;
        let mut serials = Vec::new();
        for item in table.range(index::raw_key(0).as_slice()..=index::raw_key(u32::MAX).as_slice())? {
            let (key, _) = item?;
            if let Some(serial) = index::serial_of(key.value()) {
                serials.push(serial);
            }
        }
        serials.shuffle(&mut thread_rng());
        let take = sample.min(serials.len());
        for serial in serials.iter().take(take) {
            let Some(ev) = load(&table, *serial)? else {
                continue;
            };
            ev.verify()
                .map_err(|e| StoreError::InvalidEvent(format!("event {}: {e}", ev.id)))?;
        }
        Ok(take)
    }
}

/// Highest serial that has a raw record.
fn serial_mark(db: &Database) -> Result<Option<u32>, StoreError> {
    let txn = db.begin_read()?;
    let table = txn.open_table(EVENTS)?;
    let Some(raw) = table.get(index::NEXT_SERIAL_KEY.as_slice())? else {
        return Ok(None);
    };
    let bytes: [u8; 4] = raw
        .value()
        .try_into()
        .map_err(|_| StoreError::Corrupt("serial mark is not four bytes".into()))?;
    Ok(Some(u32::from_be_bytes(bytes)))
}

fn last_serial(db: &Database) -> Result<Option<u32>, StoreError> {
    let txn = db.begin_read()?;
    let table = txn.open_table(EVENTS)?;
    let last = table
        .range(index::raw_key(0).as_slice()..=index::raw_key(u32::MAX).as_slice())?
        .next_back()
        .transpose()?;
    Ok(last.and_then(|(key, _)| index::serial_of(key.value())))
}

/// Serial of the stored event with exactly this id.
fn find_serial<T>(table: &T, id: &str) -> Result<Option<u32>, StoreError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let prefix = index::id_prefix(id)?;
    let mut start = prefix.clone();
    start.extend_from_slice(&[0; 4]);
    let mut end = prefix;
    end.extend_from_slice(&[0xff; 4]);
    for item in table.range(start.as_slice()..=end.as_slice())? {
        let (key, _) = item?;
        let Some(serial) = index::serial_of(key.value()) else {
            continue;
        };
        if let Some(raw) = table.get(index::raw_key(serial).as_slice())? {
            let stored: StoredId = serde_json::from_slice(raw.value())?;
            if stored.id == id {
                return Ok(Some(serial));
            }
        }
    }
    Ok(None)
}

fn load<T>(table: &T, serial: u32) -> Result<Option<Event>, StoreError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    match table.get(index::raw_key(serial).as_slice())? {
        Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
        None => Ok(None),
    }
}

/// Remove all secondary keys, then re-derive them from each raw record.
pub(crate) fn rebuild_indexes(table: &mut RawTable<'_>) -> Result<usize, StoreError> {
    let stale = table
        .range([index::CREATED_AT].as_slice()..[index::VERSION].as_slice())?
        .map(|item| item.map(|(key, _)| key.value().to_vec()))
        .collect::<Result<Vec<_>, _>>()?;
    for key in &stale {
        table.remove(key.as_slice())?;
    }
    let raws = table
        .range(index::raw_key(0).as_slice()..=index::raw_key(u32::MAX).as_slice())?
        .map(|item| item.map(|(key, raw)| (key.value().to_vec(), raw.value().to_vec())))
        .collect::<Result<Vec<_>, _>>()?;
    let mut n = 0;
    for (key, raw) in raws {
        let Some(serial) = index::serial_of(&key) else {
            continue;
        };
        let ev: Event = match serde_json::from_slice(&raw) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(serial, error = %e, "skipping undecodable record");
                continue;
            }
        };
        for key in index::keys_for_event(&ev, serial)? {
            table.insert(key.as_slice(), EMPTY)?;
        }
        n += 1;
    }
    Ok(n)
}

/// An index hit resolved to its event.
struct Hit {
    serial: u32,
    event: Event,
}

/// Walk one scan newest first, pushing residual-filtered events to `tx`.
///
/// Undecodable records are skipped; engine errors end this scan only.
fn produce(
    inner: &Inner,
    scan: &Scan,
    residual: Option<&Filter>,
    tx: &mpsc::Sender<Hit>,
) -> Result<(), StoreError> {
    let db = inner.db.read();
    let txn = db.begin_read()?;
    let table = txn.open_table(EVENTS)?;
    for item in table.range(scan.start.as_slice()..=scan.end.as_slice())?.rev() {
        let (key, _) = item?;
        let key = key.value();
        if key.len() != scan.key_len {
            continue;
        }
        let Some(serial) = index::serial_of(key) else {
            continue;
        };
        let event = match load(&table, serial) {
            Ok(Some(ev)) => ev,
            Ok(None) => {
                warn!(serial, "index entry points at a missing record");
                continue;
            }
            Err(StoreError::Codec(e)) => {
                warn!(serial, error = %e, "skipping undecodable record");
                continue;
            }
            Err(e) => return Err(e),
        };
        if residual.is_some_and(|f| !f.matches(&event)) {
            continue;
        }
        if tx.blocking_send(Hit { serial, event }).is_err() {
            // merge finished or the caller went away
            return Ok(());
        }
    }
    Ok(())
}

struct Head {
    hit: Hit,
    source: usize,
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hit
            .event
            .created_at
            .cmp(&other.hit.event.created_at)
            .then(self.hit.serial.cmp(&other.hit.serial))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

/// K-way merge of newest-first sources into one newest-first stream.
async fn merge(mut sources: Vec<mpsc::Receiver<Hit>>, limit: usize, out: mpsc::Sender<Event>) {
    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (source, rx) in sources.iter_mut().enumerate() {
        if let Some(hit) = rx.recv().await {
            heap.push(Head { hit, source });
        }
    }
    let mut emitted = HashSet::new();
    while let Some(Head { hit, source }) = heap.pop() {
        if let Some(next) = sources[source].recv().await {
            heap.push(Head { hit: next, source });
        }
        if !emitted.insert(hit.serial) {
            continue;
        }
        if out.send(hit.event).await.is_err() {
            return;
        }
        if emitted.len() >= limit {
            return;
        }
    }
}
