//! Schema versioning for the event store.
//!
//! The version lives under the single-byte key `[255]` as a big-endian u16.
//! Migrations run in order and never roll back.
//!
//! - 1: keys carry 4-byte serials. Stores written before versioning used a
//!   different layout and cannot be reshaped in place.
//! - 2: addressable `kind:pubkey:d` tag values get their own index family;
//!   every secondary index is rebuilt.

use redb::{Database, ReadableTable};
use tracing::info;

use crate::{
    error::StoreError,
    index,
    storage::{rebuild_indexes, EVENTS},
};

pub const TARGET_VERSION: u16 = 2;

const VERSION_KEY: [u8; 1] = [index::VERSION];

pub(crate) fn run(db: &Database) -> Result<(), StoreError> {
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(EVENTS)?;
        let found = match table.get(VERSION_KEY.as_slice())? {
            Some(raw) => {
                let bytes: [u8; 2] = raw.value().try_into().map_err(|_| {
                    StoreError::Corrupt("schema version key is not two bytes".into())
                })?;
                u16::from_be_bytes(bytes)
            }
            None => 0,
        };
        if found > TARGET_VERSION {
            return Err(StoreError::NewerSchema {
                found,
                supported: TARGET_VERSION,
            });
        }
        if found == TARGET_VERSION {
            return Ok(());
        }

        let has_events = table
            .range([index::ID].as_slice()..[index::KIND].as_slice())?
            .next()
            .is_some();
        let mut version = found;

        if version < 1 {
            if has_events {
                return Err(StoreError::MigrationRefused {
                    found,
                    target: TARGET_VERSION,
                });
            }
            version = 1;
        }
        if version < 2 {
            let n = rebuild_indexes(&mut table)?;
            if n > 0 {
                info!(events = n, "rebuilt indexes for schema 2");
            }
            version = 2;
        }
        table.insert(VERSION_KEY.as_slice(), version.to_be_bytes().as_slice())?;
        info!(from = found, to = version, "store schema migrated");
    }
    txn.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::fixtures::signed,
        filter::Filter,
        storage::{Store, DEFAULT_MAX_LIMIT},
    };
    use tempfile::TempDir;

    fn set_version(dir: &TempDir, version: Option<u16>) {
        let db = Database::create(dir.path().join("events.redb")).unwrap();
        let txn = db.begin_write().unwrap();
        {
            let mut table = txn.open_table(EVENTS).unwrap();
            match version {
                Some(v) => {
                    table
                        .insert(VERSION_KEY.as_slice(), v.to_be_bytes().as_slice())
                        .unwrap();
                }
                None => {
                    table.remove(VERSION_KEY.as_slice()).unwrap();
                }
            }
        }
        txn.commit().unwrap();
    }

    fn read_version(dir: &TempDir) -> u16 {
        let db = Database::create(dir.path().join("events.redb")).unwrap();
        let txn = db.begin_read().unwrap();
        let table = txn.open_table(EVENTS).unwrap();
        let raw = table.get(VERSION_KEY.as_slice()).unwrap().unwrap();
        u16::from_be_bytes(raw.value().try_into().unwrap())
    }

    #[test]
    fn fresh_store_is_stamped_with_target() {
        let dir = TempDir::new().unwrap();
        Store::open(dir.path(), DEFAULT_MAX_LIMIT).unwrap().close();
        assert_eq!(read_version(&dir), TARGET_VERSION);
    }

    #[test]
    fn unversioned_data_is_refused() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), DEFAULT_MAX_LIMIT).unwrap();
        store.save(&signed(1, 1, 1, &[], "")).unwrap();
        store.close();
        set_version(&dir, None);
        let err = Store::open(dir.path(), DEFAULT_MAX_LIMIT).err().unwrap();
        assert!(matches!(err, StoreError::MigrationRefused { found: 0, .. }));
        assert!(err.to_string().contains("export"));
    }

    #[test]
    fn newer_schema_fails_fast() {
        let dir = TempDir::new().unwrap();
        Store::open(dir.path(), DEFAULT_MAX_LIMIT).unwrap().close();
        set_version(&dir, Some(TARGET_VERSION + 1));
        let err = Store::open(dir.path(), DEFAULT_MAX_LIMIT).err().unwrap();
        assert!(matches!(err, StoreError::NewerSchema { .. }));
    }

    #[tokio::test]
    async fn version_one_is_reindexed() {
        let dir = TempDir::new().unwrap();
        let ev = signed(1, 1, 1, &[&["t", "kept"]], "");
        {
            let store = Store::open(dir.path(), DEFAULT_MAX_LIMIT).unwrap();
            store.save(&ev).unwrap();
            store.close();
        }
        set_version(&dir, Some(1));
        Store::open(dir.path(), DEFAULT_MAX_LIMIT).unwrap().close();
        assert_eq!(read_version(&dir), TARGET_VERSION);
        let store = Store::open(dir.path(), DEFAULT_MAX_LIMIT).unwrap();
        let filter = Filter::from_value(&serde_json::json!({"#t": ["kept"]})).unwrap();
        assert_eq!(store.query_all(&filter).await.unwrap(), vec![ev]);
    }
}
