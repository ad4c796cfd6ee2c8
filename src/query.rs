//! Query planner: picks the index families that answer a filter.

use std::collections::BTreeSet;

use crate::{
    error::StoreError,
    filter::Filter,
    index::{self, key_timestamp, Key, TagValue},
};

/// One reverse range scan over an index family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub start: Key,
    pub end: Key,
    /// Exact key length for this scan. Longer tag values that share the
    /// prefix fall inside the range and are skipped by length.
    pub key_len: usize,
}

impl Scan {
    /// Keys `prefix ++ created_at ++ serial` with `since <= created_at <= until`.
    fn timestamped(prefix: Key, since: u32, until: u32) -> Self {
        let key_len = prefix.len() + 8;
        let mut start = prefix.clone();
        start.extend_from_slice(&since.to_be_bytes());
        start.extend_from_slice(&[0; 4]);
        let mut end = prefix;
        end.extend_from_slice(&until.to_be_bytes());
        end.extend_from_slice(&[0xff; 4]);
        Scan { start, end, key_len }
    }

    /// Keys `prefix ++ serial`.
    fn point(prefix: Key) -> Self {
        let key_len = prefix.len() + 4;
        let mut start = prefix.clone();
        start.extend_from_slice(&[0; 4]);
        let mut end = prefix;
        end.extend_from_slice(&[0xff; 4]);
        Scan { start, end, key_len }
    }
}

/// Scans plus whatever the chosen indexes cannot decide on their own.
#[derive(Debug)]
pub struct Plan {
    pub scans: Vec<Scan>,
    /// Checked against each fetched event; `None` when the keys are exact.
    pub residual: Option<Filter>,
    pub limit: usize,
}

/// Effective result bound for a filter.
pub fn effective_limit(filter: &Filter, max_limit: usize) -> usize {
    match filter.limit {
        Some(l) if l > 0 && l < max_limit => l,
        _ => max_limit,
    }
}

pub fn plan(filter: &Filter, max_limit: usize) -> Result<Plan, StoreError> {
    filter.validate().map_err(StoreError::InvalidFilter)?;
    let limit = effective_limit(filter, max_limit);

    let since = filter.since.map(key_timestamp).unwrap_or(0);
    let until = filter.until.map(key_timestamp).unwrap_or(u32::MAX);
    if since > until {
        return Ok(Plan {
            scans: Vec::new(),
            residual: None,
            limit,
        });
    }

    let mut residual = filter.clone();
    residual.limit = None;
    residual.search = None;

    let mut prefixes: BTreeSet<Key> = BTreeSet::new();
    if let Some(ids) = &filter.ids {
        // id keys carry no timestamp, so since/until stay in the residual
        let scans = ids
            .iter()
            .map(|id| index::id_prefix(id).map(Scan::point))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Plan {
            scans: dedup(scans),
            residual: Some(residual),
            limit,
        });
    }

    match (&filter.authors, &filter.kinds) {
        (Some(authors), None) => {
            for author in authors {
                prefixes.insert(index::pubkey_prefix(author)?);
            }
        }
        (Some(authors), Some(kinds)) => {
            for author in authors {
                for kind in kinds {
                    prefixes.insert(index::pubkey_kind_prefix(author, *kind)?);
                }
            }
            residual.kinds = None;
        }
        (None, _) if !filter.tags.is_empty() => {
            for values in filter.tags.values() {
                for value in values {
                    prefixes.insert(TagValue::classify(value).prefix());
                }
            }
        }
        (None, Some(kinds)) => {
            for kind in kinds {
                prefixes.insert(index::kind_prefix(*kind));
            }
            residual.kinds = None;
        }
        (None, None) => {
            prefixes.insert(vec![index::CREATED_AT]);
        }
    }

    // key timestamps are exact unless a bound sits at the 32-bit clamp
    let clamp = u64::from(u32::MAX);
    if filter.until.map_or(true, |u| u < clamp) && filter.since.map_or(true, |s| s <= clamp) {
        residual.since = None;
        residual.until = None;
    }

    let scans = prefixes
        .into_iter()
        .map(|p| Scan::timestamped(p, since, until))
        .collect();
    Ok(Plan {
        scans,
        residual: (!residual.is_unconstrained()).then_some(residual),
        limit,
    })
}

fn dedup(mut scans: Vec<Scan>) -> Vec<Scan> {
    scans.sort_by(|a, b| a.start.cmp(&b.start));
    scans.dedup();
    scans
}
