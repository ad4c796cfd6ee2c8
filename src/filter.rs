//! NIP-01 filters: decoding, matching and validation.

use std::collections::BTreeMap;

use serde::{de, ser::SerializeMap, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::event::{is_hex64, Event};

/// Declarative predicate used by REQ and COUNT.
///
/// Lists are OR'ed internally and fields are AND'ed together. Tag conditions
/// come from keys such as `"#e"` and live in `tags` under the bare name
/// (`"e"`). Empty lists are normalised away at decode time so that a present
/// field always constrains the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u16>>,
    pub tags: BTreeMap<String, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
    pub search: Option<String>,
}

impl Filter {
    /// Decode a filter from a JSON object, ignoring unknown keys.
    pub fn from_value(val: &Value) -> Result<Self, String> {
        let obj = val
            .as_object()
            .ok_or_else(|| "filter must be a JSON object".to_string())?;
        let mut f = Filter::default();
        for (key, v) in obj {
            match key.as_str() {
                "ids" => f.ids = non_empty(strings(key, v)?),
                "authors" => f.authors = non_empty(strings(key, v)?),
                "kinds" => {
                    let arr = v.as_array().ok_or_else(|| format!("{key} must be an array"))?;
                    let kinds = arr
                        .iter()
                        .map(|k| {
                            k.as_u64()
                                .and_then(|k| u16::try_from(k).ok())
                                .ok_or_else(|| format!("kind {k} is out of range"))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    f.kinds = non_empty(kinds);
                }
                "since" => f.since = Some(timestamp(key, v)?),
                "until" => f.until = Some(timestamp(key, v)?),
                "limit" => {
                    let n = v
                        .as_u64()
                        .ok_or_else(|| "limit must be a non-negative integer".to_string())?;
                    f.limit = Some(usize::try_from(n).unwrap_or(usize::MAX));
                }
                "search" => {
                    f.search = v.as_str().filter(|s| !s.is_empty()).map(str::to_string);
                }
                other => {
                    if let Some(name) = other.strip_prefix('#') {
                        let values = strings(key, v)?;
                        if !name.is_empty() && !values.is_empty() {
                            f.tags.insert(name.to_string(), values);
                        }
                    }
                }
            }
        }
        Ok(f)
    }

    /// Returns true when `ev` satisfies every constraint of this filter.
    ///
    /// `search` is not interpreted and never excludes an event.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|since| ev.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| ev.created_at > until) {
            return false;
        }
        self.tags.iter().all(|(name, values)| {
            ev.tag_values(name)
                .any(|v| values.iter().any(|want| want == v))
        })
    }

    /// Reject shapes the store cannot plan.
    pub fn validate(&self) -> Result<(), String> {
        for id in self.ids.iter().flatten() {
            if !is_hex64(id) {
                return Err(format!("id {id:?} is not 64 hex characters"));
            }
        }
        for author in self.authors.iter().flatten() {
            if !is_hex64(author) {
                return Err(format!("author {author:?} is not 64 hex characters"));
            }
        }
        Ok(())
    }

    /// True when the filter carries no constraint besides `limit`.
    pub fn is_unconstrained(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.tags.is_empty()
            && self.since.is_none()
            && self.until.is_none()
    }

    /// Equality ignoring list order and repeated values.
    pub fn equivalent(&self, other: &Filter) -> bool {
        self.canonical() == other.canonical()
    }

    fn canonical(&self) -> Filter {
        fn sorted<T: Ord + Clone>(v: &Option<Vec<T>>) -> Option<Vec<T>> {
            v.as_ref().map(|v| {
                let mut v = v.clone();
                v.sort();
                v.dedup();
                v
            })
        }
        Filter {
            ids: sorted(&self.ids),
            authors: sorted(&self.authors),
            kinds: sorted(&self.kinds),
            tags: self
                .tags
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), sorted(&Some(v.clone()))?)))
                .collect(),
            since: self.since,
            until: self.until,
            limit: self.limit,
            search: self.search.clone(),
        }
    }
}

fn strings(key: &str, v: &Value) -> Result<Vec<String>, String> {
    let arr = v.as_array().ok_or_else(|| format!("{key} must be an array"))?;
    arr.iter()
        .map(|s| {
            s.as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("{key} must only contain strings"))
        })
        .collect()
}

fn timestamp(key: &str, v: &Value) -> Result<u64, String> {
    v.as_u64()
        .ok_or_else(|| format!("{key} must be a non-negative integer"))
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let val = Value::deserialize(deserializer)?;
        Filter::from_value(&val).map_err(de::Error::custom)
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut obj = Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), ids.clone().into());
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), authors.clone().into());
        }
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".into(), kinds.clone().into());
        }
        for (name, values) in &self.tags {
            obj.insert(format!("#{name}"), values.clone().into());
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), since.into());
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), until.into());
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), limit.into());
        }
        if let Some(search) = &self.search {
            obj.insert("search".into(), search.clone().into());
        }
        let mut map = serializer.serialize_map(Some(obj.len()))?;
        for (k, v) in &obj {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}
