//! Subscription filters and their match semantics.

use std::collections::BTreeMap;

use serde::de::Error as DeError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::event::Event;

/// Conjunction of optional predicates over events.
///
/// A populated predicate must match for the filter to match; within one
/// predicate any listed value may match. Tag predicates are keyed by class
/// letter (`d`, `e`, `p`, …) and appear on the wire as `#d`, `#e`, ….
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<u64>,
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Check the event against every populated predicate.
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
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        // every listed tag class must have at least one admissible value
        for (letter, values) in &self.tags {
            if !ev
                .tag_values(letter)
                .any(|v| values.iter().any(|want| want == v))
            {
                return false;
            }
        }
        true
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        for (letter, values) in &self.tags {
            map.serialize_entry(&format!("#{letter}"), values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Map::deserialize(deserializer)?;
        let mut filter = Filter::default();
        for (key, value) in raw {
            match key.as_str() {
                "ids" => filter.ids = Some(string_vec::<D>(&key, &value)?),
                "authors" => filter.authors = Some(string_vec::<D>(&key, &value)?),
                "kinds" => {
                    let arr = value
                        .as_array()
                        .ok_or_else(|| D::Error::custom(format!("{key} must be an array")))?;
                    let mut kinds = Vec::with_capacity(arr.len());
                    for v in arr {
                        let k = v
                            .as_u64()
                            .ok_or_else(|| D::Error::custom("kinds must be non-negative"))?;
                        kinds.push(k as u32);
                    }
                    filter.kinds = Some(kinds);
                }
                "since" => filter.since = Some(number::<D>(&key, &value)?),
                "until" => filter.until = Some(number::<D>(&key, &value)?),
                "limit" => filter.limit = Some(number::<D>(&key, &value)?),
                _ => {
                    if let Some(letter) = key.strip_prefix('#') {
                        filter
                            .tags
                            .insert(letter.to_string(), string_vec::<D>(&key, &value)?);
                    }
                    // unknown keys are ignored
                }
            }
        }
        Ok(filter)
    }
}

fn string_vec<'de, D: Deserializer<'de>>(key: &str, value: &Value) -> Result<Vec<String>, D::Error> {
    let arr = value
        .as_array()
        .ok_or_else(|| D::Error::custom(format!("{key} must be an array")))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| D::Error::custom(format!("{key} must contain strings")))
        })
        .collect()
}

fn number<'de, D: Deserializer<'de>>(key: &str, value: &Value) -> Result<u64, D::Error> {
    value
        .as_u64()
        .ok_or_else(|| D::Error::custom(format!("{key} must be a non-negative number")))
}

/// A client subscription: an id plus one or more filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
}

impl Subscription {
    /// A subscription matches when any of its filters matches.
    pub fn matches(&self, ev: &Event) -> bool {
        self.filters.iter().any(|f| f.matches(ev))
    }
}
