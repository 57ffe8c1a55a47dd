//! Counter snapshots ("updates").
//!
//! An [`Update`] is a complete key → counter map captured at one point in
//! time. Two updates can only be compared when their key sets are identical;
//! anything else is schema drift and is reported, never papered over.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::SchemaDrift;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Update(BTreeMap<String, i64>);

impl Update {
    pub fn new(counters: BTreeMap<String, i64>) -> Self {
        Self(counters)
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn key_set(&self) -> BTreeSet<String> {
        self.0.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn as_map(&self) -> &BTreeMap<String, i64> {
        &self.0
    }

    /// Fail unless `other` has exactly our key set.
    pub fn check_keys_match(&self, other: &Update) -> Result<(), SchemaDrift> {
        check_key_set(self.0.keys(), other.0.keys())
    }

    /// Replace this snapshot with a newer one that has the same schema.
    pub fn replace(&mut self, newer: Update) -> Result<(), SchemaDrift> {
        self.check_keys_match(&newer)?;
        *self = newer;
        Ok(())
    }

    /// Key-wise `self - start`.
    pub fn diff(&self, start: &Update) -> Result<Update, SchemaDrift> {
        start.check_keys_match(self)?;
        let delta = self
            .0
            .iter()
            .map(|(k, end)| (k.clone(), end.wrapping_sub(start.0[k])))
            .collect();
        Ok(Update(delta))
    }
}

impl From<BTreeMap<String, i64>> for Update {
    fn from(map: BTreeMap<String, i64>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, const N: usize> From<[(K, i64); N]> for Update {
    fn from(pairs: [(K, i64); N]) -> Self {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Compare an expected key set against an observed one.
///
/// `missing` lists expected keys that were not observed, `unexpected` lists
/// observed keys that were not expected.
pub fn check_key_set<'a, 'b>(
    expected: impl IntoIterator<Item = &'a String>,
    observed: impl IntoIterator<Item = &'b String>,
) -> Result<(), SchemaDrift> {
    let expected: BTreeSet<&str> = expected.into_iter().map(String::as_str).collect();
    let observed: BTreeSet<&str> = observed.into_iter().map(String::as_str).collect();

    if expected == observed {
        return Ok(());
    }

    Err(SchemaDrift {
        missing: expected
            .difference(&observed)
            .map(|k| k.to_string())
            .collect(),
        unexpected: observed
            .difference(&expected)
            .map(|k| k.to_string())
            .collect(),
    })
}
