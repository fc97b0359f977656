//! Change cache.
//!
//! Remembers the last known field values per row and diffs incremental
//! updates against them, so a source that re-reports unchanged values does
//! not wake anybody up.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{CorrResult, CorrelatorError};
use crate::value::Value;

/// Row fields in column order. `None` means "not reported" on an update and
/// "unknown" in the cache.
pub type Row = Vec<Option<Value>>;

/// An incremental update: rows to delete and rows to upsert.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<BTreeMap<String, Row>>,
}

impl RowUpdate {
    /// Update of a single row.
    #[must_use]
    pub fn upsert(row: impl Into<String>, fields: Row) -> Self {
        Self {
            deleted: None,
            updated: Some(BTreeMap::from([(row.into(), fields)])),
        }
    }

    /// Deletion of a single row.
    #[must_use]
    pub fn delete(row: impl Into<String>) -> Self {
        Self {
            deleted: Some(vec![row.into()]),
            updated: None,
        }
    }

    #[must_use]
    pub fn with_upsert(mut self, row: impl Into<String>, fields: Row) -> Self {
        self.updated.get_or_insert_with(BTreeMap::new).insert(row.into(), fields);
        self
    }

    #[must_use]
    pub fn with_delete(mut self, row: impl Into<String>) -> Self {
        self.deleted.get_or_insert_with(Vec::new).push(row.into());
        self
    }

    /// True when the update neither deletes nor upserts anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deleted.as_ref().map_or(true, Vec::is_empty)
            && self.updated.as_ref().map_or(true, BTreeMap::is_empty)
    }
}

/// Last-known field values per row key.
#[derive(Debug, Clone, Default)]
pub struct ChangeCache {
    rows: HashMap<String, Row>,
}

impl ChangeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `update` and reports whether anything actually changed.
    ///
    /// Deletions run first and count as a change only for rows that existed.
    /// A new row is stored verbatim. For an existing row each position is
    /// overwritten only by a reported value that differs from the cached one;
    /// a longer incoming row widens the cached row first.
    pub fn apply_update(&mut self, update: Option<&RowUpdate>) -> CorrResult<bool> {
        let update = update.ok_or_else(|| CorrelatorError::missing("update"))?;
        let mut changed = false;

        if let Some(deleted) = &update.deleted {
            for key in deleted {
                changed |= self.rows.remove(key).is_some();
            }
        }

        if let Some(updated) = &update.updated {
            for (key, incoming) in updated {
                match self.rows.get_mut(key) {
                    None => {
                        self.rows.insert(key.clone(), incoming.clone());
                        changed = true;
                    }
                    Some(cached) => {
                        changed |= merge_row(cached, incoming);
                    }
                }
            }
        }

        Ok(changed)
    }

    #[must_use]
    pub fn row(&self, key: &str) -> Option<&Row> {
        self.rows.get(key)
    }

    /// Cached value of one field, if known.
    #[must_use]
    pub fn field(&self, key: &str, column: usize) -> Option<&Value> {
        self.rows.get(key)?.get(column)?.as_ref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Forgets one row without counting as a change. Returns whether the row
    /// was cached.
    pub fn evict(&mut self, key: &str) -> bool {
        self.rows.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

fn merge_row(cached: &mut Row, incoming: &Row) -> bool {
    if incoming.len() > cached.len() {
        cached.resize(incoming.len(), None);
    }

    let mut changed = false;
    for (slot, value) in cached.iter_mut().zip(incoming) {
        let Some(value) = value else {
            continue;
        };
        if slot.as_ref().is_some_and(|current| current.same_as(value)) {
            continue;
        }
        *slot = Some(value.clone());
        changed = true;
    }
    changed
}
