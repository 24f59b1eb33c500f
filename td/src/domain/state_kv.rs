//! StateKv: a small string-keyed persistent map for scheduler cursors.
//!
//! Backs the `backlog_imported:<path>` idempotence gate and any future
//! "last seed mode index" style cursor. One row per key, collection-indexed
//! on the key itself so `Store::get::<StateKv>(key)` is a direct lookup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use taskstore::{IndexValue, Record, now_ms};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateKv {
    pub key: String,
    pub value: String,
    pub updated_at: i64,
}

impl StateKv {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            updated_at: now_ms(),
        }
    }
}

impl Record for StateKv {
    fn id(&self) -> &str {
        &self.key
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "state_kv"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        HashMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_doubles_as_record_id() {
        let kv = StateKv::new("backlog_imported:/repo", "true");
        assert_eq!(kv.id(), "backlog_imported:/repo");
    }
}
