use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::record::{IndexValue, Record};
use crate::Result;

/// A generic record store: JSONL on disk is the durable source of truth (one
/// file per collection, append-only, safe to `git add`), SQLite is a rebuildable
/// index over it used for filtered queries and the atomic conditional update
/// that backs the dispatch lock.
///
/// A JSONL row looks like `{"id": "...", "updated_at": 123, "deleted": false, "data": {...}}`.
/// Replaying a collection's file in order and keeping the last row per id
/// (by file order, which is append order) reconstructs current state.
pub struct Store {
    dir: PathBuf,
    conn: Connection,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct JsonlRow {
    id: String,
    updated_at: i64,
    #[serde(default)]
    deleted: bool,
    data: serde_json::Value,
}

impl Store {
    /// Open (creating if necessary) a store rooted at `dir`. Every collection's
    /// JSONL file under `dir` is replayed into a fresh in-memory-backed SQLite
    /// connection on open; the index is never itself the durable copy.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            CREATE TABLE fields (
                collection TEXT NOT NULL,
                record_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL
            );
            CREATE INDEX idx_fields_lookup ON fields (collection, key, value);
            ",
        )?;

        let store = Self { dir, conn };
        debug!(dir = %store.dir.display(), "Store::open: opened");
        Ok(store)
    }

    fn jsonl_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.jsonl"))
    }

    /// Replay a collection's JSONL file into the SQLite index. Returns the
    /// number of live (non-deleted) records after replay. Called once per
    /// `Record` type right after `open`, and again by `sync()` to pick up
    /// out-of-band edits to the JSONL files.
    pub fn rebuild_indexes<T: Record>(&mut self) -> Result<usize> {
        let collection = T::collection_name();
        let path = self.jsonl_path(collection);

        self.conn.execute("DELETE FROM records WHERE collection = ?1", [collection])?;
        self.conn.execute("DELETE FROM fields WHERE collection = ?1", [collection])?;

        if !path.exists() {
            return Ok(0);
        }

        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let mut latest: std::collections::HashMap<String, JsonlRow> = std::collections::HashMap::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonlRow>(&line) {
                Ok(row) => {
                    latest
                        .entry(row.id.clone())
                        .and_modify(|existing| {
                            if row.updated_at >= existing.updated_at {
                                *existing = clone_row(&row);
                            }
                        })
                        .or_insert(row);
                }
                Err(e) => {
                    warn!(collection, error = %e, "rebuild_indexes: skipping malformed JSONL line");
                }
            }
        }

        let tx = self.conn.transaction()?;
        let mut count = 0;
        for row in latest.values() {
            if row.deleted {
                continue;
            }
            let record: T = serde_json::from_value(row.data.clone())?;
            insert_record(&tx, collection, &record)?;
            count += 1;
        }
        tx.commit()?;

        debug!(collection, count, "rebuild_indexes: replayed JSONL into index");
        Ok(count)
    }

    /// Re-read every collection's JSONL file that has already been indexed at
    /// least once is not tracked generically (the store doesn't know every
    /// `Record` type in existence); callers call `rebuild_indexes::<T>()` per
    /// type. `sync` exists as a thin, type-erased convenience for recovery
    /// flows that only need to know "has anything changed on disk" without
    /// caring about a specific collection — it is a no-op placeholder hook
    /// that callers combine with their own per-type `rebuild_indexes` calls.
    pub async fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn append_row(&self, collection: &str, row: &JsonlRow) -> Result<()> {
        let path = self.jsonl_path(collection);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.lock_exclusive()?;
        let line = serde_json::to_string(row)?;
        let result = writeln!(file, "{line}");
        FileExt::unlock(&file)?;
        result?;
        Ok(())
    }

    /// Create a new record. Fails with `ConditionFailed` if the id already
    /// exists (creation is not an upsert).
    pub fn create<T: Record>(&mut self, record: T) -> Result<T> {
        let collection = T::collection_name();
        let exists: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM records WHERE collection = ?1 AND id = ?2)",
                rusqlite::params![collection, record.id()],
                |row| row.get(0),
            )?;
        if exists {
            return Err(StoreError::ConditionFailed {
                collection,
                id: record.id().to_string(),
            });
        }

        let tx = self.conn.transaction()?;
        insert_record(&tx, collection, &record)?;
        tx.commit()?;

        self.append_row(
            collection,
            &JsonlRow {
                id: record.id().to_string(),
                updated_at: record.updated_at(),
                deleted: false,
                data: serde_json::to_value(&record)?,
            },
        )?;

        Ok(record)
    }

    /// Replace an existing record (last-write-wins, keyed on `updated_at`).
    pub fn update<T: Record>(&mut self, record: T) -> Result<T> {
        let collection = T::collection_name();

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            rusqlite::params![collection, record.id()],
        )?;
        tx.execute(
            "DELETE FROM fields WHERE collection = ?1 AND record_id = ?2",
            rusqlite::params![collection, record.id()],
        )?;
        insert_record(&tx, collection, &record)?;
        tx.commit()?;

        self.append_row(
            collection,
            &JsonlRow {
                id: record.id().to_string(),
                updated_at: record.updated_at(),
                deleted: false,
                data: serde_json::to_value(&record)?,
            },
        )?;

        Ok(record)
    }

    /// Fetch a single record by id.
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        let collection = T::collection_name();
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                rusqlite::params![collection, id],
                |row| row.get(0),
            )
            .ok();

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Delete a record. Appends a tombstone row to the JSONL file so replay
    /// on the next `rebuild_indexes` correctly omits it.
    pub fn delete<T: Record>(&mut self, id: &str) -> Result<()> {
        let collection = T::collection_name();
        self.conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            rusqlite::params![collection, id],
        )?;
        self.conn.execute(
            "DELETE FROM fields WHERE collection = ?1 AND record_id = ?2",
            rusqlite::params![collection, id],
        )?;
        self.append_row(
            collection,
            &JsonlRow {
                id: id.to_string(),
                updated_at: crate::id::now_ms(),
                deleted: true,
                data: serde_json::Value::Null,
            },
        )?;
        Ok(())
    }

    /// List records matching every filter (AND semantics), ordered by id
    /// ascending — matching the dispatcher's and integration coordinator's
    /// required "id ascending, oldest first" fetch order.
    pub fn list<T: Record>(&self, filters: &[crate::filter::Filter]) -> Result<Vec<T>> {
        let collection = T::collection_name();
        let mut sql = String::from("SELECT data FROM records WHERE collection = :collection");
        for (i, f) in filters.iter().enumerate() {
            let (clause, _) = f.to_sql(i);
            sql.push_str(" AND ");
            sql.push_str(&clause);
        }
        sql.push_str(" ORDER BY id ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut named: Vec<(String, String)> = vec![(":collection".to_string(), collection.to_string())];
        for (i, f) in filters.iter().enumerate() {
            named.push((format!(":k{i}"), f.field.clone()));
            named.push((format!(":f{i}"), f.value.as_sql()));
        }
        let params: Vec<(&str, &dyn rusqlite::ToSql)> = named.iter().map(|(k, v)| (k.as_str(), v as &dyn rusqlite::ToSql)).collect();

        let rows = stmt.query_map(params.as_slice(), |row| {
            let data: String = row.get(0)?;
            Ok(data)
        })?;

        let mut out = Vec::new();
        for row in rows {
            let json = row?;
            out.push(serde_json::from_str(&json)?);
        }
        Ok(out)
    }

    /// Atomic conditional update: the core primitive backing the
    /// `dispatched_at` exactly-once dispatch lock. Reads the current record
    /// inside a transaction, calls `check`; if it returns `true`, calls
    /// `mutate` and persists the result, still inside the same transaction,
    /// before any other caller on this connection can interleave. Returns
    /// `Ok(None)` (not an error) when `check` rejects the current state —
    /// that is the expected "another worker already claimed it" outcome, not
    /// a failure.
    pub fn compare_and_set<T: Record>(
        &mut self,
        id: &str,
        check: impl FnOnce(&T) -> bool,
        mutate: impl FnOnce(&mut T),
    ) -> Result<Option<T>> {
        let collection = T::collection_name();
        let tx = self.conn.transaction()?;

        let data: Option<String> = tx
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                rusqlite::params![collection, id],
                |row| row.get(0),
            )
            .ok();

        let Some(json) = data else {
            return Err(StoreError::NotFound {
                collection,
                id: id.to_string(),
            });
        };

        let mut record: T = serde_json::from_str(&json)?;
        if !check(&record) {
            return Ok(None);
        }

        mutate(&mut record);

        tx.execute(
            "DELETE FROM fields WHERE collection = ?1 AND record_id = ?2",
            rusqlite::params![collection, id],
        )?;
        insert_record(&tx, collection, &record)?;
        tx.commit()?;

        self.append_row(
            collection,
            &JsonlRow {
                id: record.id().to_string(),
                updated_at: record.updated_at(),
                deleted: false,
                data: serde_json::to_value(&record)?,
            },
        )?;

        Ok(Some(record))
    }
}

fn clone_row(row: &JsonlRow) -> JsonlRow {
    JsonlRow {
        id: row.id.clone(),
        updated_at: row.updated_at,
        deleted: row.deleted,
        data: row.data.clone(),
    }
}

fn insert_record<T: Record>(conn: &Connection, collection: &'static str, record: &T) -> Result<()> {
    let data = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO records (collection, id, updated_at, data) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![collection, record.id(), record.updated_at(), data],
    )?;

    for (key, value) in record.indexed_fields() {
        conn.execute(
            "INSERT INTO fields (collection, record_id, key, value) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![collection, record.id(), key, value.as_sql()],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Filter, FilterOp};
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
    struct Widget {
        id: String,
        status: String,
        updated_at: i64,
    }

    impl Record for Widget {
        fn id(&self) -> &str {
            &self.id
        }
        fn updated_at(&self) -> i64 {
            self.updated_at
        }
        fn collection_name() -> &'static str {
            "widgets"
        }
        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            let mut m = HashMap::new();
            m.insert("status".to_string(), IndexValue::String(self.status.clone()));
            m
        }
    }

    fn widget(id: &str, status: &str) -> Widget {
        Widget {
            id: id.to_string(),
            status: status.to_string(),
            updated_at: crate::id::now_ms(),
        }
    }

    #[test]
    fn create_and_get_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        store.create(widget("w-1", "pending")).unwrap();

        let fetched: Widget = store.get("w-1").unwrap().unwrap();
        assert_eq!(fetched.status, "pending");
    }

    #[test]
    fn create_rejects_duplicate_id() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        store.create(widget("w-1", "pending")).unwrap();

        let err = store.create(widget("w-1", "pending")).unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));
    }

    #[test]
    fn list_filters_by_indexed_field() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        store.create(widget("w-1", "pending")).unwrap();
        store.create(widget("w-2", "done")).unwrap();
        store.create(widget("w-3", "pending")).unwrap();

        let pending: Vec<Widget> = store
            .list(&[Filter::new("status", FilterOp::Eq, IndexValue::String("pending".into()))])
            .unwrap();

        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, "w-1");
        assert_eq!(pending[1].id, "w-3");
    }

    #[test]
    fn compare_and_set_only_applies_when_check_passes() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        store.create(widget("w-1", "pending")).unwrap();

        let claimed = store
            .compare_and_set::<Widget>("w-1", |w| w.status == "pending", |w| w.status = "running".into())
            .unwrap();
        assert!(claimed.is_some());

        // Second claim attempt must fail: status is no longer "pending".
        let second = store
            .compare_and_set::<Widget>("w-1", |w| w.status == "pending", |w| w.status = "running".into())
            .unwrap();
        assert!(second.is_none());

        let fetched: Widget = store.get("w-1").unwrap().unwrap();
        assert_eq!(fetched.status, "running");
    }

    #[test]
    fn rebuild_indexes_replays_jsonl_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = Store::open(dir.path()).unwrap();
            store.create(widget("w-1", "pending")).unwrap();
            store.update(widget("w-1", "done")).unwrap();
        }

        let mut store = Store::open(dir.path()).unwrap();
        let count = store.rebuild_indexes::<Widget>().unwrap();
        assert_eq!(count, 1);

        let fetched: Widget = store.get("w-1").unwrap().unwrap();
        assert_eq!(fetched.status, "done");
    }

    #[test]
    fn delete_tombstones_and_disappears_after_rebuild() {
        let dir = tempdir().unwrap();
        {
            let mut store = Store::open(dir.path()).unwrap();
            store.create(widget("w-1", "pending")).unwrap();
            store.delete::<Widget>("w-1").unwrap();
        }

        let mut store = Store::open(dir.path()).unwrap();
        let count = store.rebuild_indexes::<Widget>().unwrap();
        assert_eq!(count, 0);
        assert!(store.get::<Widget>("w-1").unwrap().is_none());
    }
}
