use std::collections::HashMap;

/// A value that can be indexed by the store's SQLite side table for filtered
/// queries. Kept deliberately small: the JSONL row is always the source of
/// truth, the index only ever holds the handful of fields a collection wants
/// to filter or sort by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl IndexValue {
    pub fn as_sql(&self) -> String {
        match self {
            IndexValue::String(s) => s.clone(),
            IndexValue::Int(i) => i.to_string(),
            IndexValue::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        }
    }
}

/// Anything persisted through `Store` implements `Record`: a stable id, an
/// update timestamp for last-write-wins JSONL replay, a collection name, and
/// the fields worth indexing for queries.
pub trait Record: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn updated_at(&self) -> i64;
    fn collection_name() -> &'static str;
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}
