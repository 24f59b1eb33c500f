//! taskstore - generic persistent state management with SQLite+JSONL+Git integration.
//!
//! Every collection is append-only JSONL on disk (one file per `Record::collection_name`,
//! human-diffable and safe to commit alongside a repository) with a SQLite-backed index
//! rebuilt from the JSONL on open. The index is what makes filtered queries and the
//! atomic conditional update (`Store::compare_and_set`) fast and safe across processes.

mod error;
mod filter;
mod id;
mod record;
mod store;

pub use error::StoreError;
pub use filter::{Filter, FilterOp};
pub use id::{generate_id, now_ms};
pub use record::{IndexValue, Record};
pub use store::Store;

pub type Result<T> = std::result::Result<T, StoreError>;
