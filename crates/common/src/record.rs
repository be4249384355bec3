//! The record-store contract the engine consumes. The engine never talks to
//! a concrete database directly — it only ever calls through this trait, so
//! that the real record store (owned by a sibling service in the host
//! application) can be swapped in without touching engine code.

use anyhow::Result;

/// A persisted entity. All engine entities (`Image`, `Container`,
/// `ContainerLog`, `ContainerStat`, `Volume`) implement this so the generic
/// record-store operations can be written once.
pub trait Record: Clone + Send + Sync {
    fn id(&self) -> &str;
    fn owner(&self) -> &str;
    fn created_at(&self) -> i64;
    fn set_created_at(&mut self, ts: i64);
    fn updated_at(&self) -> i64;
    fn set_updated_at(&mut self, ts: i64);
}

/// Generic, typed record-store operations (spec §6.1).
pub trait RecordStore<T: Record>: Send + Sync {
    /// `FindById[T](id) -> T | NotFound`
    fn find_by_id(&self, id: &str) -> Result<Option<T>>;

    /// `FindByFilter[T](predicate) -> T | NotFound`
    fn find_by_filter(&self, predicate: &dyn Fn(&T) -> bool) -> Result<Option<T>>;

    /// `FindAllByFilter[T](predicate) -> []T`
    fn find_all_by_filter(&self, predicate: &dyn Fn(&T) -> bool) -> Result<Vec<T>>;

    /// `CountRecords[T](predicate) -> int`
    fn count_records(&self, predicate: &dyn Fn(&T) -> bool) -> Result<u64>;

    /// `SaveRecord(record) -> ok | Error` — creates if new, updates
    /// otherwise; refreshes `created`/`updated` timestamps.
    fn save_record(&self, record: &mut T) -> Result<()>;

    /// `DeleteById[T](id) -> ok | NotFound`
    fn delete_by_id(&self, id: &str) -> Result<bool>;
}

/// Current unix-epoch milliseconds, used to stamp `created`/`updated`.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}
