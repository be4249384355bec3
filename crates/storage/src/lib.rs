//! Storage primitives: a key-value abstraction over an embedded database,
//! and a generic record store built on top of it implementing the
//! typed document-store contract the engine consumes (`common::RecordStore`).

mod kv;
mod record_store;

pub use kv::{DefaultKeyValueStorage, KeyValueStorage, MemoryKeyValueStorage};
pub use record_store::TypedRecordStore;
