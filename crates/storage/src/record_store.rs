//! A generic record store implementing the six operations of spec §6.1 on
//! top of a [`KeyValueStorage`] backend. The engine is only ever handed a
//! `dyn RecordStore<T>` — this type is the concrete stand-in used in place
//! of the externally-owned document database.

use crate::kv::KeyValueStorage;
use anyhow::Result;
use common::{now_millis, Record, RecordStore};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;

/// Wraps a [`KeyValueStorage`] backend, namespacing every key under
/// `<prefix>/<id>` so multiple record types can share one underlying store.
pub struct TypedRecordStore<S, T> {
    storage: S,
    prefix: &'static str,
    _marker: PhantomData<T>,
}

impl<S, T> TypedRecordStore<S, T> {
    pub fn new(storage: S, prefix: &'static str) -> Self {
        Self {
            storage,
            prefix,
            _marker: PhantomData,
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}/{}", self.prefix, id)
    }
}

impl<S, T> RecordStore<T> for TypedRecordStore<S, T>
where
    S: KeyValueStorage + Send + Sync,
    T: Record + Serialize + DeserializeOwned,
{
    fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        self.storage.get(self.key(id))
    }

    fn find_by_filter(&self, predicate: &dyn Fn(&T) -> bool) -> Result<Option<T>> {
        let all: Vec<T> = self.storage.scan_prefix(format!("{}/", self.prefix).as_bytes())?;
        Ok(all.into_iter().find(|r| predicate(r)))
    }

    fn find_all_by_filter(&self, predicate: &dyn Fn(&T) -> bool) -> Result<Vec<T>> {
        let all: Vec<T> = self.storage.scan_prefix(format!("{}/", self.prefix).as_bytes())?;
        Ok(all.into_iter().filter(|r| predicate(r)).collect())
    }

    fn count_records(&self, predicate: &dyn Fn(&T) -> bool) -> Result<u64> {
        Ok(self.find_all_by_filter(predicate)?.len() as u64)
    }

    fn save_record(&self, record: &mut T) -> Result<()> {
        let now = now_millis();
        if record.created_at() == 0 {
            record.set_created_at(now);
        }
        record.set_updated_at(now);
        self.storage.insert(self.key(record.id()), &*record)?;
        Ok(())
    }

    fn delete_by_id(&self, id: &str) -> Result<bool> {
        self.storage.remove(self.key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKeyValueStorage;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        id: String,
        owner: String,
        created: i64,
        updated: i64,
        name: String,
    }

    impl Record for Widget {
        fn id(&self) -> &str {
            &self.id
        }
        fn owner(&self) -> &str {
            &self.owner
        }
        fn created_at(&self) -> i64 {
            self.created
        }
        fn set_created_at(&mut self, ts: i64) {
            self.created = ts;
        }
        fn updated_at(&self) -> i64 {
            self.updated
        }
        fn set_updated_at(&mut self, ts: i64) {
            self.updated = ts;
        }
    }

    fn store() -> TypedRecordStore<MemoryKeyValueStorage, Widget> {
        TypedRecordStore::new(MemoryKeyValueStorage::default(), "widget")
    }

    #[test]
    fn save_then_find() -> Result<()> {
        let store = store();
        let mut w = Widget {
            id: "1".into(),
            owner: "alice".into(),
            created: 0,
            updated: 0,
            name: "foo".into(),
        };
        store.save_record(&mut w)?;
        assert!(w.created_at() > 0);
        assert_eq!(w.created_at(), w.updated_at());

        let found = store.find_by_id("1")?.expect("present");
        assert_eq!(found.name, "foo");
        Ok(())
    }

    #[test]
    fn filter_and_count() -> Result<()> {
        let store = store();
        for (id, owner) in [("1", "alice"), ("2", "alice"), ("3", "bob")] {
            let mut w = Widget {
                id: id.into(),
                owner: owner.into(),
                created: 0,
                updated: 0,
                name: "x".into(),
            };
            store.save_record(&mut w)?;
        }

        let alices = store.find_all_by_filter(&|w: &Widget| w.owner == "alice")?;
        assert_eq!(alices.len(), 2);
        assert_eq!(store.count_records(&|w: &Widget| w.owner == "bob")?, 1);
        Ok(())
    }

    #[test]
    fn delete() -> Result<()> {
        let store = store();
        let mut w = Widget {
            id: "1".into(),
            owner: "alice".into(),
            created: 0,
            updated: 0,
            name: "foo".into(),
        };
        store.save_record(&mut w)?;
        assert!(store.delete_by_id("1")?);
        assert!(store.find_by_id("1")?.is_none());
        assert!(!store.delete_by_id("1")?);
        Ok(())
    }
}
