use std::{
    collections::BTreeMap,
    future::{self, Future},
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Error;
use storage::StorageEngine;

type Key = (Vec<u8>, Vec<u8>);

/// In-memory stand-in for `storage::StorageEngine`, used where a test
/// wants `Storage<T>` semantics without touching disk (sqlite's own engine
/// is already exercised directly by `storage`'s own test suite).
#[derive(Clone, Default)]
pub struct FakeStorageEngine {
    rows: Arc<Mutex<BTreeMap<Key, Vec<u8>>>>,
}

impl StorageEngine for FakeStorageEngine {
    fn initialize(_cache_dir: impl AsRef<Path>) -> Result<Box<Self>, Error> {
        Ok(Box::new(Self::default()))
    }

    fn get(
        &self,
        collection: impl AsRef<[u8]>,
        key: impl AsRef<[u8]>,
    ) -> Result<Option<Vec<u8>>, Error> {
        let rows = self.rows.lock().expect("lock poisoned");
        let key = (collection.as_ref().to_vec(), key.as_ref().to_vec());

        Ok(rows.get(&key).cloned())
    }

    fn put(
        &self,
        collection: impl AsRef<[u8]>,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<(), Error> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        let key = (collection.as_ref().to_vec(), key.as_ref().to_vec());

        rows.insert(key, value.as_ref().to_vec());
        Ok(())
    }

    fn compare_and_swap(
        &self,
        collection: impl AsRef<[u8]>,
        key: impl AsRef<[u8]>,
        old_value: Option<impl AsRef<[u8]>>,
        new_value: Option<impl AsRef<[u8]>>,
    ) -> Result<(), Error> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        let key = (collection.as_ref().to_vec(), key.as_ref().to_vec());

        let current = rows.get(&key).cloned();
        let old_value = old_value.map(|v| v.as_ref().to_vec());

        if current != old_value {
            anyhow::bail!("Compare and swap conflict");
        }

        match new_value {
            Some(value) => rows.insert(key, value.as_ref().to_vec()),
            None => rows.remove(&key),
        };

        Ok(())
    }

    fn remove(
        &self,
        collection: impl AsRef<[u8]>,
        key: impl AsRef<[u8]>,
    ) -> Result<(), Error> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        let key = (collection.as_ref().to_vec(), key.as_ref().to_vec());

        rows.remove(&key);
        Ok(())
    }

    fn exists(
        &self,
        collection: impl AsRef<[u8]>,
        key: impl AsRef<[u8]>,
    ) -> Result<bool, Error> {
        let rows = self.rows.lock().expect("lock poisoned");
        let key = (collection.as_ref().to_vec(), key.as_ref().to_vec());

        Ok(rows.contains_key(&key))
    }

    fn flush(&self) -> Box<dyn Future<Output = Result<usize, Error>> + Unpin> {
        let len = self.rows.lock().expect("lock poisoned").len();

        Box::new(future::ready(Ok(len)))
    }
}
