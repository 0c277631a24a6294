//! In-process catalog backed by an ordered map

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{validate_batch, Catalog, Record};
use crate::error::IngestError;
use crate::types::{EntityKey, EntityKind};

type Store = BTreeMap<(EntityKind, EntityKey), Record>;

/// Catalog held entirely in memory; one mutex serializes all writers
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    records: Mutex<Store>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Catalog for MemoryCatalog {
    fn exists(&self, kind: EntityKind, key: &EntityKey) -> Result<bool, IngestError> {
        Ok(self.lock().contains_key(&(kind, key.clone())))
    }

    fn get(&self, kind: EntityKind, key: &EntityKey) -> Result<Option<Record>, IngestError> {
        Ok(self.lock().get(&(kind, key.clone())).cloned())
    }

    fn keys(&self, kind: EntityKind) -> Result<Vec<EntityKey>, IngestError> {
        Ok(self
            .lock()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn insert_all(&self, records: Vec<Record>) -> Result<(), IngestError> {
        let mut store = self.lock();
        validate_batch(&records, |kind, key| {
            Ok(store.contains_key(&(kind, key.clone())))
        })?;
        for record in records {
            store.insert((record.kind, record.key.clone()), record);
        }
        Ok(())
    }

    fn delete(&self, kind: EntityKind, key: &EntityKey) -> Result<usize, IngestError> {
        let mut store = self.lock();
        let mut pending = vec![(kind, key.clone())];
        let mut removed = 0;

        while let Some(target) = pending.pop() {
            if store.remove(&target).is_none() {
                continue;
            }
            removed += 1;
            pending.extend(
                store
                    .values()
                    .filter(|r| r.refs.iter().any(|p| p.kind == target.0 && p.key == target.1))
                    .map(|r| (r.kind, r.key.clone())),
            );
        }

        Ok(removed)
    }

    fn query(
        &self,
        kind: EntityKind,
        predicate: &dyn Fn(&Record) -> bool,
    ) -> Result<Vec<Record>, IngestError> {
        Ok(self
            .lock()
            .values()
            .filter(|r| r.kind == kind && predicate(r))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::contract;

    #[test]
    fn test_first_writer_wins() {
        contract::first_writer_wins(&MemoryCatalog::new());
    }

    #[test]
    fn test_rejects_dangling_reference() {
        contract::rejects_dangling_reference(&MemoryCatalog::new());
    }

    #[test]
    fn test_batch_is_atomic() {
        contract::batch_is_atomic(&MemoryCatalog::new());
    }

    #[test]
    fn test_delete_cascades() {
        contract::delete_cascades(&MemoryCatalog::new());
    }

    #[test]
    fn test_query_filters_by_predicate() {
        contract::query_filters_by_predicate(&MemoryCatalog::new());
    }

    #[test]
    fn test_keys_with_separator_survive() {
        contract::keys_with_separator_survive(&MemoryCatalog::new());
    }
}
