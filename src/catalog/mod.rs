//! Persistent entity catalog
//!
//! The catalog stores every entity as a [`Record`]: its kind, key, the
//! foreign-key references it holds, and its attributes as JSON. Backends
//! enforce three rules:
//! - keys are unique per kind and the first successful writer wins
//! - every reference must resolve, either to a stored record or to another
//!   record of the same atomic batch
//! - deleting a record deletes everything that references it, recursively

mod memory;
mod sqlite;

pub use memory::MemoryCatalog;
pub use sqlite::{SqliteCatalog, CATALOG_SCHEMA_VERSION};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::IngestError;
use crate::types::{Entity, EntityKey, EntityKind, Reference};

/// A stored entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: EntityKind,
    pub key: EntityKey,
    pub refs: Vec<Reference>,
    pub attributes: serde_json::Value,
}

impl Record {
    pub fn from_entity<E: Entity>(entity: &E) -> Result<Self, IngestError> {
        Ok(Self {
            kind: entity.kind(),
            key: entity.key(),
            refs: entity.references(),
            attributes: serde_json::to_value(entity)?,
        })
    }

    /// Decode the attributes back into a typed entity
    pub fn decode<E: Entity>(&self) -> Result<E, IngestError> {
        Ok(E::deserialize(&self.attributes)?)
    }
}

/// Storage collaborator used by registration and population
pub trait Catalog: Send + Sync {
    fn exists(&self, kind: EntityKind, key: &EntityKey) -> Result<bool, IngestError>;

    fn get(&self, kind: EntityKind, key: &EntityKey) -> Result<Option<Record>, IngestError>;

    /// All keys of one kind, in key order
    fn keys(&self, kind: EntityKind) -> Result<Vec<EntityKey>, IngestError>;

    /// Insert one record; fails with `DuplicateKey` if it exists
    fn insert(&self, record: Record) -> Result<(), IngestError> {
        self.insert_all(vec![record])
    }

    /// Insert a group of records atomically: all of them or none.
    ///
    /// Fails with `DuplicateKey` when any key already exists (or repeats in
    /// the batch) and `ForeignKeyViolation` when a reference resolves neither
    /// in the catalog nor in the batch.
    fn insert_all(&self, records: Vec<Record>) -> Result<(), IngestError>;

    /// Delete a record and, recursively, every record referencing it.
    /// Returns the number of records removed.
    fn delete(&self, kind: EntityKind, key: &EntityKey) -> Result<usize, IngestError>;

    /// Records of one kind accepted by `predicate`, in key order
    fn query(
        &self,
        kind: EntityKind,
        predicate: &dyn Fn(&Record) -> bool,
    ) -> Result<Vec<Record>, IngestError>;
}

/// Typed helpers over any [`Catalog`]
pub trait CatalogExt: Catalog {
    fn insert_entity<E: Entity>(&self, entity: &E) -> Result<(), IngestError> {
        self.insert(Record::from_entity(entity)?)
    }

    fn fetch<E: Entity>(&self, kind: EntityKind, key: &EntityKey) -> Result<Option<E>, IngestError> {
        self.get(kind, key)?.map(|record| record.decode()).transpose()
    }

    fn fetch_all<E: Entity>(&self, kind: EntityKind) -> Result<Vec<E>, IngestError> {
        self.query(kind, &|_| true)?
            .iter()
            .map(Record::decode)
            .collect()
    }
}

impl<C: Catalog + ?Sized> CatalogExt for C {}

/// Check a batch against the uniqueness and reference rules.
///
/// `exists` answers for records already stored; references may also resolve
/// to earlier or later members of the batch.
pub(crate) fn validate_batch<F>(records: &[Record], mut exists: F) -> Result<(), IngestError>
where
    F: FnMut(EntityKind, &EntityKey) -> Result<bool, IngestError>,
{
    let mut batch = BTreeSet::new();
    for record in records {
        if !batch.insert((record.kind, record.key.clone())) || exists(record.kind, &record.key)? {
            return Err(IngestError::DuplicateKey {
                kind: record.kind,
                key: record.key.clone(),
            });
        }
    }

    for record in records {
        for reference in &record.refs {
            let in_batch = batch.contains(&(reference.kind, reference.key.clone()));
            if !in_batch && !exists(reference.kind, &reference.key)? {
                return Err(IngestError::ForeignKeyViolation {
                    kind: record.kind,
                    key: record.key.clone(),
                    parent_kind: reference.kind,
                    parent_key: reference.key.clone(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share; each backend's tests call these.

    use super::*;
    use crate::types::LookupTable;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(kind: EntityKind, key: Vec<&str>, refs: Vec<Reference>) -> Record {
        Record {
            kind,
            key: EntityKey::from(key),
            refs,
            attributes: json!({ "note": "test" }),
        }
    }

    fn species() -> Record {
        record(
            EntityKind::Lookup(LookupTable::Species),
            vec!["Mus musculus"],
            vec![],
        )
    }

    fn subject(id: &str) -> Record {
        record(
            EntityKind::Subject,
            vec![id],
            vec![Reference::lookup(LookupTable::Species, "Mus musculus")],
        )
    }

    fn session(subject_id: &str) -> Record {
        record(
            EntityKind::Session,
            vec![subject_id, "2017-05-12 10:30:00"],
            vec![Reference::new(
                EntityKind::Subject,
                EntityKey::from(vec![subject_id]),
            )],
        )
    }

    pub fn first_writer_wins(catalog: &dyn Catalog) {
        catalog.insert(species()).unwrap();
        let mut second = species();
        second.attributes = json!({ "note": "later" });

        let err = catalog.insert(second).unwrap_err();
        assert!(matches!(err, IngestError::DuplicateKey { .. }));

        let stored = catalog
            .get(species().kind, &species().key)
            .unwrap()
            .unwrap();
        assert_eq!(stored.attributes, json!({ "note": "test" }));
    }

    pub fn rejects_dangling_reference(catalog: &dyn Catalog) {
        let err = catalog.insert(subject("ANM244028")).unwrap_err();
        assert!(matches!(err, IngestError::ForeignKeyViolation { .. }));
        assert!(!catalog
            .exists(EntityKind::Subject, &EntityKey::from(vec!["ANM244028"]))
            .unwrap());
    }

    pub fn batch_is_atomic(catalog: &dyn Catalog) {
        // references resolve within the batch
        catalog
            .insert_all(vec![species(), subject("ANM244028"), session("ANM244028")])
            .unwrap();
        assert_eq!(catalog.keys(EntityKind::Session).unwrap().len(), 1);

        // one bad member rejects the whole batch
        let dangling = record(
            EntityKind::Session,
            vec!["ANM000000", "2017-05-12 10:30:00"],
            vec![Reference::new(
                EntityKind::Subject,
                EntityKey::from(vec!["ANM000000"]),
            )],
        );
        let err = catalog
            .insert_all(vec![subject("ANM255200"), dangling])
            .unwrap_err();
        assert!(matches!(err, IngestError::ForeignKeyViolation { .. }));
        assert!(!catalog
            .exists(EntityKind::Subject, &EntityKey::from(vec!["ANM255200"]))
            .unwrap());

        let err = catalog
            .insert_all(vec![subject("ANM255201"), subject("ANM255201")])
            .unwrap_err();
        assert!(matches!(err, IngestError::DuplicateKey { .. }));
    }

    pub fn delete_cascades(catalog: &dyn Catalog) {
        catalog
            .insert_all(vec![
                species(),
                subject("ANM244028"),
                session("ANM244028"),
                subject("ANM255200"),
            ])
            .unwrap();

        let removed = catalog
            .delete(EntityKind::Subject, &EntityKey::from(vec!["ANM244028"]))
            .unwrap();
        assert_eq!(removed, 2);
        assert!(catalog.keys(EntityKind::Session).unwrap().is_empty());
        assert_eq!(catalog.keys(EntityKind::Subject).unwrap().len(), 1);

        let removed = catalog
            .delete(EntityKind::Subject, &EntityKey::from(vec!["missing"]))
            .unwrap();
        assert_eq!(removed, 0);
    }

    pub fn query_filters_by_predicate(catalog: &dyn Catalog) {
        catalog
            .insert_all(vec![species(), subject("ANM244028"), subject("ANM255200")])
            .unwrap();

        let found = catalog
            .query(EntityKind::Subject, &|r| r.key.parts()[0].ends_with("200"))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, EntityKey::from(vec!["ANM255200"]));
        assert_eq!(found[0].refs.len(), 1);

        let keys = catalog.keys(EntityKind::Subject).unwrap();
        assert_eq!(
            keys,
            vec![
                EntityKey::from(vec!["ANM244028"]),
                EntityKey::from(vec!["ANM255200"])
            ]
        );
    }

    pub fn keys_with_separator_survive(catalog: &dyn Catalog) {
        let strain = record(EntityKind::Lookup(LookupTable::Strain), vec!["N/A"], vec![]);
        catalog.insert(strain.clone()).unwrap();
        assert!(catalog.exists(strain.kind, &strain.key).unwrap());
        assert_eq!(catalog.keys(strain.kind).unwrap(), vec![strain.key]);
    }
}
