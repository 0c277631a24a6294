//! SQLite-backed catalog
//!
//! Records live in `entities`; `entity_refs` mirrors each record's references
//! so cascading deletes can walk referrers through an index. Keys are stored
//! as JSON arrays, so key components may contain any character.

use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{validate_batch, Catalog, Record};
use crate::error::IngestError;
use crate::types::{EntityKey, EntityKind, Reference};

pub const CATALOG_SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl ToSql for EntityKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EntityKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        EntityKind::parse(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown entity kind '{}'", text).into()))
    }
}

impl ToSql for EntityKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let text = serde_json::to_string(self.parts())
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(text))
    }
}

impl FromSql for EntityKey {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        serde_json::from_str::<Vec<String>>(value.as_str()?)
            .map(EntityKey::new)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Catalog persisted in a SQLite database file
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, IngestError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> Result<Self, IngestError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn schema_version(&self) -> Result<i64, IngestError> {
        Ok(schema_version(&self.lock())?)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

fn migrate(conn: &mut Connection) -> Result<(), IngestError> {
    let mut version = schema_version(conn)?;
    if version > CATALOG_SCHEMA_VERSION {
        return Err(IngestError::UnsupportedSchemaVersion {
            found: version,
            supported: CATALOG_SCHEMA_VERSION,
        });
    }
    if version == CATALOG_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    while version < CATALOG_SCHEMA_VERSION {
        version += 1;
        apply_migration(&tx, version)?;
        log::debug!("catalog schema migrated to version {}", version);
    }
    tx.pragma_update(None, "user_version", CATALOG_SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i64) -> rusqlite::Result<()> {
    match version {
        1 => tx.execute_batch(include_str!("migrations/0001_entities.sql")),
        _ => Ok(()),
    }
}

fn exists_in(conn: &Connection, kind: EntityKind, key: &EntityKey) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM entities WHERE kind = ?1 AND entity_key = ?2",
        params![kind, key],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

fn decode_row(kind: EntityKind, key: EntityKey, refs: &str, attributes: &str) -> Result<Record, IngestError> {
    Ok(Record {
        kind,
        key,
        refs: serde_json::from_str::<Vec<Reference>>(refs)?,
        attributes: serde_json::from_str(attributes)?,
    })
}

impl Catalog for SqliteCatalog {
    fn exists(&self, kind: EntityKind, key: &EntityKey) -> Result<bool, IngestError> {
        Ok(exists_in(&self.lock(), kind, key)?)
    }

    fn get(&self, kind: EntityKind, key: &EntityKey) -> Result<Option<Record>, IngestError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT refs_json, attributes_json FROM entities WHERE kind = ?1 AND entity_key = ?2",
                params![kind, key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        row.map(|(refs, attributes)| decode_row(kind, key.clone(), &refs, &attributes))
            .transpose()
    }

    fn keys(&self, kind: EntityKind) -> Result<Vec<EntityKey>, IngestError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT entity_key FROM entities WHERE kind = ?1")?;
        let mut keys = stmt
            .query_map(params![kind], |row| row.get::<_, EntityKey>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        keys.sort();
        Ok(keys)
    }

    fn insert_all(&self, records: Vec<Record>) -> Result<(), IngestError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        validate_batch(&records, |kind, key| Ok(exists_in(&tx, kind, key)?))?;

        let inserted_at = Utc::now().to_rfc3339();
        for record in &records {
            let refs_json = serde_json::to_string(&record.refs)?;
            let attributes_json = serde_json::to_string(&record.attributes)?;
            let result = tx.execute(
                "INSERT INTO entities (kind, entity_key, refs_json, attributes_json, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![record.kind, record.key, refs_json, attributes_json, inserted_at],
            );
            match result {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    return Err(IngestError::DuplicateKey {
                        kind: record.kind,
                        key: record.key.clone(),
                    })
                }
                Err(err) => return Err(err.into()),
            }

            for reference in &record.refs {
                tx.execute(
                    "INSERT OR IGNORE INTO entity_refs (kind, entity_key, ref_kind, ref_key)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![record.kind, record.key, reference.kind, reference.key],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn delete(&self, kind: EntityKind, key: &EntityKey) -> Result<usize, IngestError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut pending = vec![(kind, key.clone())];
        let mut removed = 0;

        while let Some((kind, key)) = pending.pop() {
            let deleted = tx.execute(
                "DELETE FROM entities WHERE kind = ?1 AND entity_key = ?2",
                params![kind, key],
            )?;
            if deleted == 0 {
                continue;
            }
            removed += deleted;

            {
                let mut stmt = tx.prepare(
                    "SELECT kind, entity_key FROM entity_refs WHERE ref_kind = ?1 AND ref_key = ?2",
                )?;
                let referrers = stmt
                    .query_map(params![kind, key], |row| {
                        Ok((row.get::<_, EntityKind>(0)?, row.get::<_, EntityKey>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                pending.extend(referrers);
            }

            tx.execute(
                "DELETE FROM entity_refs WHERE (kind = ?1 AND entity_key = ?2)
                    OR (ref_kind = ?1 AND ref_key = ?2)",
                params![kind, key],
            )?;
        }

        tx.commit()?;
        Ok(removed)
    }

    fn query(
        &self,
        kind: EntityKind,
        predicate: &dyn Fn(&Record) -> bool,
    ) -> Result<Vec<Record>, IngestError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT entity_key, refs_json, attributes_json FROM entities WHERE kind = ?1",
        )?;
        let rows = stmt
            .query_map(params![kind], |row| {
                Ok((
                    row.get::<_, EntityKey>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut records = Vec::new();
        for (key, refs, attributes) in rows {
            let record = decode_row(kind, key, &refs, &attributes)?;
            if predicate(&record) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::contract;
    use crate::types::LookupTable;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_first_writer_wins() {
        contract::first_writer_wins(&SqliteCatalog::open_in_memory().unwrap());
    }

    #[test]
    fn test_rejects_dangling_reference() {
        contract::rejects_dangling_reference(&SqliteCatalog::open_in_memory().unwrap());
    }

    #[test]
    fn test_batch_is_atomic() {
        contract::batch_is_atomic(&SqliteCatalog::open_in_memory().unwrap());
    }

    #[test]
    fn test_delete_cascades() {
        contract::delete_cascades(&SqliteCatalog::open_in_memory().unwrap());
    }

    #[test]
    fn test_query_filters_by_predicate() {
        contract::query_filters_by_predicate(&SqliteCatalog::open_in_memory().unwrap());
    }

    #[test]
    fn test_keys_with_separator_survive() {
        contract::keys_with_separator_survive(&SqliteCatalog::open_in_memory().unwrap());
    }

    #[test]
    fn test_reopen_keeps_records_and_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.sqlite");
        let record = Record {
            kind: EntityKind::Lookup(LookupTable::Device),
            key: EntityKey::from(vec!["Multiclamp 700B"]),
            refs: vec![],
            attributes: json!({ "table": "device", "value": "Multiclamp 700B" }),
        };

        {
            let catalog = SqliteCatalog::open(&path).unwrap();
            assert_eq!(catalog.schema_version().unwrap(), CATALOG_SCHEMA_VERSION);
            catalog.insert(record.clone()).unwrap();
        }

        let catalog = SqliteCatalog::open(&path).unwrap();
        assert_eq!(catalog.get(record.kind, &record.key).unwrap(), Some(record));
    }

    #[test]
    fn test_rejects_newer_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.sqlite");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", CATALOG_SCHEMA_VERSION + 1)
                .unwrap();
        }
        assert!(matches!(
            SqliteCatalog::open(&path),
            Err(IngestError::UnsupportedSchemaVersion { .. })
        ));
    }
}
