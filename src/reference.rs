//! Reference data and manual registration
//!
//! Controlled vocabularies ship with built-in rows; everything else a lab
//! registers by hand (subjects, sessions, recording loci) arrives through a
//! JSON [`RegistrationManifest`].

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::catalog::{Catalog, Record};
use crate::error::{FailureKind, IngestError};
use crate::types::{
    ActionLocation, Cell, Entity, LookupRow, LookupTable, ProbeInsertion, Session,
    StimulationInfo, Subject,
};

/// Rows every catalog starts with
pub fn builtin_lookups() -> Vec<LookupRow> {
    let rows: [(LookupTable, &[&str]); 5] = [
        (LookupTable::ExperimentType, &["behavior", "extracellular", "photostim"]),
        (LookupTable::Species, &["Mus musculus"]),
        (LookupTable::Strain, &["C57BL6", "Ai35D", "N/A"]),
        (LookupTable::TrialType, &["Lick L trial", "Lick R trial"]),
        (LookupTable::CellType, &["excitatory", "inhibitory", "N/A"]),
    ];

    rows.iter()
        .flat_map(|(table, values)| values.iter().map(move |v| LookupRow::new(*table, *v)))
        .collect()
}

/// Manually curated entities, registered before ingestion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationManifest {
    pub lookups: Vec<LookupRow>,
    pub subjects: Vec<Subject>,
    pub action_locations: Vec<ActionLocation>,
    pub sessions: Vec<Session>,
    pub cells: Vec<Cell>,
    pub probe_insertions: Vec<ProbeInsertion>,
    pub stimulation_sites: Vec<StimulationInfo>,
}

impl RegistrationManifest {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Records in dependency order: lookups, subjects, locations, sessions, loci
    pub fn records(&self) -> Result<Vec<Record>, IngestError> {
        let mut records = Vec::new();
        push_all(&mut records, &builtin_lookups())?;
        push_all(&mut records, &self.lookups)?;
        push_all(&mut records, &self.subjects)?;
        push_all(&mut records, &self.action_locations)?;
        push_all(&mut records, &self.sessions)?;
        push_all(&mut records, &self.cells)?;
        push_all(&mut records, &self.probe_insertions)?;
        push_all(&mut records, &self.stimulation_sites)?;
        Ok(records)
    }
}

fn push_all<E: Entity>(records: &mut Vec<Record>, entities: &[E]) -> Result<(), IngestError> {
    for entity in entities {
        records.push(Record::from_entity(entity)?);
    }
    Ok(())
}

/// Outcome of a registration pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationReport {
    pub inserted: usize,
    pub existing: usize,
}

/// Register the built-in vocabularies and a manifest's entities.
///
/// Records already present are left untouched, so registering the same
/// manifest twice is a no-op. Any other failure (a dangling reference, an
/// unreachable catalog) stops registration.
pub fn register_manifest(
    catalog: &dyn Catalog,
    manifest: &RegistrationManifest,
) -> Result<RegistrationReport, IngestError> {
    let mut report = RegistrationReport::default();

    for record in manifest.records()? {
        let (kind, key) = (record.kind, record.key.clone());
        match catalog.insert(record) {
            Ok(()) => {
                log::debug!("registered {} {}", kind, key);
                report.inserted += 1;
            }
            Err(err) if err.failure_kind() == FailureKind::Duplicate => report.existing += 1,
            Err(err) => return Err(err),
        }
    }

    log::info!(
        "registration finished: {} inserted, {} already present",
        report.inserted,
        report.existing
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogExt, MemoryCatalog};
    use crate::types::{EntityKey, EntityKind};
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"{
        "lookups": [
            {"table": "brain_location", "value": "ALM"},
            {"table": "coordinate_reference", "value": "bregma"},
            {"table": "device", "value": "Multiclamp 700B"},
            {"table": "experimenter", "value": "Jane Doe"}
        ],
        "subjects": [
            {"subject_id": "ANM244028", "species": "Mus musculus", "strain": "C57BL6", "sex": "M"}
        ],
        "action_locations": [
            {"brain_location": "ALM", "coordinate_ref": "bregma",
             "coordinate_ap": 2.5, "coordinate_ml": 1.5, "coordinate_dv": 0.8}
        ],
        "sessions": [
            {"subject_id": "ANM244028", "session_time": "2017-05-12T10:30:00",
             "experimenters": ["Jane Doe"], "experiment_types": ["behavior"]}
        ],
        "cells": [
            {"subject_id": "ANM244028", "session_time": "2017-05-12T10:30:00",
             "cell_id": "cell_1", "cell_type": "excitatory", "device": "Multiclamp 700B",
             "location": {"brain_location": "ALM", "coordinate_ref": "bregma",
                          "coordinate_ap": 2.5, "coordinate_ml": 1.5, "coordinate_dv": 0.8}}
        ]
    }"#;

    #[test]
    fn test_builtin_lookups() {
        let rows = builtin_lookups();
        assert_eq!(rows.len(), 12);
        assert!(rows
            .iter()
            .any(|r| r.table == LookupTable::TrialType && r.value == "Lick R trial"));
    }

    #[test]
    fn test_register_manifest_is_idempotent() {
        let manifest: RegistrationManifest = serde_json::from_str(MANIFEST).unwrap();
        let catalog = MemoryCatalog::new();

        let first = register_manifest(&catalog, &manifest).unwrap();
        assert_eq!(first.inserted, 12 + 4 + 1 + 1 + 1 + 1);
        assert_eq!(first.existing, 0);

        let second = register_manifest(&catalog, &manifest).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.existing, first.inserted);

        let cells: Vec<Cell> = catalog.fetch_all(EntityKind::Cell).unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(
            cells[0].key(),
            EntityKey::from(vec!["ANM244028", "2017-05-12 10:30:00", "cell_1"])
        );
    }

    #[test]
    fn test_register_rejects_unknown_vocabulary() {
        let mut manifest: RegistrationManifest = serde_json::from_str(MANIFEST).unwrap();
        manifest.subjects[0].strain = "B6".to_string();

        let err = register_manifest(&MemoryCatalog::new(), &manifest).unwrap_err();
        assert!(matches!(err, IngestError::ForeignKeyViolation { .. }));
    }
}
