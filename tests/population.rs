//! End-to-end population over real container files, against both catalog backends

use chrono::{NaiveDate, NaiveDateTime};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

use ephys_ingest::container::DatasetValue;
use ephys_ingest::demo::{sample_session, BEHAVIORAL_TYPE};
use ephys_ingest::types::{
    BehaviorAcquisition, EntityKind, ExtracellularAcquisition, SessionKey, Trial, TrialSegment,
    TrialSet,
};
use ephys_ingest::{
    register_manifest, Catalog, CatalogExt, IngestConfig, MemoryCatalog, PopulationEngine,
    PopulationReport, RegistrationManifest, SqliteCatalog,
};

const N_TRIALS: usize = 6;

fn recorded_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2017, 5, 12)
        .unwrap()
        .and_hms_opt(10, 30, 0)
        .unwrap()
}

fn location() -> serde_json::Value {
    json!({"brain_location": "ALM", "coordinate_ref": "bregma",
           "coordinate_ap": 2.5, "coordinate_ml": 1.5, "coordinate_dv": 0.8})
}

/// Two sessions of one subject; only the first has a raw file
fn manifest() -> RegistrationManifest {
    let recorded = "2017-05-12T10:30:00";
    serde_json::from_value(json!({
        "lookups": [
            {"table": "brain_location", "value": "ALM"},
            {"table": "coordinate_reference", "value": "bregma"},
            {"table": "device", "value": "Multiclamp 700B"},
            {"table": "device", "value": "NeuroNexus A4x8"},
            {"table": "device", "value": "LED 470nm"},
            {"table": "behavioral_type", "value": "lick_trace"},
            {"table": "intracellular_type", "value": "membrane_potential"},
            {"table": "extracellular_type", "value": "spike_times"}
        ],
        "subjects": [
            {"subject_id": "ANM244028", "species": "Mus musculus", "strain": "C57BL6", "sex": "M"}
        ],
        "action_locations": [location()],
        "sessions": [
            {"subject_id": "ANM244028", "session_time": recorded, "experiment_types": ["behavior"]},
            {"subject_id": "ANM244028", "session_time": "2017-05-13T09:00:00"}
        ],
        "cells": [
            {"subject_id": "ANM244028", "session_time": recorded, "cell_id": "cell_1",
             "cell_type": "excitatory", "device": "Multiclamp 700B", "location": location()}
        ],
        "probe_insertions": [
            {"subject_id": "ANM244028", "session_time": recorded, "ec_id": "probe_1",
             "device": "NeuroNexus A4x8", "location": location()}
        ],
        "stimulation_sites": [
            {"subject_id": "ANM244028", "session_time": recorded, "stim_id": "photostim_1",
             "stim_type": "optical", "device": "LED 470nm", "location": location()}
        ]
    }))
    .unwrap()
}

fn prepare(dir: &Path, catalog: &dyn Catalog) -> IngestConfig {
    sample_session("ANM244028", recorded_time(), N_TRIALS)
        .write_file(dir.join("ANM244028_20170512.ephc"))
        .unwrap();
    std::fs::write(dir.join("README.txt"), "not a container").unwrap();
    register_manifest(catalog, &manifest()).unwrap();

    let mut config = IngestConfig::default();
    config.data_dir = dir.to_path_buf();
    config.workers = 3;
    config
}

fn report(reports: &[PopulationReport], kind: EntityKind) -> &PopulationReport {
    reports.iter().find(|r| r.kind == kind).unwrap()
}

fn check_full_run(catalog: &dyn Catalog) {
    let dir = TempDir::new().unwrap();
    let config = prepare(dir.path(), catalog);
    let engine = PopulationEngine::new(catalog, config);

    let first = engine.populate_all().unwrap();
    let kinds: Vec<EntityKind> = first.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, EntityKind::POPULATED.to_vec());

    let trial_sets = report(&first, EntityKind::TrialSet);
    assert_eq!((trial_sets.inserted, trial_sets.unavailable, trial_sets.failed), (1, 1, 0));
    let behavior = report(&first, EntityKind::BehaviorAcquisition);
    assert_eq!((behavior.inserted, behavior.unavailable), (1, 1));
    for kind in [
        EntityKind::IntracellularAcquisition,
        EntityKind::ExtracellularAcquisition,
        EntityKind::StimulusAcquisition,
    ] {
        assert_eq!(report(&first, kind).inserted, 1, "{}", kind);
    }
    for kind in [
        EntityKind::TrialBehavior,
        EntityKind::TrialIntracellular,
        EntityKind::TrialExtracellular,
        EntityKind::TrialStimulus,
    ] {
        let r = report(&first, kind);
        assert_eq!((r.inserted, r.failed), (N_TRIALS, 0), "{}", kind);
    }

    // The session without a raw file leaves nothing behind
    let missing = SessionKey::new(
        "ANM244028",
        NaiveDate::from_ymd_opt(2017, 5, 13)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap(),
    );
    let trials: Vec<Trial> = catalog.fetch_all(EntityKind::Trial).unwrap();
    assert_eq!(trials.len(), N_TRIALS);
    assert!(trials.iter().all(|t| t.session.session_time == recorded_time()));
    assert!(catalog
        .fetch::<TrialSet>(EntityKind::TrialSet, &missing.entity_key())
        .unwrap()
        .is_none());
    let acquisitions: Vec<BehaviorAcquisition> =
        catalog.fetch_all(EntityKind::BehaviorAcquisition).unwrap();
    assert_eq!(acquisitions.len(), 1);
    assert_eq!(acquisitions[0].behavioral_type, BEHAVIORAL_TYPE);

    let units: Vec<ExtracellularAcquisition> =
        catalog.fetch_all(EntityKind::ExtracellularAcquisition).unwrap();
    assert_eq!(units[0].channels, vec![0, 1]);
    assert_eq!(units[0].series.n_channels(), 2);

    // Every segment lies within its trial and covers all of the stream's
    // samples inside that window
    let segments: Vec<TrialSegment> = catalog.fetch_all(EntityKind::TrialBehavior).unwrap();
    let stream = &acquisitions[0].series;
    for segment in &segments {
        let trial = trials.iter().find(|t| t.trial_id == segment.trial_id).unwrap();
        let window = trial.window();
        assert!(segment.timestamps.iter().all(|&t| window.contains(t)));
        let expected = stream.timestamps.iter().filter(|&&t| window.contains(t)).count();
        assert_eq!(segment.timestamps.len(), expected);
        assert_eq!(segment.values.ncols(), expected);
        assert_eq!(
            segment.timestamps,
            stream.timestamps[segment.index_start..segment.index_end].to_vec()
        );
    }

    // A second run finds nothing to do
    let second = engine.populate_all().unwrap();
    for (before, after) in first.iter().zip(&second) {
        assert_eq!(after.inserted, 0, "{}", after.kind);
        assert_eq!(after.skipped, before.inserted, "{}", after.kind);
        assert_eq!(after.unavailable, before.unavailable, "{}", after.kind);
    }

    // Invalidating an acquisition removes its segments; the next run rebuilds both
    let key = SessionKey::new("ANM244028", recorded_time())
        .entity_key()
        .child(BEHAVIORAL_TYPE);
    let removed = engine
        .invalidate(EntityKind::BehaviorAcquisition, &key)
        .unwrap();
    assert_eq!(removed, 1 + N_TRIALS);
    assert!(catalog.keys(EntityKind::TrialBehavior).unwrap().is_empty());
    assert_eq!(catalog.keys(EntityKind::TrialIntracellular).unwrap().len(), N_TRIALS);

    let third = engine.populate_all().unwrap();
    assert_eq!(report(&third, EntityKind::BehaviorAcquisition).inserted, 1);
    assert_eq!(report(&third, EntityKind::TrialBehavior).inserted, N_TRIALS);
    assert_eq!(report(&third, EntityKind::TrialIntracellular).inserted, 0);
}

#[test]
fn test_full_run_memory_catalog() {
    check_full_run(&MemoryCatalog::new());
}

#[test]
fn test_full_run_sqlite_catalog() {
    let dir = TempDir::new().unwrap();
    let catalog = SqliteCatalog::open(dir.path().join("catalog.sqlite")).unwrap();
    check_full_run(&catalog);
}

#[test]
fn test_invalidating_a_session_cascades_to_everything_it_owns() {
    let dir = TempDir::new().unwrap();
    let catalog = MemoryCatalog::new();
    let config = prepare(dir.path(), &catalog);
    let engine = PopulationEngine::new(&catalog, config);
    engine.populate_all().unwrap();

    let session = SessionKey::new("ANM244028", recorded_time()).entity_key();
    engine.invalidate(EntityKind::Session, &session).unwrap();

    for kind in EntityKind::POPULATED {
        assert!(catalog.keys(kind).unwrap().is_empty(), "{}", kind);
    }
    assert!(catalog.keys(EntityKind::Cell).unwrap().is_empty());
    assert_eq!(catalog.keys(EntityKind::Session).unwrap().len(), 1);
}

/// A trial whose type is not registered fails the whole trial set, leaves no
/// rows behind, and succeeds once the type is registered
fn check_failed_key_rolls_back(catalog: &dyn Catalog) {
    let dir = TempDir::new().unwrap();
    let mut session = sample_session("ANM244028", recorded_time(), N_TRIALS);
    session.dataset(
        "epochs/trial_002/description",
        DatasetValue::text("Lick X trial, No stim"),
    );
    session
        .write_file(dir.path().join("ANM244028_20170512.ephc"))
        .unwrap();
    register_manifest(catalog, &manifest()).unwrap();

    let mut config = IngestConfig::default();
    config.data_dir = dir.path().to_path_buf();
    let engine = PopulationEngine::new(catalog, config);

    let first = engine.populate(EntityKind::TrialSet).unwrap();
    assert_eq!((first.inserted, first.failed), (0, 1));
    assert_eq!(first.failures[0].code, "FOREIGN_KEY_VIOLATION");
    assert!(catalog.keys(EntityKind::TrialSet).unwrap().is_empty());
    assert!(catalog.keys(EntityKind::Trial).unwrap().is_empty());

    let extra: RegistrationManifest = serde_json::from_value(json!({
        "lookups": [{"table": "trial_type", "value": "Lick X trial"}]
    }))
    .unwrap();
    register_manifest(catalog, &extra).unwrap();

    let retry = engine.populate(EntityKind::TrialSet).unwrap();
    assert_eq!((retry.inserted, retry.failed), (1, 0));
    assert_eq!(catalog.keys(EntityKind::Trial).unwrap().len(), N_TRIALS);
}

#[test]
fn test_failed_key_rolls_back_memory_catalog() {
    check_failed_key_rolls_back(&MemoryCatalog::new());
}

#[test]
fn test_failed_key_rolls_back_sqlite_catalog() {
    let dir = TempDir::new().unwrap();
    let catalog = SqliteCatalog::open(dir.path().join("catalog.sqlite")).unwrap();
    check_failed_key_rolls_back(&catalog);
}
