//! Trial segments
//!
//! A segmented kind has one key per (acquisition, trial of the acquisition's
//! session) pair. Each work item loads its acquisition stream once and cuts
//! it against every pending trial window.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

use crate::catalog::{Catalog, Record};
use crate::error::IngestError;
use crate::population::{Commit, KeyOutcome, MakeContext, Populator, WorkItem};
use crate::segmentation::segment;
use crate::types::{EntityKey, EntityKind, SessionKey, TimeSeries, Trial, TrialSegment};

use super::leaf;

/// Slices acquisitions of one kind by trial windows
#[derive(Debug, Clone, Copy)]
pub struct SegmentPopulator {
    kind: EntityKind,
    source: EntityKind,
}

impl SegmentPopulator {
    /// `None` unless `kind` is one of the segmented kinds
    pub fn new(kind: EntityKind) -> Option<Self> {
        kind.segment_source().map(|source| Self { kind, source })
    }

    pub fn source(&self) -> EntityKind {
        self.source
    }
}

/// The stream of any acquisition record, whatever its kind
#[derive(Deserialize)]
struct AcquisitionView {
    series: TimeSeries,
}

fn session_trials(catalog: &dyn Catalog, session: &EntityKey) -> Result<Vec<Record>, IngestError> {
    catalog.query(EntityKind::Trial, &|record: &Record| {
        record.key.parts().len() == session.parts().len() + 1 && record.key.starts_with(session)
    })
}

impl Populator for SegmentPopulator {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn key_source(&self, catalog: &dyn Catalog) -> Result<Vec<WorkItem>, IngestError> {
        let mut trials_by_session: HashMap<EntityKey, Vec<String>> = HashMap::new();
        let mut items = Vec::new();

        for acquisition in catalog.keys(self.source)? {
            let session = SessionKey::from_entity_key(&acquisition)?.entity_key();
            if !trials_by_session.contains_key(&session) {
                let ids = session_trials(catalog, &session)?
                    .iter()
                    .map(|record| leaf(&record.key).map(str::to_string))
                    .collect::<Result<Vec<_>, _>>()?;
                trials_by_session.insert(session.clone(), ids);
            }

            let keys: Vec<EntityKey> = trials_by_session
                .get(&session)
                .map(|ids| ids.iter().map(|id| acquisition.child(id.as_str())).collect())
                .unwrap_or_default();
            if !keys.is_empty() {
                items.push(WorkItem::new(acquisition, keys));
            }
        }

        Ok(items)
    }

    fn make(&self, item: &WorkItem, ctx: &MakeContext<'_>) -> Result<Vec<KeyOutcome>, IngestError> {
        let acquisition = &item.parent;
        let record = ctx
            .catalog
            .get(self.source, acquisition)?
            .ok_or_else(|| IngestError::ForeignKeyViolation {
                kind: self.kind,
                key: acquisition.clone(),
                parent_kind: self.source,
                parent_key: acquisition.clone(),
            })?;
        let view = AcquisitionView::deserialize(&record.attributes)?;
        let series = view.series;

        let session = SessionKey::from_entity_key(acquisition)?;
        let trials: BTreeMap<String, Trial> = session_trials(ctx.catalog, &session.entity_key())?
            .iter()
            .map(|record| record.decode::<Trial>().map(|t| (t.trial_id.clone(), t)))
            .collect::<Result<_, _>>()?;

        let outcomes = item
            .keys
            .iter()
            .map(|key| {
                let outcome = leaf(key).and_then(|trial_id| {
                    let trial = trials.get(trial_id).ok_or_else(|| IngestError::ForeignKeyViolation {
                        kind: self.kind,
                        key: key.clone(),
                        parent_kind: EntityKind::Trial,
                        parent_key: session.entity_key().child(trial_id),
                    })?;

                    let cut = segment(series.values.view(), &series.timestamps, trial.window());
                    let row = TrialSegment {
                        segment_kind: self.kind,
                        acquisition_kind: self.source,
                        acquisition: acquisition.clone(),
                        session: session.clone(),
                        trial_id: trial.trial_id.clone(),
                        index_start: cut.range.start,
                        index_end: cut.range.end,
                        timestamps: cut.timestamps,
                        values: cut.values,
                    };
                    Ok(Commit {
                        key: key.clone(),
                        records: vec![Record::from_entity(&row)?],
                    })
                });
                (key.clone(), outcome)
            })
            .collect();

        log::debug!(
            "segmented {} {} against {} trials",
            self.source,
            acquisition,
            item.keys.len()
        );
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogExt, MemoryCatalog};
    use crate::config::IngestConfig;
    use crate::reference::{register_manifest, RegistrationManifest};
    use crate::types::{BehaviorAcquisition, Entity, TrialOutcome, TrialSet, TrialStatus};
    use chrono::NaiveDate;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    fn session() -> SessionKey {
        let time = NaiveDate::from_ymd_opt(2017, 5, 12)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        SessionKey::new("ANM244028", time)
    }

    fn trial(id: &str, start: f64, stop: f64) -> Trial {
        Trial {
            session: session(),
            trial_id: id.to_string(),
            start_time: start,
            stop_time: stop,
            cue_start_time: None,
            cue_end_time: None,
            pole_in_time: None,
            pole_out_time: None,
            trial_type: "Lick L trial".to_string(),
            stim_present: false,
            outcome: TrialOutcome::Correct,
            status: TrialStatus::Good,
        }
    }

    fn catalog() -> MemoryCatalog {
        let manifest: RegistrationManifest = serde_json::from_str(
            r#"{
                "lookups": [{"table": "behavioral_type", "value": "lick_trace"}],
                "subjects": [{"subject_id": "ANM244028", "species": "Mus musculus", "strain": "C57BL6"}],
                "sessions": [{"subject_id": "ANM244028", "session_time": "2017-05-12T10:30:00"}]
            }"#,
        )
        .unwrap();
        let catalog = MemoryCatalog::new();
        register_manifest(&catalog, &manifest).unwrap();

        let trials = vec![
            trial("trial_001", 0.0, 1.0),
            trial("trial_002", 2.0, 3.0),
            trial("trial_003", 5.0, 6.0),
        ];
        let mut records = vec![Record::from_entity(&TrialSet {
            session: session(),
            n_trials: trials.len(),
            flags: Vec::new(),
        })
        .unwrap()];
        records.extend(trials.iter().map(|t| Record::from_entity(t).unwrap()));
        catalog.insert_all(records).unwrap();

        catalog
            .insert_entity(&BehaviorAcquisition {
                session: session(),
                behavioral_type: "lick_trace".to_string(),
                series: TimeSeries {
                    timestamps: vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.5],
                    values: array![
                        [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
                        [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
                    ],
                },
            })
            .unwrap();
        catalog
    }

    #[test]
    fn test_new_only_for_segmented_kinds() {
        assert!(SegmentPopulator::new(EntityKind::TrialSet).is_none());
        let populator = SegmentPopulator::new(EntityKind::TrialBehavior).unwrap();
        assert_eq!(populator.source(), EntityKind::BehaviorAcquisition);
    }

    #[test]
    fn test_segments_every_trial_of_the_session() {
        let catalog = catalog();
        let config = IngestConfig::default();
        let ctx = MakeContext::new(&catalog, &config);
        let populator = SegmentPopulator::new(EntityKind::TrialBehavior).unwrap();

        let items = populator.key_source(&catalog).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].keys.len(), 3);

        let outcomes = populator.make(&items[0], &ctx).unwrap();
        let segments: Vec<TrialSegment> = outcomes
            .iter()
            .map(|(_, outcome)| outcome.as_ref().unwrap().records[0].decode().unwrap())
            .collect();

        assert_eq!(segments[0].timestamps, vec![0.0, 0.5, 1.0]);
        assert_eq!(segments[0].values.shape(), &[2, 3]);
        assert_eq!(segments[1].timestamps, vec![2.0, 2.5]);
        assert_eq!((segments[1].index_start, segments[1].index_end), (4, 6));
        assert!(segments[2].is_empty());
        assert_eq!(segments[2].values.shape(), &[2, 0]);
        assert_eq!(segments[2].kind(), EntityKind::TrialBehavior);
    }
}
