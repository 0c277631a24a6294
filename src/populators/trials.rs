//! Trial sets
//!
//! One trial set per session, committed together with all of its trials.
//! Trials come from the epochs group (one child group per trial holding
//! `description`, `start_time` and `stop_time`), decorated with the analysis
//! vectors (good trials, one-hot response matrix) and the event marker
//! timestamps.

use std::collections::BTreeSet;

use crate::catalog::{Catalog, Record};
use crate::config::ContainerLayout;
use crate::container::ContainerReader;
use crate::decoders::{decode_outcomes, split_trial_descriptor, trial_status};
use crate::error::IngestError;
use crate::population::{Commit, KeyOutcome, MakeContext, Populator, WorkItem};
use crate::types::{EntityKind, QualityFlag, SessionKey, Trial, TrialSet};

use super::load_session;

pub struct TrialSetPopulator;

impl Populator for TrialSetPopulator {
    fn kind(&self) -> EntityKind {
        EntityKind::TrialSet
    }

    fn key_source(&self, catalog: &dyn Catalog) -> Result<Vec<WorkItem>, IngestError> {
        Ok(catalog
            .keys(EntityKind::Session)?
            .into_iter()
            .map(|key| WorkItem::new(key.clone(), vec![key]))
            .collect())
    }

    fn make(&self, item: &WorkItem, ctx: &MakeContext<'_>) -> Result<Vec<KeyOutcome>, IngestError> {
        let session = load_session(ctx.catalog, self.kind(), &item.parent)?;
        let mut reader = ctx.open(&session)?;
        let (trial_set, trials) = read_trial_set(&mut reader, &session.key, &ctx.config.layout)?;

        log::info!(
            "read trial set for {}: {} trials, {} quality flags",
            session.key,
            trial_set.n_trials,
            trial_set.flags.len()
        );

        let mut records = vec![Record::from_entity(&trial_set)?];
        for trial in &trials {
            records.push(Record::from_entity(trial)?);
        }

        Ok(vec![(
            item.parent.clone(),
            Ok(Commit {
                key: item.parent.clone(),
                records,
            }),
        )])
    }
}

/// Read and validate the trial set of one session.
///
/// Trials keep the stored epoch order. A trial whose stop time is not after
/// its start time, or a repeated trial id, rejects the whole set. Overlaps
/// and misplaced or missing event markers are surfaced as quality flags.
pub fn read_trial_set(
    reader: &mut ContainerReader,
    session: &SessionKey,
    layout: &ContainerLayout,
) -> Result<(TrialSet, Vec<Trial>), IngestError> {
    let trial_ids = reader.child_names(&layout.epochs)?;
    let n = trial_ids.len();

    let good_trials = reader.read_f64_vec(&layout.good_trials)?;
    let labels = reader.read_strings(&layout.trial_type_string)?;
    let responses = reader.read_matrix(&layout.trial_type_mat)?;
    check_len(&layout.good_trials, good_trials.len(), n)?;
    check_len(&layout.trial_type_mat, responses.nrows(), n)?;
    let outcomes = decode_outcomes(&responses, &labels)?;

    let mut flags = Vec::new();
    let mut markers = Vec::new();
    for event in layout.event_names() {
        match reader.read_f64_vec(&layout.event_timestamps(event)) {
            Ok(times) => {
                if times.len() < n {
                    flags.push(QualityFlag::MissingEventMarkers {
                        event: event.to_string(),
                    });
                }
                markers.push(times);
            }
            Err(IngestError::MissingField(_)) => {
                flags.push(QualityFlag::MissingEventMarkers {
                    event: event.to_string(),
                });
                markers.push(Vec::new());
            }
            Err(err) => return Err(err),
        }
    }

    let mut seen = BTreeSet::new();
    let mut trials = Vec::with_capacity(n);
    for (idx, trial_id) in trial_ids.iter().enumerate() {
        if !seen.insert(trial_id.as_str()) {
            return Err(IngestError::InvalidTrial(format!("duplicate trial id {}", trial_id)));
        }

        let base = format!("{}/{}", layout.epochs, trial_id);
        let description = reader.read_string(&format!("{}/description", base))?;
        let start_time = reader.read_f64_scalar(&format!("{}/start_time", base))?;
        let stop_time = reader.read_f64_scalar(&format!("{}/stop_time", base))?;
        if !(stop_time > start_time) {
            return Err(IngestError::InvalidTrial(format!(
                "{}: stop time {} is not after start time {}",
                trial_id, stop_time, start_time
            )));
        }

        let (trial_type, stim_present) = split_trial_descriptor(&description)?;

        let mut event_times = [None; 4];
        for (slot, (event, times)) in event_times
            .iter_mut()
            .zip(layout.event_names().iter().zip(&markers))
        {
            let Some(&t) = times.get(idx) else { continue };
            if t.is_nan() {
                continue;
            }
            if start_time <= t && t <= stop_time {
                *slot = Some(t);
            } else {
                log::warn!(
                    "{} trial {}: {} marker {} outside [{}, {}]",
                    session,
                    trial_id,
                    event,
                    t,
                    start_time,
                    stop_time
                );
                flags.push(QualityFlag::EventOutsideTrial {
                    trial_id: trial_id.clone(),
                    event: event.to_string(),
                });
            }
        }
        let [cue_start_time, cue_end_time, pole_in_time, pole_out_time] = event_times;

        trials.push(Trial {
            session: session.clone(),
            trial_id: trial_id.clone(),
            start_time,
            stop_time,
            cue_start_time,
            cue_end_time,
            pole_in_time,
            pole_out_time,
            trial_type,
            stim_present,
            outcome: outcomes[idx],
            status: trial_status(good_trials[idx]),
        });
    }

    flags.extend(overlaps(session, &trials));

    let trial_set = TrialSet {
        session: session.clone(),
        n_trials: trials.len(),
        flags,
    };
    Ok((trial_set, trials))
}

/// Flag consecutive trials (by start time) whose windows overlap
fn overlaps(session: &SessionKey, trials: &[Trial]) -> Vec<QualityFlag> {
    let mut order: Vec<&Trial> = trials.iter().collect();
    order.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));

    order
        .windows(2)
        .filter(|pair| pair[0].stop_time > pair[1].start_time)
        .map(|pair| {
            log::warn!(
                "{}: trial {} overlaps trial {}",
                session,
                pair[0].trial_id,
                pair[1].trial_id
            );
            QualityFlag::OverlappingTrials {
                first: pair[0].trial_id.clone(),
                second: pair[1].trial_id.clone(),
            }
        })
        .collect()
}

fn check_len(path: &str, found: usize, expected: usize) -> Result<(), IngestError> {
    if found == expected {
        Ok(())
    } else {
        Err(IngestError::ShapeMismatch {
            path: path.to_string(),
            detail: format!("{} rows for {} trials", found, expected),
        })
    }
}
