//! Semantic decoders
//!
//! Pure transformations from raw container strings and arrays into domain
//! values. Each ambiguity has its own failure mode:
//! - Trial descriptors `"TYPE, STIM"` split into trial type and stim flag
//! - One-hot response rows decoded into a [`TrialOutcome`]
//! - `"ID - LABEL"` tables parsed into unit → cell type maps
//! - 1-based channel numbers shifted to 0-based indices

use ndarray::{Array2, ArrayView1, Axis};
use std::collections::BTreeMap;

use crate::error::IngestError;
use crate::types::{TrialOutcome, TrialStatus};

/// Split a trial descriptor such as `"Lick L trial, Stim"` into its trial
/// type and stimulation flag.
///
/// The stimulation part is matched case-insensitively against `stim` and
/// `no stim`; anything else, or a missing comma, is malformed.
pub fn split_trial_descriptor(descriptor: &str) -> Result<(String, bool), IngestError> {
    let (trial_type, stim) = descriptor
        .split_once(',')
        .ok_or_else(|| IngestError::MalformedDescriptor(descriptor.to_string()))?;

    let trial_type = trial_type.trim();
    if trial_type.is_empty() {
        return Err(IngestError::MalformedDescriptor(descriptor.to_string()));
    }

    let stim_present = match stim.trim().to_lowercase().as_str() {
        "stim" => true,
        "no stim" => false,
        _ => return Err(IngestError::MalformedDescriptor(descriptor.to_string())),
    };

    Ok((trial_type.to_string(), stim_present))
}

/// Map a response label to an outcome.
///
/// Labels are compared case-insensitively with `_` and `-` read as spaces.
/// Specific categories are tested before generic ones so that
/// `"incorrect"` never matches the `"correct"` rule.
pub fn outcome_from_label(label: &str) -> TrialOutcome {
    let normalized: String = label
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' || c == '-' { ' ' } else { c })
        .collect();

    if normalized.contains("incorrect") {
        TrialOutcome::Incorrect
    } else if normalized.contains("early lick") {
        TrialOutcome::EarlyLick
    } else if normalized.contains("no response") {
        TrialOutcome::NoResponse
    } else if normalized.contains("correct") {
        TrialOutcome::Correct
    } else {
        TrialOutcome::Unknown
    }
}

/// Decode one trial's one-hot response row.
///
/// `row` and `labels` cover the full vocabulary; the trailing stim/no-stim
/// column is excluded from the search. Exactly one remaining column must be set.
pub fn decode_outcome(
    row: ArrayView1<'_, f64>,
    labels: &[String],
    trial_index: usize,
) -> Result<TrialOutcome, IngestError> {
    if row.len() != labels.len() {
        return Err(IngestError::ShapeMismatch {
            path: format!("response row {}", trial_index),
            detail: format!("{} columns for {} labels", row.len(), labels.len()),
        });
    }

    let searchable = row.len().saturating_sub(1);
    let set: Vec<usize> = row
        .iter()
        .take(searchable)
        .enumerate()
        .filter(|(_, v)| **v == 1.0)
        .map(|(idx, _)| idx)
        .collect();

    match set.as_slice() {
        [column] => Ok(outcome_from_label(&labels[*column])),
        _ => Err(IngestError::AmbiguousOutcome {
            trial_index,
            set_columns: set.len(),
        }),
    }
}

/// Decode every row of a trials × labels response matrix
pub fn decode_outcomes(
    matrix: &Array2<f64>,
    labels: &[String],
) -> Result<Vec<TrialOutcome>, IngestError> {
    matrix
        .axis_iter(Axis(0))
        .enumerate()
        .map(|(idx, row)| decode_outcome(row, labels, idx))
        .collect()
}

/// Trial status from the good-trials vector (1 = good)
pub fn trial_status(flag: f64) -> TrialStatus {
    if flag == 1.0 {
        TrialStatus::Good
    } else {
        TrialStatus::Bad
    }
}

/// Parse `"ID - LABEL"` entries into a unit → label map.
///
/// A unit listed twice with different labels is malformed.
pub fn parse_cell_types(entries: &[String]) -> Result<BTreeMap<u32, String>, IngestError> {
    let mut table = BTreeMap::new();

    for entry in entries {
        let (id, label) = entry
            .split_once(" - ")
            .or_else(|| entry.split_once('-'))
            .ok_or_else(|| IngestError::MalformedDescriptor(entry.clone()))?;

        let id: u32 = id
            .trim()
            .parse()
            .map_err(|_| IngestError::MalformedDescriptor(entry.clone()))?;
        let label = label.trim();
        if label.is_empty() {
            return Err(IngestError::MalformedDescriptor(entry.clone()));
        }

        match table.get(&id) {
            Some(existing) if existing != label => {
                return Err(IngestError::MalformedDescriptor(format!(
                    "unit {} labelled both '{}' and '{}'",
                    id, existing, label
                )))
            }
            _ => {
                table.insert(id, label.to_string());
            }
        }
    }

    Ok(table)
}

/// Convert a 1-based external channel number to a 0-based index
pub fn to_zero_based(channel: i64) -> Result<usize, IngestError> {
    if channel < 1 {
        return Err(IngestError::InvalidChannel(channel));
    }
    usize::try_from(channel - 1).map_err(|_| IngestError::InvalidChannel(channel))
}

/// Convert a stored vector of 1-based channel numbers; values must be integral
pub fn channels_to_zero_based(channels: &[f64]) -> Result<Vec<usize>, IngestError> {
    channels
        .iter()
        .map(|&c| {
            if c.fract() != 0.0 || !c.is_finite() {
                return Err(IngestError::ShapeMismatch {
                    path: "electrode index".to_string(),
                    detail: format!("non-integral channel number {}", c),
                });
            }
            to_zero_based(c as i64)
        })
        .collect()
}
