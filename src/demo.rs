//! Synthetic session containers
//!
//! Builds a small but complete session file in the default layout: trials,
//! event markers, a behavioral trace, a membrane potential, two extracellular
//! units stored time-first and one photostimulation channel.

use chrono::NaiveDateTime;
use ndarray::Array2;

use crate::config::ContainerLayout;
use crate::container::{AttrValue, ContainerBuilder, DatasetValue};
use crate::container::reader::TIME_AXIS_ATTR;

/// Seconds per trial window
pub const TRIAL_LENGTH: f64 = 4.0;
/// Seconds between consecutive trial starts
pub const TRIAL_PERIOD: f64 = 5.0;
/// Samples per second of every synthetic stream
pub const SAMPLE_RATE: f64 = 100.0;

pub const BEHAVIORAL_TYPE: &str = "lick_trace";
pub const INTRACELLULAR_TYPE: &str = "membrane_potential";
pub const EXTRACELLULAR_TYPE: &str = "spike_times";
pub const STIM_ID: &str = "photostim_1";

const OUTCOME_LABELS: [&str; 5] = ["correct", "incorrect", "no response", "early lick", "stim"];

/// A session file for `subject_id` starting at `session_time` with `n_trials` trials
pub fn sample_session(
    subject_id: &str,
    session_time: NaiveDateTime,
    n_trials: usize,
) -> ContainerBuilder {
    let layout = ContainerLayout::default();
    let mut builder = ContainerBuilder::new();
    builder
        .attribute("", "producer", AttrValue::Text("ephys demo".to_string()))
        .dataset(&layout.subject_id, DatasetValue::text(subject_id))
        .dataset(
            &layout.session_start_time,
            DatasetValue::text(session_time.format("%Y-%m-%dT%H:%M:%S").to_string()),
        );

    let mut responses = Array2::<f64>::zeros((n_trials, OUTCOME_LABELS.len()));
    let mut good = Vec::with_capacity(n_trials);
    let mut markers: [Vec<f64>; 4] = Default::default();

    for i in 0..n_trials {
        let start = i as f64 * TRIAL_PERIOD;
        let stop = start + TRIAL_LENGTH;
        let side = if i % 2 == 0 { "Lick L trial" } else { "Lick R trial" };
        let stim = if i % 3 == 0 { "Stim" } else { "No stim" };
        let base = format!("{}/trial_{:03}", layout.epochs, i + 1);

        builder
            .dataset(&format!("{}/description", base), DatasetValue::text(format!("{}, {}", side, stim)))
            .dataset(&format!("{}/start_time", base), DatasetValue::scalar(start))
            .dataset(&format!("{}/stop_time", base), DatasetValue::scalar(stop));

        responses[[i, i % 4]] = 1.0;
        responses[[i, 4]] = if stim == "Stim" { 1.0 } else { 0.0 };
        good.push(if i % 5 == 4 { 0.0 } else { 1.0 });

        for (slot, offset) in markers.iter_mut().zip([0.5, 0.6, 1.0, 3.0]) {
            slot.push(start + offset);
        }
    }

    builder
        .dataset(&layout.good_trials, DatasetValue::f64_vec(good))
        .dataset(
            &layout.trial_type_string,
            DatasetValue::text_vec(OUTCOME_LABELS.to_vec()),
        )
        .dataset(&layout.trial_type_mat, DatasetValue::F64(responses.into_dyn()));
    for (event, times) in layout.event_names().iter().zip(markers) {
        builder.dataset(&layout.event_timestamps(event), DatasetValue::f64_vec(times));
    }

    let duration = n_trials as f64 * TRIAL_PERIOD;
    let n_samples = (duration * SAMPLE_RATE) as usize;
    let timestamps: Vec<f64> = (0..n_samples).map(|i| i as f64 / SAMPLE_RATE).collect();

    let lick: Vec<f64> = timestamps
        .iter()
        .map(|t| if (t % TRIAL_PERIOD) > 2.0 && (t % TRIAL_PERIOD) < 2.2 { 1.0 } else { 0.0 })
        .collect();
    series(&mut builder, &layout.behavior_series(BEHAVIORAL_TYPE), lick, &timestamps);

    let vm: Vec<f64> = timestamps.iter().map(|t| -70.0 + (t * 3.0).sin()).collect();
    series(&mut builder, &layout.intracellular_series(INTRACELLULAR_TYPE), vm, &timestamps);

    let units = layout.extracellular_series(EXTRACELLULAR_TYPE);
    let spikes = Array2::from_shape_fn((n_samples, 2), |(i, unit)| {
        if i % (37 + unit * 11) == 0 {
            1.0
        } else {
            0.0
        }
    });
    builder
        .dataset(&format!("{}/data", units), DatasetValue::F64(spikes.into_dyn()))
        .attribute(&format!("{}/data", units), TIME_AXIS_ATTR, AttrValue::Int(0))
        .dataset(&format!("{}/timestamps", units), DatasetValue::f64_vec(timestamps.clone()))
        .dataset(
            &format!("{}/{}", units, layout.electrode_index),
            DatasetValue::f64_vec(vec![1.0, 2.0]),
        )
        .dataset(
            &layout.cell_type_table,
            DatasetValue::text_vec(vec!["1 - pyramidal", "2 - FS"]),
        );

    let light: Vec<f64> = timestamps
        .iter()
        .map(|t| if (t % (3.0 * TRIAL_PERIOD)) < 1.0 { 5.0 } else { 0.0 })
        .collect();
    series(&mut builder, &layout.stimulus_series(STIM_ID), light, &timestamps);

    builder
}

fn series(builder: &mut ContainerBuilder, group: &str, values: Vec<f64>, timestamps: &[f64]) {
    builder
        .dataset(&format!("{}/data", group), DatasetValue::f64_vec(values))
        .dataset(&format!("{}/timestamps", group), DatasetValue::f64_vec(timestamps.to_vec()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerReader;
    use crate::populators::read_trial_set;
    use crate::types::SessionKey;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_sample_session_reads_back() {
        let time = NaiveDate::from_ymd_opt(2017, 5, 12)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("demo.ephc");
        sample_session("ANM244028", time, 6).write_file(&path).unwrap();

        let layout = ContainerLayout::default();
        let mut reader = ContainerReader::open(&path).unwrap();
        let (set, trials) = read_trial_set(&mut reader, &SessionKey::new("ANM244028", time), &layout).unwrap();
        assert_eq!(set.n_trials, 6);
        assert!(set.flags.is_empty());
        assert!(trials[0].stim_present);
        assert_eq!(trials[3].cue_start_time, Some(15.5));

        let units = reader
            .read_timeseries(&layout.extracellular_series(EXTRACELLULAR_TYPE))
            .unwrap();
        assert_eq!(units.n_channels(), 2);
        assert_eq!(units.n_samples(), 3000);
    }
}
