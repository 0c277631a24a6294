//! Ingestion configuration
//!
//! Loaded from JSON; every field has a default so a partial file (or none at
//! all) is valid. `EPHYS_DATA_DIR` and `EPHYS_WORKERS` override the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::IngestError;

pub const ENV_DATA_DIR: &str = "EPHYS_DATA_DIR";
pub const ENV_WORKERS: &str = "EPHYS_WORKERS";

/// Top-level configuration of an ingestion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Directory scanned for raw container files when a session names none
    pub data_dir: PathBuf,
    /// Worker threads per population stage
    pub workers: usize,
    /// chrono formats tried, in order, against the file's session start time.
    /// Each is matched as a prefix; trailing text such as a UTC offset is ignored.
    pub time_formats: Vec<String>,
    pub layout: ContainerLayout,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            workers: default_workers(),
            time_formats: vec![
                "%Y-%m-%dT%H:%M:%S%.f".to_string(),
                "%Y-%m-%d %H:%M:%S%.f".to_string(),
                "%a %b %d %Y %H:%M:%S".to_string(),
                "%a %b %e %H:%M:%S %Y".to_string(),
            ],
            layout: ContainerLayout::default(),
        }
    }
}

impl IngestConfig {
    /// Read a JSON config file and apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: IngestConfig = serde_json::from_str(&text)
            .map_err(|e| IngestError::Config(format!("{}: {}", path.display(), e)))?;
        config.with_env()
    }

    /// Apply `EPHYS_DATA_DIR` / `EPHYS_WORKERS` when set
    pub fn with_env(mut self) -> Result<Self, IngestError> {
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(workers) = std::env::var(ENV_WORKERS) {
            self.workers = parse_workers(&workers)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.workers == 0 {
            return Err(IngestError::Config("workers must be at least 1".to_string()));
        }
        if self.time_formats.is_empty() {
            return Err(IngestError::Config(
                "at least one session time format is required".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_workers(value: &str) -> Result<usize, IngestError> {
    value
        .trim()
        .parse()
        .map_err(|_| IngestError::Config(format!("{}='{}' is not a count", ENV_WORKERS, value)))
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Paths the reader navigates inside a container file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerLayout {
    pub subject_id: String,
    pub session_start_time: String,
    /// Group with one child group per trial (description, start_time, stop_time)
    pub epochs: String,
    pub good_trials: String,
    pub trial_type_string: String,
    pub trial_type_mat: String,
    /// Group holding one `<event>/timestamps` dataset per event marker
    pub event_markers: String,
    pub cue_start: String,
    pub cue_end: String,
    pub pole_in: String,
    pub pole_out: String,
    /// Parent of behavioral and intracellular timeseries, one group per type
    pub acquisition_timeseries: String,
    /// Parent of extracellular unit series, one group per type
    pub extracellular_units: String,
    /// Dataset inside an extracellular series group listing 1-based channels
    pub electrode_index: String,
    pub cell_type_table: String,
    /// Parent of stimulus series, one group per stimulation site id
    pub stimulus_presentation: String,
}

impl Default for ContainerLayout {
    fn default() -> Self {
        Self {
            subject_id: "general/subject/subject_id".to_string(),
            session_start_time: "session_start_time".to_string(),
            epochs: "epochs".to_string(),
            good_trials: "analysis/good_trials".to_string(),
            trial_type_string: "analysis/trial_type_string".to_string(),
            trial_type_mat: "analysis/trial_type_mat".to_string(),
            event_markers: "stimulus/presentation".to_string(),
            cue_start: "cue_start".to_string(),
            cue_end: "cue_end".to_string(),
            pole_in: "pole_in".to_string(),
            pole_out: "pole_out".to_string(),
            acquisition_timeseries: "acquisition/timeseries".to_string(),
            extracellular_units: "processing/extracellular_units".to_string(),
            electrode_index: "electrode_idx".to_string(),
            cell_type_table: "analysis/cell_type".to_string(),
            stimulus_presentation: "stimulus/presentation".to_string(),
        }
    }
}

impl ContainerLayout {
    /// Timestamps dataset of one event marker
    pub fn event_timestamps(&self, event: &str) -> String {
        format!("{}/{}/timestamps", self.event_markers, event)
    }

    /// Event marker names in trial order: cue start, cue end, pole in, pole out
    pub fn event_names(&self) -> [&str; 4] {
        [&self.cue_start, &self.cue_end, &self.pole_in, &self.pole_out]
    }

    pub fn behavior_series(&self, behavioral_type: &str) -> String {
        format!("{}/{}", self.acquisition_timeseries, behavioral_type)
    }

    pub fn intracellular_series(&self, intracellular_type: &str) -> String {
        format!("{}/{}", self.acquisition_timeseries, intracellular_type)
    }

    pub fn extracellular_series(&self, extracellular_type: &str) -> String {
        format!("{}/{}", self.extracellular_units, extracellular_type)
    }

    pub fn stimulus_series(&self, stim_id: &str) -> String {
        format!("{}/{}", self.stimulus_presentation, stim_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"workers": 3, "layout": {{"epochs": "intervals/trials"}}}}"#
        )
        .unwrap();

        let text = std::fs::read_to_string(file.path()).unwrap();
        let config: IngestConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.layout.epochs, "intervals/trials");
        assert_eq!(config.layout.good_trials, "analysis/good_trials");
        assert_eq!(config.time_formats.len(), 4);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            IngestConfig::from_file(file.path()),
            Err(IngestError::Config(_))
        ));
        assert!(matches!(
            IngestConfig::from_file("/nonexistent/ephys.json"),
            Err(IngestError::Config(_))
        ));
    }

    #[test]
    fn test_validate() {
        let mut config = IngestConfig::default();
        assert!(config.validate().is_ok());
        config.workers = 0;
        assert!(config.validate().is_err());
        assert!(parse_workers("four").is_err());
        assert_eq!(parse_workers(" 4 ").unwrap(), 4);
    }

    #[test]
    fn test_layout_paths() {
        let layout = ContainerLayout::default();
        assert_eq!(
            layout.event_timestamps("pole_in"),
            "stimulus/presentation/pole_in/timestamps"
        );
        assert_eq!(
            layout.extracellular_series("spike_times"),
            "processing/extracellular_units/spike_times"
        );
    }
}
