//! Core types for the ephys entity graph
//!
//! This module defines the entities that flow through ingestion: manually
//! registered sessions and recording loci, imported trial sets and
//! acquisitions, and the per-trial segments derived from them. Every entity
//! carries a key and the foreign-key references the catalog enforces.

use chrono::{NaiveDate, NaiveDateTime};
use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::IngestError;
use crate::segmentation::TrialWindow;

/// Format used for session times inside entity keys
pub const SESSION_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Controlled vocabularies supplied as reference data
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupTable {
    Species,
    Strain,
    BrainLocation,
    CoordinateReference,
    Device,
    Experimenter,
    ExperimentType,
    BehavioralType,
    IntracellularType,
    ExtracellularType,
    TrialType,
    CellType,
}

impl LookupTable {
    pub const ALL: [LookupTable; 12] = [
        LookupTable::Species,
        LookupTable::Strain,
        LookupTable::BrainLocation,
        LookupTable::CoordinateReference,
        LookupTable::Device,
        LookupTable::Experimenter,
        LookupTable::ExperimentType,
        LookupTable::BehavioralType,
        LookupTable::IntracellularType,
        LookupTable::ExtracellularType,
        LookupTable::TrialType,
        LookupTable::CellType,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LookupTable::Species => "species",
            LookupTable::Strain => "strain",
            LookupTable::BrainLocation => "brain_location",
            LookupTable::CoordinateReference => "coordinate_reference",
            LookupTable::Device => "device",
            LookupTable::Experimenter => "experimenter",
            LookupTable::ExperimentType => "experiment_type",
            LookupTable::BehavioralType => "behavioral_type",
            LookupTable::IntracellularType => "intracellular_type",
            LookupTable::ExtracellularType => "extracellular_type",
            LookupTable::TrialType => "trial_type",
            LookupTable::CellType => "cell_type",
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            LookupTable::Species => "lookup.species",
            LookupTable::Strain => "lookup.strain",
            LookupTable::BrainLocation => "lookup.brain_location",
            LookupTable::CoordinateReference => "lookup.coordinate_reference",
            LookupTable::Device => "lookup.device",
            LookupTable::Experimenter => "lookup.experimenter",
            LookupTable::ExperimentType => "lookup.experiment_type",
            LookupTable::BehavioralType => "lookup.behavioral_type",
            LookupTable::IntracellularType => "lookup.intracellular_type",
            LookupTable::ExtracellularType => "lookup.extracellular_type",
            LookupTable::TrialType => "lookup.trial_type",
            LookupTable::CellType => "lookup.cell_type",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.as_str() == name)
    }
}

/// Every kind of entity held by the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Lookup(LookupTable),
    Subject,
    Session,
    ActionLocation,
    Cell,
    ProbeInsertion,
    StimulationInfo,
    TrialSet,
    Trial,
    BehaviorAcquisition,
    IntracellularAcquisition,
    ExtracellularAcquisition,
    StimulusAcquisition,
    TrialBehavior,
    TrialIntracellular,
    TrialExtracellular,
    TrialStimulus,
}

impl EntityKind {
    /// Kinds computed by the population engine, in dependency order
    pub const POPULATED: [EntityKind; 9] = [
        EntityKind::TrialSet,
        EntityKind::BehaviorAcquisition,
        EntityKind::IntracellularAcquisition,
        EntityKind::ExtracellularAcquisition,
        EntityKind::StimulusAcquisition,
        EntityKind::TrialBehavior,
        EntityKind::TrialIntracellular,
        EntityKind::TrialExtracellular,
        EntityKind::TrialStimulus,
    ];

    const NON_LOOKUP: [EntityKind; 16] = [
        EntityKind::Subject,
        EntityKind::Session,
        EntityKind::ActionLocation,
        EntityKind::Cell,
        EntityKind::ProbeInsertion,
        EntityKind::StimulationInfo,
        EntityKind::TrialSet,
        EntityKind::Trial,
        EntityKind::BehaviorAcquisition,
        EntityKind::IntracellularAcquisition,
        EntityKind::ExtracellularAcquisition,
        EntityKind::StimulusAcquisition,
        EntityKind::TrialBehavior,
        EntityKind::TrialIntracellular,
        EntityKind::TrialExtracellular,
        EntityKind::TrialStimulus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Lookup(table) => table.kind_name(),
            EntityKind::Subject => "subject",
            EntityKind::Session => "session",
            EntityKind::ActionLocation => "action_location",
            EntityKind::Cell => "cell",
            EntityKind::ProbeInsertion => "probe_insertion",
            EntityKind::StimulationInfo => "stimulation_info",
            EntityKind::TrialSet => "trial_set",
            EntityKind::Trial => "trial",
            EntityKind::BehaviorAcquisition => "behavior_acquisition",
            EntityKind::IntracellularAcquisition => "intracellular_acquisition",
            EntityKind::ExtracellularAcquisition => "extracellular_acquisition",
            EntityKind::StimulusAcquisition => "stimulus_acquisition",
            EntityKind::TrialBehavior => "trial_behavior",
            EntityKind::TrialIntracellular => "trial_intracellular",
            EntityKind::TrialExtracellular => "trial_extracellular",
            EntityKind::TrialStimulus => "trial_stimulus",
        }
    }

    /// Parse a kind from its `as_str` name (e.g. `trial_set`, `lookup.device`)
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(table) = name.strip_prefix("lookup.") {
            return LookupTable::parse(table).map(EntityKind::Lookup);
        }
        Self::NON_LOOKUP
            .into_iter()
            .find(|kind| kind.as_str() == name)
    }

    /// Kinds that must be populated before this one
    pub fn dependencies(&self) -> &'static [EntityKind] {
        match self {
            EntityKind::Lookup(_) => &[],
            EntityKind::Subject => &[
                EntityKind::Lookup(LookupTable::Species),
                EntityKind::Lookup(LookupTable::Strain),
            ],
            EntityKind::Session => &[EntityKind::Subject],
            EntityKind::ActionLocation => &[
                EntityKind::Lookup(LookupTable::BrainLocation),
                EntityKind::Lookup(LookupTable::CoordinateReference),
            ],
            EntityKind::Cell | EntityKind::ProbeInsertion | EntityKind::StimulationInfo => &[
                EntityKind::Session,
                EntityKind::ActionLocation,
                EntityKind::Lookup(LookupTable::Device),
            ],
            EntityKind::TrialSet => &[EntityKind::Session],
            EntityKind::Trial => &[EntityKind::TrialSet],
            EntityKind::BehaviorAcquisition => &[
                EntityKind::Session,
                EntityKind::Lookup(LookupTable::BehavioralType),
            ],
            EntityKind::IntracellularAcquisition => &[
                EntityKind::Cell,
                EntityKind::Lookup(LookupTable::IntracellularType),
            ],
            EntityKind::ExtracellularAcquisition => &[
                EntityKind::ProbeInsertion,
                EntityKind::Lookup(LookupTable::ExtracellularType),
            ],
            EntityKind::StimulusAcquisition => &[EntityKind::StimulationInfo],
            EntityKind::TrialBehavior => &[EntityKind::BehaviorAcquisition, EntityKind::TrialSet],
            EntityKind::TrialIntracellular => {
                &[EntityKind::IntracellularAcquisition, EntityKind::TrialSet]
            }
            EntityKind::TrialExtracellular => {
                &[EntityKind::ExtracellularAcquisition, EntityKind::TrialSet]
            }
            EntityKind::TrialStimulus => &[EntityKind::StimulusAcquisition, EntityKind::TrialSet],
        }
    }

    /// The acquisition kind a segmented kind is derived from
    pub fn segment_source(&self) -> Option<EntityKind> {
        match self {
            EntityKind::TrialBehavior => Some(EntityKind::BehaviorAcquisition),
            EntityKind::TrialIntracellular => Some(EntityKind::IntracellularAcquisition),
            EntityKind::TrialExtracellular => Some(EntityKind::ExtracellularAcquisition),
            EntityKind::TrialStimulus => Some(EntityKind::StimulusAcquisition),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered primary-key components of an entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey(Vec<String>);

impl EntityKey {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Extend this key with one more component
    pub fn child(&self, part: impl Into<String>) -> Self {
        let mut parts = self.0.clone();
        parts.push(part.into());
        Self(parts)
    }

    pub fn starts_with(&self, prefix: &EntityKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Parse a key of `kind` from user input.
    ///
    /// Accepts a JSON array of components (`["ANM244028", "2017-05-12 10:30:00"]`)
    /// or `/`-separated text as printed by `Display`. Lookup keys have a single
    /// component, so their text is taken whole and values such as `N/A` survive.
    pub fn parse(kind: EntityKind, text: &str) -> Result<Self, IngestError> {
        let text = text.trim();
        if text.starts_with('[') {
            let parts: Vec<String> = serde_json::from_str(text)?;
            return Ok(Self(parts));
        }
        match kind {
            EntityKind::Lookup(_) => Ok(Self(vec![text.to_string()])),
            _ => Ok(Self(text.split('/').map(str::to_string).collect())),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl From<Vec<String>> for EntityKey {
    fn from(parts: Vec<String>) -> Self {
        Self(parts)
    }
}

impl From<Vec<&str>> for EntityKey {
    fn from(parts: Vec<&str>) -> Self {
        Self(parts.into_iter().map(str::to_string).collect())
    }
}

/// A foreign-key reference from one entity to another
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub kind: EntityKind,
    pub key: EntityKey,
}

impl Reference {
    pub fn new(kind: EntityKind, key: EntityKey) -> Self {
        Self { kind, key }
    }

    pub fn lookup(table: LookupTable, value: &str) -> Self {
        Self::new(EntityKind::Lookup(table), EntityKey::from(vec![value]))
    }
}

/// A persisted entity of the graph
pub trait Entity: Serialize + DeserializeOwned {
    fn kind(&self) -> EntityKind;

    fn key(&self) -> EntityKey;

    /// Parents and reference rows this entity depends on
    fn references(&self) -> Vec<Reference> {
        Vec::new()
    }
}

/// Session identity: subject plus local start time
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub subject_id: String,
    pub session_time: NaiveDateTime,
}

impl SessionKey {
    pub fn new(subject_id: impl Into<String>, session_time: NaiveDateTime) -> Self {
        Self {
            subject_id: subject_id.into(),
            session_time,
        }
    }

    pub fn time_label(&self) -> String {
        self.session_time.format(SESSION_TIME_FORMAT).to_string()
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(vec![self.subject_id.clone(), self.time_label()])
    }

    /// Recover the session from the first two components of any session-owned key
    pub fn from_entity_key(key: &EntityKey) -> Result<Self, IngestError> {
        match key.parts() {
            [subject_id, time, ..] => {
                let session_time = NaiveDateTime::parse_from_str(time, SESSION_TIME_FORMAT)
                    .map_err(|e| {
                        IngestError::MalformedDescriptor(format!(
                            "session time '{}' in key {}: {}",
                            time, key, e
                        ))
                    })?;
                Ok(Self::new(subject_id.clone(), session_time))
            }
            _ => Err(IngestError::MalformedDescriptor(format!(
                "key {} does not identify a session",
                key
            ))),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.subject_id, self.time_label())
    }
}

/// One row of a controlled vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupRow {
    pub table: LookupTable,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl LookupRow {
    pub fn new(table: LookupTable, value: impl Into<String>) -> Self {
        Self {
            table,
            value: value.into(),
            description: None,
        }
    }
}

impl Entity for LookupRow {
    fn kind(&self) -> EntityKind {
        EntityKind::Lookup(self.table)
    }

    fn key(&self) -> EntityKey {
        EntityKey::from(vec![self.value.as_str()])
    }
}

/// Subject sex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Sex {
    M,
    F,
    #[default]
    U,
}

/// Experimental animal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub subject_id: String,
    pub species: String,
    pub strain: String,
    #[serde(default)]
    pub sex: Sex,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Entity for Subject {
    fn kind(&self) -> EntityKind {
        EntityKind::Subject
    }

    fn key(&self) -> EntityKey {
        EntityKey::from(vec![self.subject_id.as_str()])
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::lookup(LookupTable::Species, &self.species),
            Reference::lookup(LookupTable::Strain, &self.strain),
        ]
    }
}

/// One recording occasion, registered manually before ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(flatten)]
    pub key: SessionKey,
    /// Directory holding this session's raw files; empty means the configured data dir
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub experimenters: Vec<String>,
    #[serde(default)]
    pub experiment_types: Vec<String>,
}

impl Entity for Session {
    fn kind(&self) -> EntityKind {
        EntityKind::Session
    }

    fn key(&self) -> EntityKey {
        self.key.entity_key()
    }

    fn references(&self) -> Vec<Reference> {
        let mut refs = vec![Reference::new(
            EntityKind::Subject,
            EntityKey::from(vec![self.key.subject_id.as_str()]),
        )];
        refs.extend(
            self.experimenters
                .iter()
                .map(|e| Reference::lookup(LookupTable::Experimenter, e)),
        );
        refs.extend(
            self.experiment_types
                .iter()
                .map(|t| Reference::lookup(LookupTable::ExperimentType, t)),
        );
        refs
    }
}

/// Where a recording or stimulation took place; all fields form the key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLocation {
    pub brain_location: String,
    pub coordinate_ref: String,
    /// mm, anterior positive
    pub coordinate_ap: f64,
    /// mm, always positive, larger when more lateral
    pub coordinate_ml: f64,
    /// mm, always positive, larger when deeper
    pub coordinate_dv: f64,
}

impl Entity for ActionLocation {
    fn kind(&self) -> EntityKind {
        EntityKind::ActionLocation
    }

    fn key(&self) -> EntityKey {
        EntityKey::new(vec![
            self.brain_location.clone(),
            self.coordinate_ref.clone(),
            self.coordinate_ap.to_string(),
            self.coordinate_ml.to_string(),
            self.coordinate_dv.to_string(),
        ])
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::lookup(LookupTable::BrainLocation, &self.brain_location),
            Reference::lookup(LookupTable::CoordinateReference, &self.coordinate_ref),
        ]
    }
}

fn locus_references(session: &SessionKey, location: &ActionLocation, device: &str) -> Vec<Reference> {
    vec![
        Reference::new(EntityKind::Session, session.entity_key()),
        Reference::new(EntityKind::ActionLocation, location.key()),
        Reference::lookup(LookupTable::Device, device),
    ]
}

/// Intracellular recording locus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    #[serde(flatten)]
    pub session: SessionKey,
    pub cell_id: String,
    pub cell_type: String,
    pub location: ActionLocation,
    pub device: String,
}

impl Entity for Cell {
    fn kind(&self) -> EntityKind {
        EntityKind::Cell
    }

    fn key(&self) -> EntityKey {
        self.session.entity_key().child(&self.cell_id)
    }

    fn references(&self) -> Vec<Reference> {
        let mut refs = locus_references(&self.session, &self.location, &self.device);
        refs.push(Reference::lookup(LookupTable::CellType, &self.cell_type));
        refs
    }
}

/// Extracellular recording locus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeInsertion {
    #[serde(flatten)]
    pub session: SessionKey,
    pub ec_id: String,
    pub location: ActionLocation,
    pub device: String,
}

impl Entity for ProbeInsertion {
    fn kind(&self) -> EntityKind {
        EntityKind::ProbeInsertion
    }

    fn key(&self) -> EntityKey {
        self.session.entity_key().child(&self.ec_id)
    }

    fn references(&self) -> Vec<Reference> {
        locus_references(&self.session, &self.location, &self.device)
    }
}

/// Stimulation modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StimType {
    Optical,
    Electrical,
}

/// Stimulation locus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulationInfo {
    #[serde(flatten)]
    pub session: SessionKey,
    pub stim_id: String,
    pub stim_type: StimType,
    pub location: ActionLocation,
    pub device: String,
}

impl Entity for StimulationInfo {
    fn kind(&self) -> EntityKind {
        EntityKind::StimulationInfo
    }

    fn key(&self) -> EntityKey {
        self.session.entity_key().child(&self.stim_id)
    }

    fn references(&self) -> Vec<Reference> {
        locus_references(&self.session, &self.location, &self.device)
    }
}

/// Behavioral response of a trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrialOutcome {
    Correct,
    Incorrect,
    NoResponse,
    EarlyLick,
    Unknown,
}

impl TrialOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialOutcome::Correct => "correct",
            TrialOutcome::Incorrect => "incorrect",
            TrialOutcome::NoResponse => "no-response",
            TrialOutcome::EarlyLick => "early-lick",
            TrialOutcome::Unknown => "unknown",
        }
    }
}

/// Good/bad quality flag of a trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    Good,
    Bad,
}

/// Data-quality conditions surfaced on a trial set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flag", rename_all = "snake_case")]
pub enum QualityFlag {
    /// Two trials overlap in time (ordered by start time)
    OverlappingTrials { first: String, second: String },
    /// An event marker fell outside its trial window and was dropped
    EventOutsideTrial { trial_id: String, event: String },
    /// An event marker vector was absent or shorter than the trial list
    MissingEventMarkers { event: String },
}

/// Trial set of one session; owns its trials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSet {
    #[serde(flatten)]
    pub session: SessionKey,
    pub n_trials: usize,
    #[serde(default)]
    pub flags: Vec<QualityFlag>,
}

impl Entity for TrialSet {
    fn kind(&self) -> EntityKind {
        EntityKind::TrialSet
    }

    fn key(&self) -> EntityKey {
        self.session.entity_key()
    }

    fn references(&self) -> Vec<Reference> {
        vec![Reference::new(EntityKind::Session, self.session.entity_key())]
    }
}

/// One behavioral attempt within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    #[serde(flatten)]
    pub session: SessionKey,
    pub trial_id: String,
    /// Session-relative start (seconds)
    pub start_time: f64,
    /// Session-relative stop (seconds)
    pub stop_time: f64,
    pub cue_start_time: Option<f64>,
    pub cue_end_time: Option<f64>,
    pub pole_in_time: Option<f64>,
    pub pole_out_time: Option<f64>,
    pub trial_type: String,
    pub stim_present: bool,
    pub outcome: TrialOutcome,
    pub status: TrialStatus,
}

impl Trial {
    pub fn window(&self) -> TrialWindow {
        TrialWindow::new(self.start_time, self.stop_time)
    }
}

impl Entity for Trial {
    fn kind(&self) -> EntityKind {
        EntityKind::Trial
    }

    fn key(&self) -> EntityKey {
        self.session.entity_key().child(&self.trial_id)
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::new(EntityKind::TrialSet, self.session.entity_key()),
            Reference::lookup(LookupTable::TrialType, &self.trial_type),
        ]
    }
}

/// Sample timestamps plus channel × time values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Session-relative seconds, non-decreasing
    pub timestamps: Vec<f64>,
    /// Shape: [num_channels, num_samples]
    pub values: Array2<f64>,
}

impl TimeSeries {
    pub fn n_samples(&self) -> usize {
        self.timestamps.len()
    }

    pub fn n_channels(&self) -> usize {
        self.values.nrows()
    }
}

/// An entity holding a raw stream recorded during one session
pub trait Acquisition: Entity {
    fn session(&self) -> &SessionKey;

    fn series(&self) -> &TimeSeries;
}

/// Behavioral stream of one behavioral type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorAcquisition {
    #[serde(flatten)]
    pub session: SessionKey,
    pub behavioral_type: String,
    pub series: TimeSeries,
}

impl Entity for BehaviorAcquisition {
    fn kind(&self) -> EntityKind {
        EntityKind::BehaviorAcquisition
    }

    fn key(&self) -> EntityKey {
        self.session.entity_key().child(&self.behavioral_type)
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::new(EntityKind::Session, self.session.entity_key()),
            Reference::lookup(LookupTable::BehavioralType, &self.behavioral_type),
        ]
    }
}

impl Acquisition for BehaviorAcquisition {
    fn session(&self) -> &SessionKey {
        &self.session
    }

    fn series(&self) -> &TimeSeries {
        &self.series
    }
}

/// Intracellular stream of one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntracellularAcquisition {
    #[serde(flatten)]
    pub session: SessionKey,
    pub cell_id: String,
    pub intracellular_type: String,
    pub series: TimeSeries,
}

impl Entity for IntracellularAcquisition {
    fn kind(&self) -> EntityKind {
        EntityKind::IntracellularAcquisition
    }

    fn key(&self) -> EntityKey {
        self.session
            .entity_key()
            .child(&self.cell_id)
            .child(&self.intracellular_type)
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::new(
                EntityKind::Cell,
                self.session.entity_key().child(&self.cell_id),
            ),
            Reference::lookup(LookupTable::IntracellularType, &self.intracellular_type),
        ]
    }
}

impl Acquisition for IntracellularAcquisition {
    fn session(&self) -> &SessionKey {
        &self.session
    }

    fn series(&self) -> &TimeSeries {
        &self.series
    }
}

/// Extracellular stream of one probe insertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtracellularAcquisition {
    #[serde(flatten)]
    pub session: SessionKey,
    pub ec_id: String,
    pub extracellular_type: String,
    pub series: TimeSeries,
    /// 0-based channel index of each row of `series.values`
    pub channels: Vec<usize>,
    /// Unit identifier to cell-type label
    #[serde(default)]
    pub unit_cell_types: BTreeMap<u32, String>,
}

impl Entity for ExtracellularAcquisition {
    fn kind(&self) -> EntityKind {
        EntityKind::ExtracellularAcquisition
    }

    fn key(&self) -> EntityKey {
        self.session
            .entity_key()
            .child(&self.ec_id)
            .child(&self.extracellular_type)
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::new(
                EntityKind::ProbeInsertion,
                self.session.entity_key().child(&self.ec_id),
            ),
            Reference::lookup(LookupTable::ExtracellularType, &self.extracellular_type),
        ]
    }
}

impl Acquisition for ExtracellularAcquisition {
    fn session(&self) -> &SessionKey {
        &self.session
    }

    fn series(&self) -> &TimeSeries {
        &self.series
    }
}

/// Stimulus delivered at one stimulation site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusAcquisition {
    #[serde(flatten)]
    pub session: SessionKey,
    pub stim_id: String,
    pub series: TimeSeries,
}

impl Entity for StimulusAcquisition {
    fn kind(&self) -> EntityKind {
        EntityKind::StimulusAcquisition
    }

    fn key(&self) -> EntityKey {
        self.session.entity_key().child(&self.stim_id)
    }

    fn references(&self) -> Vec<Reference> {
        vec![Reference::new(
            EntityKind::StimulationInfo,
            self.session.entity_key().child(&self.stim_id),
        )]
    }
}

impl Acquisition for StimulusAcquisition {
    fn session(&self) -> &SessionKey {
        &self.session
    }

    fn series(&self) -> &TimeSeries {
        &self.series
    }
}

/// Trial-restricted view of one acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSegment {
    /// One of the four segmented kinds
    pub segment_kind: EntityKind,
    pub acquisition_kind: EntityKind,
    pub acquisition: EntityKey,
    #[serde(flatten)]
    pub session: SessionKey,
    pub trial_id: String,
    /// Index range [start, end) into the parent stream
    pub index_start: usize,
    pub index_end: usize,
    pub timestamps: Vec<f64>,
    /// Shape: [num_channels, num_segment_samples]
    pub values: Array2<f64>,
}

impl TrialSegment {
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

impl Entity for TrialSegment {
    fn kind(&self) -> EntityKind {
        self.segment_kind
    }

    fn key(&self) -> EntityKey {
        self.acquisition.child(&self.trial_id)
    }

    fn references(&self) -> Vec<Reference> {
        vec![
            Reference::new(self.acquisition_kind, self.acquisition.clone()),
            Reference::new(
                EntityKind::Trial,
                self.session.entity_key().child(&self.trial_id),
            ),
        ]
    }
}
