//! Acquisition import
//!
//! Each acquisition populator enumerates (locus, modality type) pairs from
//! the registered loci and vocabularies, opens the session's container once
//! per work item and reads one timeseries per key. A series missing from the
//! file leaves only that key unavailable.

use crate::catalog::{Catalog, Record};
use crate::container::ContainerReader;
use crate::decoders::{channels_to_zero_based, parse_cell_types};
use crate::error::IngestError;
use crate::population::{Commit, KeyOutcome, MakeContext, Populator, WorkItem};
use crate::types::{
    BehaviorAcquisition, Entity, EntityKey, EntityKind, ExtracellularAcquisition,
    IntracellularAcquisition, LookupTable, SessionKey, StimulusAcquisition,
};

use super::{group_by_session, leaf, load_session, locus_series, lookup_values};

fn commit<E: Entity>(entity: &E) -> Result<Commit, IngestError> {
    Ok(Commit {
        key: entity.key(),
        records: vec![Record::from_entity(entity)?],
    })
}

/// Every parent key extended by every value of a vocabulary
fn cross(
    catalog: &dyn Catalog,
    parent: EntityKind,
    table: LookupTable,
) -> Result<Vec<EntityKey>, IngestError> {
    let types = lookup_values(catalog, table)?;
    Ok(catalog
        .keys(parent)?
        .into_iter()
        .flat_map(|key| types.iter().map(move |t| key.child(t.as_str())))
        .collect())
}

/// Open the item's session file, then make each key with `make_key`
fn make_each<F>(
    kind: EntityKind,
    item: &WorkItem,
    ctx: &MakeContext<'_>,
    mut make_key: F,
) -> Result<Vec<KeyOutcome>, IngestError>
where
    F: FnMut(&mut ContainerReader, &SessionKey, &EntityKey) -> Result<Commit, IngestError>,
{
    let session = load_session(ctx.catalog, kind, &item.parent)?;
    let mut reader = ctx.open(&session)?;
    Ok(item
        .keys
        .iter()
        .map(|key| (key.clone(), make_key(&mut reader, &session.key, key)))
        .collect())
}

fn part(key: &EntityKey, index: usize) -> Result<&str, IngestError> {
    key.parts()
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| IngestError::MalformedDescriptor(format!("key {} is too short", key)))
}

/// Behavioral streams, one per session and behavioral type
pub struct BehaviorPopulator;

impl Populator for BehaviorPopulator {
    fn kind(&self) -> EntityKind {
        EntityKind::BehaviorAcquisition
    }

    fn key_source(&self, catalog: &dyn Catalog) -> Result<Vec<WorkItem>, IngestError> {
        group_by_session(cross(catalog, EntityKind::Session, LookupTable::BehavioralType)?)
    }

    fn make(&self, item: &WorkItem, ctx: &MakeContext<'_>) -> Result<Vec<KeyOutcome>, IngestError> {
        let layout = &ctx.config.layout;
        make_each(self.kind(), item, ctx, |reader, session, key| {
            let behavioral_type = leaf(key)?;
            let series = reader.read_timeseries(&layout.behavior_series(behavioral_type))?;
            commit(&BehaviorAcquisition {
                session: session.clone(),
                behavioral_type: behavioral_type.to_string(),
                series,
            })
        })
    }
}

/// Intracellular streams, one per cell and intracellular type
pub struct IntracellularPopulator;

impl Populator for IntracellularPopulator {
    fn kind(&self) -> EntityKind {
        EntityKind::IntracellularAcquisition
    }

    fn key_source(&self, catalog: &dyn Catalog) -> Result<Vec<WorkItem>, IngestError> {
        group_by_session(cross(catalog, EntityKind::Cell, LookupTable::IntracellularType)?)
    }

    fn make(&self, item: &WorkItem, ctx: &MakeContext<'_>) -> Result<Vec<KeyOutcome>, IngestError> {
        let layout = &ctx.config.layout;
        make_each(self.kind(), item, ctx, |reader, session, key| {
            let cell_id = part(key, 2)?;
            let intracellular_type = leaf(key)?;
            let path = locus_series(reader, &layout.acquisition_timeseries, cell_id, intracellular_type);
            let series = reader.read_timeseries(&path)?;
            commit(&IntracellularAcquisition {
                session: session.clone(),
                cell_id: cell_id.to_string(),
                intracellular_type: intracellular_type.to_string(),
                series,
            })
        })
    }
}

/// Extracellular streams, one per probe insertion and extracellular type
pub struct ExtracellularPopulator;

impl Populator for ExtracellularPopulator {
    fn kind(&self) -> EntityKind {
        EntityKind::ExtracellularAcquisition
    }

    fn key_source(&self, catalog: &dyn Catalog) -> Result<Vec<WorkItem>, IngestError> {
        group_by_session(cross(
            catalog,
            EntityKind::ProbeInsertion,
            LookupTable::ExtracellularType,
        )?)
    }

    fn make(&self, item: &WorkItem, ctx: &MakeContext<'_>) -> Result<Vec<KeyOutcome>, IngestError> {
        let layout = &ctx.config.layout;
        make_each(self.kind(), item, ctx, |reader, session, key| {
            let ec_id = part(key, 2)?;
            let extracellular_type = leaf(key)?;
            let path = locus_series(reader, &layout.extracellular_units, ec_id, extracellular_type);
            let series = reader.read_timeseries(&path)?;

            let index_path = format!("{}/{}", path, layout.electrode_index);
            let channels = match reader.read_f64_vec(&index_path) {
                Ok(stored) => channels_to_zero_based(&stored)?,
                Err(IngestError::MissingField(_)) => (0..series.n_channels()).collect(),
                Err(err) => return Err(err),
            };
            if channels.len() != series.n_channels() {
                return Err(IngestError::ShapeMismatch {
                    path: index_path,
                    detail: format!(
                        "{} channel numbers for {} channels",
                        channels.len(),
                        series.n_channels()
                    ),
                });
            }

            let unit_cell_types = match reader.read_strings(&layout.cell_type_table) {
                Ok(entries) => parse_cell_types(&entries)?,
                Err(IngestError::MissingField(_)) => Default::default(),
                Err(err) => return Err(err),
            };

            commit(&ExtracellularAcquisition {
                session: session.clone(),
                ec_id: ec_id.to_string(),
                extracellular_type: extracellular_type.to_string(),
                series,
                channels,
                unit_cell_types,
            })
        })
    }
}

/// Delivered stimulus, one per stimulation site
pub struct StimulusPopulator;

impl Populator for StimulusPopulator {
    fn kind(&self) -> EntityKind {
        EntityKind::StimulusAcquisition
    }

    fn key_source(&self, catalog: &dyn Catalog) -> Result<Vec<WorkItem>, IngestError> {
        group_by_session(catalog.keys(EntityKind::StimulationInfo)?)
    }

    fn make(&self, item: &WorkItem, ctx: &MakeContext<'_>) -> Result<Vec<KeyOutcome>, IngestError> {
        let layout = &ctx.config.layout;
        make_each(self.kind(), item, ctx, |reader, session, key| {
            let stim_id = leaf(key)?;
            let series = reader.read_timeseries(&layout.stimulus_series(stim_id))?;
            commit(&StimulusAcquisition {
                session: session.clone(),
                stim_id: stim_id.to_string(),
                series,
            })
        })
    }
}
