//! Per-kind make steps
//!
//! One [`Populator`] per populated kind:
//! - [`TrialSetPopulator`] reads epochs and analysis vectors into a trial set
//! - acquisition populators read one timeseries per locus and modality type
//! - [`SegmentPopulator`] slices each acquisition by the trials of its session

mod acquisitions;
mod segments;
mod trials;

pub use acquisitions::{
    BehaviorPopulator, ExtracellularPopulator, IntracellularPopulator, StimulusPopulator,
};
pub use segments::SegmentPopulator;
pub use trials::{read_trial_set, TrialSetPopulator};

use std::collections::BTreeMap;

use crate::catalog::{Catalog, CatalogExt};
use crate::container::ContainerReader;
use crate::error::IngestError;
use crate::population::{Populator, WorkItem};
use crate::types::{EntityKey, EntityKind, LookupTable, Session, SessionKey};

/// A populator for every kind in [`EntityKind::POPULATED`]
pub fn standard_populators() -> Vec<Box<dyn Populator>> {
    let mut populators: Vec<Box<dyn Populator>> = vec![
        Box::new(TrialSetPopulator),
        Box::new(BehaviorPopulator),
        Box::new(IntracellularPopulator),
        Box::new(ExtracellularPopulator),
        Box::new(StimulusPopulator),
    ];
    for kind in EntityKind::POPULATED {
        if let Some(segments) = SegmentPopulator::new(kind) {
            populators.push(Box::new(segments));
        }
    }
    populators
}

/// Values of one controlled vocabulary
pub(crate) fn lookup_values(
    catalog: &dyn Catalog,
    table: LookupTable,
) -> Result<Vec<String>, IngestError> {
    Ok(catalog
        .keys(EntityKind::Lookup(table))?
        .into_iter()
        .filter_map(|key| key.parts().first().cloned())
        .collect())
}

/// The registered session owning `key`
pub(crate) fn load_session(
    catalog: &dyn Catalog,
    kind: EntityKind,
    key: &EntityKey,
) -> Result<Session, IngestError> {
    let session_key = SessionKey::from_entity_key(key)?.entity_key();
    catalog
        .fetch(EntityKind::Session, &session_key)?
        .ok_or_else(|| IngestError::ForeignKeyViolation {
            kind,
            key: key.clone(),
            parent_kind: EntityKind::Session,
            parent_key: session_key,
        })
}

/// Group keys into one work item per session
pub(crate) fn group_by_session(keys: Vec<EntityKey>) -> Result<Vec<WorkItem>, IngestError> {
    let mut groups: BTreeMap<EntityKey, Vec<EntityKey>> = BTreeMap::new();
    for key in keys {
        let session = SessionKey::from_entity_key(&key)?.entity_key();
        groups.entry(session).or_default().push(key);
    }
    Ok(groups
        .into_iter()
        .map(|(parent, keys)| WorkItem::new(parent, keys))
        .collect())
}

/// Last component of a key
pub(crate) fn leaf(key: &EntityKey) -> Result<&str, IngestError> {
    key.parts()
        .last()
        .map(String::as_str)
        .ok_or_else(|| IngestError::MalformedDescriptor("empty entity key".to_string()))
}

/// Timeseries group of one locus: `<base>/<locus>/<type>` when the file
/// separates loci, `<base>/<type>` otherwise
pub(crate) fn locus_series(reader: &ContainerReader, base: &str, locus: &str, series: &str) -> String {
    let nested = format!("{}/{}/{}", base, locus, series);
    if reader.has(&nested) {
        nested
    } else {
        format!("{}/{}", base, series)
    }
}
