//! Population engine
//!
//! Drives every [`Populator`] in dependency order. Each call to
//! [`PopulationEngine::populate`] is one batch run for one kind:
//! 1. ask the populator for candidate keys, grouped into work items
//! 2. count keys already in the catalog as skipped
//! 3. run the remaining work items on a worker pool; each job makes its
//!    keys and commits each key atomically
//! 4. tally per-key outcomes into a [`PopulationReport`]
//!
//! Per-key failures never abort the batch. Only a fatal (storage) failure
//! stops the run: remaining jobs are drained unrun and the error is returned.

use chrono::{DateTime, Utc};
use crossbeam_channel::unbounded;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::catalog::{Catalog, Record};
use crate::config::IngestConfig;
use crate::container::ContainerReader;
use crate::error::{FailureKind, IngestError};
use crate::locator::{FileLocator, LocatorIndex};
use crate::populators::standard_populators;
use crate::types::{EntityKey, EntityKind, Session};

/// Pending keys of one job, grouped under the upstream row they share
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub parent: EntityKey,
    pub keys: Vec<EntityKey>,
}

impl WorkItem {
    pub fn new(parent: EntityKey, keys: Vec<EntityKey>) -> Self {
        Self { parent, keys }
    }
}

/// Records of one key, inserted all-or-nothing
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub key: EntityKey,
    pub records: Vec<Record>,
}

/// Outcome of making one key
pub type KeyOutcome = (EntityKey, Result<Commit, IngestError>);

/// Make-step for one populated kind
pub trait Populator: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Every key computable from the upstream entities now in the catalog,
    /// including keys that already exist
    fn key_source(&self, catalog: &dyn Catalog) -> Result<Vec<WorkItem>, IngestError>;

    /// Make the item's keys. An `Err` applies to every key of the item.
    fn make(&self, item: &WorkItem, ctx: &MakeContext<'_>) -> Result<Vec<KeyOutcome>, IngestError>;
}

/// Shared state handed to every make-step of one run
pub struct MakeContext<'a> {
    pub catalog: &'a dyn Catalog,
    pub config: &'a IngestConfig,
    locator: FileLocator,
    indexes: Mutex<HashMap<PathBuf, Arc<LocatorIndex>>>,
}

impl<'a> MakeContext<'a> {
    pub fn new(catalog: &'a dyn Catalog, config: &'a IngestConfig) -> Self {
        Self {
            catalog,
            config,
            locator: FileLocator::new(config),
            indexes: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding a session's raw files
    pub fn session_directory(&self, session: &Session) -> PathBuf {
        if session.directory.is_empty() {
            self.config.data_dir.clone()
        } else {
            PathBuf::from(&session.directory)
        }
    }

    /// Locate a session's raw file; each directory is indexed once per run
    pub fn locate(&self, session: &Session) -> Result<PathBuf, IngestError> {
        let directory = self.session_directory(session);
        self.index(&directory)?.resolve(&session.key)
    }

    /// Open a session's raw file
    pub fn open(&self, session: &Session) -> Result<ContainerReader, IngestError> {
        let path = self.locate(session)?;
        log::debug!("session {} -> {}", session.key, path.display());
        ContainerReader::open(path)
    }

    fn index(&self, directory: &Path) -> Result<Arc<LocatorIndex>, IngestError> {
        let mut indexes = self
            .indexes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(index) = indexes.get(directory) {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(self.locator.index(directory)?);
        indexes.insert(directory.to_path_buf(), Arc::clone(&index));
        Ok(index)
    }
}

/// One failed key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// Result of one batch run for one kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationReport {
    pub run_id: Uuid,
    pub kind: EntityKind,
    pub inserted: usize,
    /// Keys already present before or during the run
    pub skipped: usize,
    /// Keys with no raw data to ingest
    pub unavailable: usize,
    /// Keys whose data or references were bad
    pub failed: usize,
    pub failures: Vec<KeyFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PopulationReport {
    fn new(kind: EntityKind) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            kind,
            inserted: 0,
            skipped: 0,
            unavailable: 0,
            failed: 0,
            failures: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn total(&self) -> usize {
        self.inserted + self.skipped + self.unavailable + self.failed
    }

    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Inserted => self.inserted += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Unavailable => self.unavailable += 1,
            JobOutcome::Failed(failure) => {
                self.failed += 1;
                self.failures.push(failure);
            }
        }
    }
}

enum JobOutcome {
    Inserted,
    Skipped,
    Unavailable,
    Failed(KeyFailure),
}

enum WorkerMessage {
    Key(JobOutcome),
    Fatal(IngestError),
}

/// Runs populators against a catalog
pub struct PopulationEngine<'a> {
    catalog: &'a dyn Catalog,
    config: IngestConfig,
    populators: Vec<Box<dyn Populator>>,
}

impl<'a> PopulationEngine<'a> {
    /// Engine with a populator for every kind in [`EntityKind::POPULATED`]
    pub fn new(catalog: &'a dyn Catalog, config: IngestConfig) -> Self {
        Self::with_populators(catalog, config, standard_populators())
    }

    pub fn with_populators(
        catalog: &'a dyn Catalog,
        config: IngestConfig,
        populators: Vec<Box<dyn Populator>>,
    ) -> Self {
        Self {
            catalog,
            config,
            populators,
        }
    }

    /// Populate every outstanding key of one kind.
    ///
    /// # Returns
    /// Per-key tallies, or the fatal error that stopped the run
    pub fn populate(&self, kind: EntityKind) -> Result<PopulationReport, IngestError> {
        let populator = self
            .populators
            .iter()
            .find(|p| p.kind() == kind)
            .ok_or_else(|| IngestError::Config(format!("{} is not a populated kind", kind)))?;

        let mut report = PopulationReport::new(kind);
        let mut jobs = Vec::new();
        for item in populator.key_source(self.catalog)? {
            let mut pending = Vec::new();
            for key in item.keys {
                if self.catalog.exists(kind, &key)? {
                    report.skipped += 1;
                } else {
                    pending.push(key);
                }
            }
            if !pending.is_empty() {
                jobs.push(WorkItem::new(item.parent, pending));
            }
        }

        log::info!(
            "populating {}: {} jobs, {} keys already present",
            kind,
            jobs.len(),
            report.skipped
        );

        let ctx = MakeContext::new(self.catalog, &self.config);
        let fatal = self.run_jobs(populator.as_ref(), &ctx, jobs, &mut report);

        report.finished_at = Utc::now();
        if let Some(err) = fatal {
            log::error!("populating {} aborted: {}", kind, err);
            return Err(err);
        }

        log::info!(
            "populated {}: {} inserted, {} skipped, {} unavailable, {} failed",
            kind,
            report.inserted,
            report.skipped,
            report.unavailable,
            report.failed
        );
        Ok(report)
    }

    /// Populate every registered kind in order; each kind finishes before
    /// the next starts
    pub fn populate_all(&self) -> Result<Vec<PopulationReport>, IngestError> {
        self.run_order()?
            .into_iter()
            .map(|kind| self.populate(kind))
            .collect()
    }

    /// Populator kinds in registration order, checked so that no kind runs
    /// before a populated kind it depends on
    fn run_order(&self) -> Result<Vec<EntityKind>, IngestError> {
        let kinds: Vec<EntityKind> = self.populators.iter().map(|p| p.kind()).collect();
        for (idx, kind) in kinds.iter().enumerate() {
            if let Some(dep) = kind
                .dependencies()
                .iter()
                .find(|dep| kinds[idx + 1..].contains(dep))
            {
                return Err(IngestError::Config(format!(
                    "{} is populated before its dependency {}",
                    kind, dep
                )));
            }
        }
        Ok(kinds)
    }

    /// Delete one entity and everything derived from it so the next run
    /// rebuilds it. Returns the number of records removed.
    pub fn invalidate(&self, kind: EntityKind, key: &EntityKey) -> Result<usize, IngestError> {
        let removed = self.catalog.delete(kind, key)?;
        log::info!("invalidated {} {}: {} records removed", kind, key, removed);
        Ok(removed)
    }

    fn run_jobs(
        &self,
        populator: &dyn Populator,
        ctx: &MakeContext<'_>,
        jobs: Vec<WorkItem>,
        report: &mut PopulationReport,
    ) -> Option<IngestError> {
        if jobs.is_empty() {
            return None;
        }

        let workers = self.config.workers.clamp(1, jobs.len());
        let (job_tx, job_rx) = unbounded::<WorkItem>();
        let (out_tx, out_rx) = unbounded::<WorkerMessage>();
        for job in jobs {
            // receiver outlives this loop, send cannot fail
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let abort = AtomicBool::new(false);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let out_tx = out_tx.clone();
                let abort = &abort;
                scope.spawn(move || {
                    for item in job_rx.iter() {
                        if abort.load(Ordering::SeqCst) {
                            continue;
                        }
                        run_job(populator, ctx, &item, &out_tx, abort);
                    }
                });
            }
        });
        drop(out_tx);

        let mut fatal = None;
        for message in out_rx.try_iter() {
            match message {
                WorkerMessage::Key(outcome) => report.record(outcome),
                WorkerMessage::Fatal(err) => {
                    if fatal.is_none() {
                        fatal = Some(err);
                    }
                }
            }
        }
        fatal
    }
}

fn run_job(
    populator: &dyn Populator,
    ctx: &MakeContext<'_>,
    item: &WorkItem,
    out: &crossbeam_channel::Sender<WorkerMessage>,
    abort: &AtomicBool,
) {
    let kind = populator.kind();
    let outcomes = match populator.make(item, ctx) {
        Ok(outcomes) => outcomes,
        Err(err) => {
            if err.is_fatal() {
                abort.store(true, Ordering::SeqCst);
                let _ = out.send(WorkerMessage::Fatal(err));
                return;
            }
            for key in &item.keys {
                let _ = out.send(WorkerMessage::Key(classify(kind, key, &err)));
            }
            return;
        }
    };

    for (key, outcome) in outcomes {
        let result = outcome.and_then(|commit| {
            let n = commit.records.len();
            ctx.catalog.insert_all(commit.records).map(|()| n)
        });

        let message = match result {
            Ok(n) => {
                log::debug!("inserted {} {} ({} records)", kind, key, n);
                WorkerMessage::Key(JobOutcome::Inserted)
            }
            Err(err) if err.is_fatal() => {
                abort.store(true, Ordering::SeqCst);
                WorkerMessage::Fatal(err)
            }
            Err(err) => WorkerMessage::Key(classify(kind, &key, &err)),
        };
        let _ = out.send(message);
    }
}

fn classify(kind: EntityKind, key: &EntityKey, err: &IngestError) -> JobOutcome {
    match err.failure_kind() {
        FailureKind::Duplicate => JobOutcome::Skipped,
        FailureKind::Unavailable => {
            log::warn!("{} {} unavailable: {}", kind, key, err);
            JobOutcome::Unavailable
        }
        FailureKind::DataCondition | FailureKind::ForeignKey | FailureKind::Fatal => {
            log::warn!("{} {} failed [{}]: {}", kind, key, err.code(), err);
            JobOutcome::Failed(KeyFailure {
                key: key.to_string(),
                code: err.code().to_string(),
                message: err.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::types::LookupTable;
    use serde_json::json;

    /// Populates lookup-like rows whose key names its own fate
    struct Scripted;

    impl Populator for Scripted {
        fn kind(&self) -> EntityKind {
            EntityKind::Lookup(LookupTable::Device)
        }

        fn key_source(&self, _catalog: &dyn Catalog) -> Result<Vec<WorkItem>, IngestError> {
            let keys = ["ok_1", "ok_2", "missing", "bad"]
                .iter()
                .map(|k| EntityKey::from(vec![*k]))
                .collect();
            Ok(vec![
                WorkItem::new(EntityKey::from(vec!["batch"]), keys),
                WorkItem::new(
                    EntityKey::from(vec!["absent_file"]),
                    vec![EntityKey::from(vec!["absent_1"])],
                ),
            ])
        }

        fn make(&self, item: &WorkItem, _ctx: &MakeContext<'_>) -> Result<Vec<KeyOutcome>, IngestError> {
            if item.parent.parts()[0] == "absent_file" {
                return Err(IngestError::NotFound {
                    subject_id: "ANM000000".to_string(),
                    session_time: "2017-05-12 10:30:00".to_string(),
                });
            }
            Ok(item
                .keys
                .iter()
                .map(|key| {
                    let outcome = match key.parts()[0].as_str() {
                        "missing" => Err(IngestError::MissingField("x".to_string())),
                        "bad" => Err(IngestError::MalformedDescriptor("y".to_string())),
                        _ => Ok(Commit {
                            key: key.clone(),
                            records: vec![Record {
                                kind: self.kind(),
                                key: key.clone(),
                                refs: vec![],
                                attributes: json!({}),
                            }],
                        }),
                    };
                    (key.clone(), outcome)
                })
                .collect())
        }
    }

    #[test]
    fn test_report_tallies_each_outcome() {
        let catalog = MemoryCatalog::new();
        let engine = PopulationEngine::with_populators(
            &catalog,
            IngestConfig::default(),
            vec![Box::new(Scripted)],
        );

        let report = engine.populate(EntityKind::Lookup(LookupTable::Device)).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.unavailable, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].code, "MALFORMED_DESCRIPTOR");
        assert_eq!(report.total(), 5);

        let again = engine.populate(EntityKind::Lookup(LookupTable::Device)).unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.skipped, 2);
        assert_ne!(again.run_id, report.run_id);
    }

    #[test]
    fn test_unknown_kind_is_config_error() {
        let catalog = MemoryCatalog::new();
        let engine =
            PopulationEngine::with_populators(&catalog, IngestConfig::default(), Vec::new());
        assert!(matches!(
            engine.populate(EntityKind::TrialSet),
            Err(IngestError::Config(_))
        ));
    }

    #[test]
    fn test_populate_all_rejects_out_of_order_populators() {
        use crate::populators::{SegmentPopulator, TrialSetPopulator};

        let catalog = MemoryCatalog::new();
        let segments = SegmentPopulator::new(EntityKind::TrialBehavior).unwrap();
        let engine = PopulationEngine::with_populators(
            &catalog,
            IngestConfig::default(),
            vec![Box::new(segments), Box::new(TrialSetPopulator)],
        );
        assert!(matches!(engine.populate_all(), Err(IngestError::Config(_))));
    }

    #[test]
    fn test_standard_populators_run_in_populated_order() {
        let catalog = MemoryCatalog::new();
        let engine = PopulationEngine::new(&catalog, IngestConfig::default());
        assert_eq!(engine.run_order().unwrap(), EntityKind::POPULATED.to_vec());
    }

    struct Unreachable;

    impl Populator for Unreachable {
        fn kind(&self) -> EntityKind {
            EntityKind::TrialSet
        }

        fn key_source(&self, _catalog: &dyn Catalog) -> Result<Vec<WorkItem>, IngestError> {
            Ok((0..8)
                .map(|i| {
                    let key = EntityKey::from(vec![format!("k{}", i)]);
                    WorkItem::new(key.clone(), vec![key])
                })
                .collect())
        }

        fn make(&self, _item: &WorkItem, _ctx: &MakeContext<'_>) -> Result<Vec<KeyOutcome>, IngestError> {
            Err(IngestError::Storage(rusqlite::Error::InvalidQuery))
        }
    }

    #[test]
    fn test_fatal_error_aborts_run() {
        let catalog = MemoryCatalog::new();
        let mut config = IngestConfig::default();
        config.workers = 2;
        let engine = PopulationEngine::with_populators(&catalog, config, vec![Box::new(Unreachable)]);

        assert!(matches!(
            engine.populate(EntityKind::TrialSet),
            Err(IngestError::Storage(_))
        ));
    }
}
