//! Ephys Ingest - ingestion and trial segmentation for neurophysiology sessions
//!
//! Raw session files flow through a fixed sequence of stages:
//! file location → container reading → semantic decoding → entity graph
//! population → per-trial segmentation.
//!
//! ## Modules
//!
//! - **Container**: the self-describing binary session format, read lazily
//! - **Locator**: finds the raw file of a registered session by its header
//! - **Catalog**: keyed entity storage with reference checks (memory, SQLite)
//! - **Population**: idempotent, resumable make-steps over the dependency graph
//! - **Segmentation**: binary-search slicing of streams by trial window

pub mod catalog;
pub mod config;
pub mod container;
pub mod decoders;
pub mod demo;
pub mod error;
pub mod locator;
pub mod population;
pub mod populators;
pub mod reference;
pub mod segmentation;
pub mod types;

pub use catalog::{Catalog, CatalogExt, MemoryCatalog, Record, SqliteCatalog};
pub use config::{ContainerLayout, IngestConfig};
pub use container::{ContainerBuilder, ContainerReader};
pub use error::{FailureKind, IngestError};
pub use locator::FileLocator;
pub use population::{PopulationEngine, PopulationReport};
pub use reference::{register_manifest, RegistrationManifest};
pub use segmentation::{segment, TrialWindow};

/// Crate version, reported by the CLI
pub const INGEST_VERSION: &str = env!("CARGO_PKG_VERSION");
