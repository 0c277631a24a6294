//! Ephys CLI - Command-line interface for Ephys Ingest
//!
//! Commands:
//! - register: Register reference data and sessions from a manifest
//! - populate: Run population for one kind or every kind
//! - locate: Find the raw file of a session
//! - inspect: Print the structure of a container file
//! - invalidate: Delete an entity and everything derived from it
//! - demo: Write a synthetic session container
//! - doctor: Diagnose data directory and catalog health

use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use ephys_ingest::container::ContainerReader;
use ephys_ingest::demo::sample_session;
use ephys_ingest::types::{EntityKey, EntityKind};
use ephys_ingest::{
    register_manifest, FileLocator, IngestConfig, IngestError, PopulationEngine,
    PopulationReport, RegistrationManifest, SqliteCatalog, INGEST_VERSION,
};

/// Ephys - ingestion and trial segmentation for neurophysiology sessions
#[derive(Parser)]
#[command(name = "ephys")]
#[command(version = INGEST_VERSION)]
#[command(about = "Ingest raw session files and segment them by trial", long_about = None)]
struct Cli {
    /// SQLite catalog path
    #[arg(long, global = true, default_value = "ephys.sqlite")]
    catalog: PathBuf,

    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory scanned for raw session files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Worker threads for population
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register reference data and sessions from a manifest
    Register {
        /// Registration manifest (JSON)
        #[arg(short, long)]
        manifest: PathBuf,
    },

    /// Populate one kind, or every kind in dependency order
    Populate {
        /// Kind to populate (e.g. trial_set, trial_behavior) or "all"
        #[arg(long, default_value = "all")]
        kind: String,

        /// Output reports as JSON (default when stdout is not a terminal)
        #[arg(long)]
        json: bool,
    },

    /// Find the raw file of a session
    Locate {
        /// Subject id
        #[arg(long)]
        subject: String,

        /// Session start time (e.g. "2017-05-12 10:30:00")
        #[arg(long)]
        session_time: String,
    },

    /// Print the structure of a container file
    Inspect {
        /// Container file
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete an entity and everything derived from it
    Invalidate {
        /// Entity kind (e.g. behavior_acquisition)
        #[arg(long)]
        kind: String,

        /// Entity key: components separated by '/', or a JSON array of components
        #[arg(long)]
        key: String,
    },

    /// Write a synthetic session container
    Demo {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Subject id written to the header
        #[arg(long, default_value = "ANM244028")]
        subject: String,

        /// Session start time written to the header
        #[arg(long, default_value = "2017-05-12 10:30:00")]
        session_time: String,

        /// Number of trials
        #[arg(long, default_value = "20")]
        trials: usize,
    },

    /// Diagnose data directory and catalog health
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<IngestConfig, EphysCliError> {
    let mut config = match &cli.config {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::default().with_env()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<(), EphysCliError> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Register { manifest } => cmd_register(&cli.catalog, &manifest),
        Commands::Populate { kind, json } => {
            let json = json || !atty::is(atty::Stream::Stdout);
            cmd_populate(&cli.catalog, config, &kind, json)
        }
        Commands::Locate {
            subject,
            session_time,
        } => cmd_locate(&config, &subject, &session_time),
        Commands::Inspect { file, json } => cmd_inspect(&file, json),
        Commands::Invalidate { kind, key } => cmd_invalidate(&cli.catalog, config, &kind, &key),
        Commands::Demo {
            output,
            subject,
            session_time,
            trials,
        } => cmd_demo(&config, &output, &subject, &session_time, trials),
        Commands::Doctor { json } => cmd_doctor(&cli.catalog, &config, json),
    }
}

fn parse_kind(name: &str) -> Result<EntityKind, EphysCliError> {
    EntityKind::parse(name).ok_or_else(|| EphysCliError::UnknownKind(name.to_string()))
}

fn parse_time(config: &IngestConfig, text: &str) -> Result<NaiveDateTime, EphysCliError> {
    Ok(FileLocator::new(config).parse_session_time(text)?)
}

fn cmd_register(catalog_path: &Path, manifest_path: &Path) -> Result<(), EphysCliError> {
    let catalog = SqliteCatalog::open(catalog_path)?;
    let manifest = RegistrationManifest::from_file(manifest_path)?;
    let report = register_manifest(&catalog, &manifest)?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn cmd_populate(
    catalog_path: &Path,
    config: IngestConfig,
    kind: &str,
    json: bool,
) -> Result<(), EphysCliError> {
    let catalog = SqliteCatalog::open(catalog_path)?;
    let engine = PopulationEngine::new(&catalog, config);

    let reports = if kind == "all" {
        engine.populate_all()?
    } else {
        vec![engine.populate(parse_kind(kind)?)?]
    };

    if json {
        for report in &reports {
            println!("{}", serde_json::to_string(report)?);
        }
    } else {
        print_reports(&reports);
    }
    Ok(())
}

fn print_reports(reports: &[PopulationReport]) {
    println!(
        "{:<28} {:>9} {:>9} {:>12} {:>7}",
        "kind", "inserted", "skipped", "unavailable", "failed"
    );
    for report in reports {
        println!(
            "{:<28} {:>9} {:>9} {:>12} {:>7}",
            report.kind.as_str(),
            report.inserted,
            report.skipped,
            report.unavailable,
            report.failed
        );
    }

    let failures: Vec<_> = reports
        .iter()
        .flat_map(|r| r.failures.iter().map(move |f| (r.kind, f)))
        .collect();
    if !failures.is_empty() {
        println!("\nFailed keys:");
        for (kind, failure) in failures {
            println!("  [{}] {} {}: {}", failure.code, kind, failure.key, failure.message);
        }
    }
}

fn cmd_locate(config: &IngestConfig, subject: &str, session_time: &str) -> Result<(), EphysCliError> {
    let time = parse_time(config, session_time)?;
    let path = FileLocator::new(config).locate(subject, time, &config.data_dir)?;
    println!("{}", path.display());
    Ok(())
}

fn cmd_inspect(file: &Path, json: bool) -> Result<(), EphysCliError> {
    let reader = ContainerReader::open(file)?;
    let version = reader.version();
    let datasets = reader.datasets();

    if json {
        let listing = InspectReport {
            file: file.display().to_string(),
            version: format!("{}.{}", version.major, version.minor),
            datasets: datasets
                .into_iter()
                .map(|(path, dtype, shape)| DatasetEntry {
                    path,
                    dtype: dtype.as_str().to_string(),
                    shape,
                })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        println!("{} (format {}.{})", file.display(), version.major, version.minor);
        for (path, dtype, shape) in datasets {
            println!("  {:<60} {:<5} {:?}", path, dtype.as_str(), shape);
        }
    }
    Ok(())
}

fn cmd_invalidate(
    catalog_path: &Path,
    config: IngestConfig,
    kind: &str,
    key: &str,
) -> Result<(), EphysCliError> {
    let kind = parse_kind(kind)?;
    let catalog = SqliteCatalog::open(catalog_path)?;
    let engine = PopulationEngine::new(&catalog, config);
    let removed = engine.invalidate(kind, &EntityKey::parse(kind, key)?)?;
    println!("{}", serde_json::json!({ "kind": kind.as_str(), "key": key, "removed": removed }));
    Ok(())
}

fn cmd_demo(
    config: &IngestConfig,
    output: &Path,
    subject: &str,
    session_time: &str,
    trials: usize,
) -> Result<(), EphysCliError> {
    let time = parse_time(config, session_time)?;
    sample_session(subject, time, trials).write_file(output)?;
    log::info!("wrote {} trials for {} to {}", trials, subject, output.display());
    Ok(())
}

fn cmd_doctor(catalog_path: &Path, config: &IngestConfig, json: bool) -> Result<(), EphysCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "ingest_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Ephys Ingest version {}", INGEST_VERSION),
    });

    checks.push(DoctorCheck {
        name: "workers".to_string(),
        status: CheckStatus::Ok,
        message: format!("{} worker threads", config.workers),
    });

    if config.data_dir.is_dir() {
        match FileLocator::new(config).index(&config.data_dir) {
            Ok(index) if index.is_empty() => checks.push(DoctorCheck {
                name: "data_dir".to_string(),
                status: CheckStatus::Warning,
                message: format!("No readable session files in {}", config.data_dir.display()),
            }),
            Ok(index) => checks.push(DoctorCheck {
                name: "data_dir".to_string(),
                status: CheckStatus::Ok,
                message: format!(
                    "{} readable session files in {}",
                    index.len(),
                    config.data_dir.display()
                ),
            }),
            Err(e) => checks.push(DoctorCheck {
                name: "data_dir".to_string(),
                status: CheckStatus::Error,
                message: format!("Cannot scan {}: {}", config.data_dir.display(), e),
            }),
        }
    } else {
        checks.push(DoctorCheck {
            name: "data_dir".to_string(),
            status: CheckStatus::Error,
            message: format!("Data directory {} does not exist", config.data_dir.display()),
        });
    }

    if catalog_path.exists() {
        match SqliteCatalog::open(catalog_path).and_then(|c| c.schema_version()) {
            Ok(version) => checks.push(DoctorCheck {
                name: "catalog".to_string(),
                status: CheckStatus::Ok,
                message: format!("Catalog schema version {}", version),
            }),
            Err(e) => checks.push(DoctorCheck {
                name: "catalog".to_string(),
                status: CheckStatus::Error,
                message: format!("Cannot open catalog {}: {}", catalog_path.display(), e),
            }),
        }
    } else {
        checks.push(DoctorCheck {
            name: "catalog".to_string(),
            status: CheckStatus::Warning,
            message: format!("Catalog {} will be created on first use", catalog_path.display()),
        });
    }

    let report = DoctorReport {
        version: INGEST_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Ephys Doctor Report");
        println!("===================");
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(EphysCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Error types

#[derive(Debug)]
enum EphysCliError {
    Ingest(IngestError),
    Json(serde_json::Error),
    UnknownKind(String),
    DoctorFailed,
}

impl From<IngestError> for EphysCliError {
    fn from(e: IngestError) -> Self {
        EphysCliError::Ingest(e)
    }
}

impl From<serde_json::Error> for EphysCliError {
    fn from(e: serde_json::Error) -> Self {
        EphysCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<EphysCliError> for CliError {
    fn from(e: EphysCliError) -> Self {
        match e {
            EphysCliError::Ingest(e) => {
                let hint = match &e {
                    IngestError::NotFound { .. } => Some("Check --data-dir and the session's directory"),
                    IngestError::AmbiguousMatch { .. } => Some("Remove duplicate session files"),
                    IngestError::Config(_) => Some("Check the config file and EPHYS_* variables"),
                    IngestError::Storage(_) | IngestError::UnsupportedSchemaVersion { .. } => {
                        Some("Run 'ephys doctor' to check the catalog")
                    }
                    IngestError::ForeignKeyViolation { .. } => Some("Register the missing parent first"),
                    _ => None,
                };
                CliError {
                    code: e.code().to_string(),
                    message: e.to_string(),
                    hint: hint.map(str::to_string),
                }
            }
            EphysCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            EphysCliError::UnknownKind(kind) => CliError {
                code: "UNKNOWN_KIND".to_string(),
                message: format!("Unknown entity kind '{}'", kind),
                hint: Some("Use a name such as trial_set, behavior_acquisition or trial_behavior".to_string()),
            },
            EphysCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct InspectReport {
    file: String,
    version: String,
    datasets: Vec<DatasetEntry>,
}

#[derive(serde::Serialize)]
struct DatasetEntry {
    path: String,
    dtype: String,
    shape: Vec<usize>,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
