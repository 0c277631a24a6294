//! Raw file discovery
//!
//! Matches a session key against the subject id and session start time
//! embedded in each candidate container. Only structure and the two header
//! datasets are read; sample payloads are never touched.

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::IngestConfig;
use crate::container::{ContainerReader, DatasetValue};
use crate::error::IngestError;
use crate::types::SessionKey;

/// Identity embedded in a container header
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileHeader {
    pub subject_id: String,
    pub session_time: NaiveDateTime,
}

/// Finds the raw container file of a session
#[derive(Debug, Clone)]
pub struct FileLocator {
    subject_path: String,
    time_path: String,
    time_formats: Vec<String>,
}

impl FileLocator {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            subject_path: config.layout.subject_id.clone(),
            time_path: config.layout.session_start_time.clone(),
            time_formats: config.time_formats.clone(),
        }
    }

    /// Locate the one file in `directory` whose header matches the session.
    ///
    /// Unreadable candidates are skipped with a warning. No match is
    /// `NotFound`; more than one is `AmbiguousMatch`.
    pub fn locate(
        &self,
        subject_id: &str,
        session_time: NaiveDateTime,
        directory: &Path,
    ) -> Result<PathBuf, IngestError> {
        self.index(directory)?
            .resolve(&SessionKey::new(subject_id, session_time))
    }

    /// Read the header of every readable candidate in `directory`
    pub fn index(&self, directory: &Path) -> Result<LocatorIndex, IngestError> {
        let mut files: BTreeMap<FileHeader, Vec<PathBuf>> = BTreeMap::new();
        let mut skipped = 0;

        for path in candidates(directory)? {
            match self.read_header(&path) {
                Ok(header) => files.entry(header).or_default().push(path),
                Err(err) => {
                    skipped += 1;
                    log::warn!("skipping candidate {}: {}", path.display(), err);
                }
            }
        }

        log::debug!(
            "indexed {} containers in {} ({} skipped)",
            files.values().map(Vec::len).sum::<usize>(),
            directory.display(),
            skipped
        );
        Ok(LocatorIndex { files })
    }

    /// Subject id and session start time of one file
    pub fn read_header(&self, path: &Path) -> Result<FileHeader, IngestError> {
        let mut reader = ContainerReader::open(path)?;
        let subject_id = reader.read_string(&self.subject_path)?.trim().to_string();

        let session_time = match reader.read(&self.time_path)? {
            DatasetValue::Utf8(_) | DatasetValue::U8(_) => {
                let text = reader.read_string(&self.time_path)?;
                self.parse_session_time(&text)?
            }
            _ => from_unix_seconds(reader.read_f64_scalar(&self.time_path)?)?,
        };

        Ok(FileHeader {
            subject_id,
            session_time,
        })
    }

    /// Parse a stored start time with the first format matching its prefix.
    ///
    /// Sub-second precision is dropped to match session keys.
    pub fn parse_session_time(&self, text: &str) -> Result<NaiveDateTime, IngestError> {
        let text = text.trim();
        self.time_formats
            .iter()
            .find_map(|format| NaiveDateTime::parse_and_remainder(text, format).ok())
            .and_then(|(time, _)| time.with_nanosecond(0))
            .ok_or_else(|| {
                IngestError::MalformedDescriptor(format!("unrecognized session start time '{}'", text))
            })
    }
}

fn from_unix_seconds(seconds: f64) -> Result<NaiveDateTime, IngestError> {
    if !seconds.is_finite() {
        return Err(IngestError::MalformedDescriptor(format!(
            "session start time {} is not a timestamp",
            seconds
        )));
    }
    DateTime::<Utc>::from_timestamp(seconds.floor() as i64, 0)
        .map(|t| t.naive_utc())
        .ok_or_else(|| {
            IngestError::MalformedDescriptor(format!("session start time {} out of range", seconds))
        })
}

/// Regular files of a directory in name order
fn candidates(directory: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Header index of one directory
#[derive(Debug, Clone, Default)]
pub struct LocatorIndex {
    files: BTreeMap<FileHeader, Vec<PathBuf>>,
}

impl LocatorIndex {
    pub fn resolve(&self, session: &SessionKey) -> Result<PathBuf, IngestError> {
        let header = FileHeader {
            subject_id: session.subject_id.clone(),
            session_time: session.session_time,
        };

        match self.files.get(&header).map(Vec::as_slice) {
            Some([path]) => Ok(path.clone()),
            Some(matches) if !matches.is_empty() => Err(IngestError::AmbiguousMatch {
                subject_id: session.subject_id.clone(),
                session_time: session.time_label(),
                matches: matches.to_vec(),
            }),
            _ => Err(IngestError::NotFound {
                subject_id: session.subject_id.clone(),
                session_time: session.time_label(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerBuilder;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn time(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2017, 5, 12)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn write_header(dir: &Path, name: &str, subject: &str, start: DatasetValue) {
        let mut builder = ContainerBuilder::new();
        builder
            .dataset("general/subject/subject_id", DatasetValue::text(subject))
            .dataset("session_start_time", start);
        builder.write_file(dir.join(name)).unwrap();
    }

    fn locator() -> FileLocator {
        FileLocator::new(&IngestConfig::default())
    }

    #[test]
    fn test_locate_one_of_three() {
        let dir = TempDir::new().unwrap();
        write_header(dir.path(), "a.ephc", "ANM244028", DatasetValue::text("2017-05-12T09:00:00"));
        write_header(dir.path(), "b.ephc", "ANM244028", DatasetValue::text("2017-05-12T10:30:00.250-04:00"));
        write_header(dir.path(), "c.ephc", "ANM255200", DatasetValue::text("2017-05-12T10:30:00"));

        let found = locator()
            .locate("ANM244028", time(10, 30), dir.path())
            .unwrap();
        assert_eq!(found, dir.path().join("b.ephc"));
    }

    #[test]
    fn test_locate_not_found() {
        let dir = TempDir::new().unwrap();
        write_header(dir.path(), "a.ephc", "ANM244028", DatasetValue::text("2017-05-12T09:00:00"));

        let err = locator()
            .locate("ANM244028", time(10, 30), dir.path())
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound { .. }));
    }

    #[test]
    fn test_unreadable_candidates_are_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a container").unwrap();
        let mut no_header = ContainerBuilder::new();
        no_header.dataset("analysis/good_trials", DatasetValue::f64_vec(vec![1.0]));
        no_header.write_file(dir.path().join("partial.ephc")).unwrap();
        write_header(dir.path(), "z.ephc", "ANM244028", DatasetValue::text("2017-05-12 10:30:00"));

        let index = locator().index(dir.path()).unwrap();
        assert_eq!(index.len(), 1);
        assert!(locator().locate("ANM244028", time(10, 30), dir.path()).is_ok());
    }

    #[test]
    fn test_multiple_matches_are_ambiguous() {
        let dir = TempDir::new().unwrap();
        write_header(dir.path(), "a.ephc", "ANM244028", DatasetValue::text("2017-05-12T10:30:00"));
        write_header(dir.path(), "b.ephc", "ANM244028", DatasetValue::text("Fri May 12 2017 10:30:00"));

        match locator().locate("ANM244028", time(10, 30), dir.path()) {
            Err(IngestError::AmbiguousMatch { matches, .. }) => assert_eq!(matches.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_numeric_start_time_is_unix_seconds() {
        let dir = TempDir::new().unwrap();
        let epoch = time(10, 30).and_utc().timestamp() as f64;
        write_header(dir.path(), "a.ephc", "ANM244028", DatasetValue::scalar(epoch));

        let header = locator().read_header(&dir.path().join("a.ephc")).unwrap();
        assert_eq!(header.session_time, time(10, 30));
    }

    #[test]
    fn test_parse_session_time_formats() {
        let locator = locator();
        assert_eq!(
            locator.parse_session_time("Fri May 12 10:30:00 2017").unwrap(),
            time(10, 30)
        );
        assert!(matches!(
            locator.parse_session_time("yesterday"),
            Err(IngestError::MalformedDescriptor(_))
        ));
    }
}
