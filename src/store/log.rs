//! Newline-delimited JSON append log shared by the durable pub/sub bus and
//! the durable task queue.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::util::lock::mutex_lock;

const SOURCE: &str = "store::log";

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("log encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("log `{path}` is corrupt at line {line}")]
    Corrupt { path: PathBuf, line: usize },
}

/// Line recording the highest id ever issued, written at the head of a
/// rewritten log so ids are not reused once their records are gone.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HighWater {
    high_water: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Line<T> {
    Record(T),
    Mark(HighWater),
}

/// Append-only record file. Every append is flushed and fsynced before it
/// returns, so a record that was acknowledged survives a crash.
#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AppendLog {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        debug!(target_module = SOURCE, path = %path.display(), "append log opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line and fsync.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<(), LogError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = mutex_lock(&self.file, SOURCE, "append");
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    /// Read every record from the start of the file.
    ///
    /// A malformed final line is treated as a torn write and skipped. A
    /// malformed line anywhere else is reported as [`LogError::Corrupt`].
    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>, LogError> {
        let _guard = mutex_lock(&self.file, SOURCE, "read_all");
        Ok(read_records(&self.path)?.0)
    }

    /// Like [`AppendLog::read_all`], also returning the high-water mark left
    /// by the last [`AppendLog::rewrite_marked`], if any.
    pub fn read_marked<T: DeserializeOwned>(&self) -> Result<(Vec<T>, Option<u64>), LogError> {
        let _guard = mutex_lock(&self.file, SOURCE, "read_marked");
        read_records(&self.path)
    }

    /// Read every record, pass them to `transform`, and atomically replace the
    /// file with whatever it returns. Returns the number of records written.
    ///
    /// Appends are blocked from the read until the replacement is reopened,
    /// so no record can slip in between. The replacement is written to a
    /// temporary file in the same directory, synced, and renamed over the log.
    pub fn rewrite_with<T, F>(&self, transform: F) -> Result<usize, LogError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Vec<T>) -> Vec<T>,
    {
        self.rewrite(None, transform)
    }

    /// [`AppendLog::rewrite_with`] that heads the new file with `high_water`,
    /// the highest id issued so far, for [`AppendLog::read_marked`].
    pub fn rewrite_marked<T, F>(&self, high_water: u64, transform: F) -> Result<usize, LogError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Vec<T>) -> Vec<T>,
    {
        self.rewrite(Some(high_water), transform)
    }

    fn rewrite<T, F>(&self, high_water: Option<u64>, transform: F) -> Result<usize, LogError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Vec<T>) -> Vec<T>,
    {
        let mut file = mutex_lock(&self.file, SOURCE, "rewrite");
        let (records, previous) = read_records(&self.path)?;
        let records = transform(records);
        let high_water = high_water.into_iter().chain(previous).max();
        let dir = parent_dir(&self.path);

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let writer = temp.as_file_mut();
            if let Some(high_water) = high_water {
                let mut line = serde_json::to_vec(&HighWater { high_water })?;
                line.push(b'\n');
                writer.write_all(&line)?;
            }
            for record in &records {
                let mut line = serde_json::to_vec(record)?;
                line.push(b'\n');
                writer.write_all(&line)?;
            }
            writer.sync_all()?;
        }
        temp.persist(&self.path).map_err(|err| err.error)?;
        sync_dir(dir);

        *file = open_append(&self.path)?;
        debug!(
            target_module = SOURCE,
            path = %self.path.display(),
            records = records.len(),
            "append log rewritten"
        );
        Ok(records.len())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|handle| handle.sync_all()) {
        warn!(
            target_module = SOURCE,
            dir = %dir.display(),
            error = %err,
            "failed to fsync directory after rename"
        );
    }
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) {}

fn read_records<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, Option<u64>), LogError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), None)),
        Err(err) => return Err(err.into()),
    };

    let lines: Vec<String> = BufReader::new(file).lines().collect::<Result<_, _>>()?;
    let last = lines.len();
    let mut records = Vec::with_capacity(last);
    let mut high_water = None;

    for (index, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(Line::Record(record)) => records.push(record),
            Ok(Line::Mark(mark)) => {
                high_water = Some(high_water.map_or(mark.high_water, |seen: u64| {
                    seen.max(mark.high_water)
                }));
            }
            Err(_) if index + 1 == last => {
                warn!(
                    target_module = SOURCE,
                    path = %path.display(),
                    line = index + 1,
                    "skipping torn trailing log record"
                );
            }
            Err(_) => {
                return Err(LogError::Corrupt {
                    path: path.to_path_buf(),
                    line: index + 1,
                });
            }
        }
    }

    Ok((records, high_water))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u64,
        name: String,
    }

    fn record(id: u64) -> Record {
        Record {
            id,
            name: format!("r{id}"),
        }
    }

    #[test]
    fn appended_records_read_back_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let log = AppendLog::open(dir.path().join("nested/events.log")).expect("open");

        for id in 1..=3 {
            log.append(&record(id)).expect("append");
        }

        let records: Vec<Record> = log.read_all().expect("read");
        assert_eq!(records, vec![record(1), record(2), record(3)]);
    }

    #[test]
    fn reopen_preserves_existing_records() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("events.log");
        {
            let log = AppendLog::open(&path).expect("open");
            log.append(&record(1)).expect("append");
        }
        let log = AppendLog::open(&path).expect("reopen");
        log.append(&record(2)).expect("append");

        let records: Vec<Record> = log.read_all().expect("read");
        assert_eq!(records, vec![record(1), record(2)]);
    }

    #[test]
    fn torn_trailing_line_is_skipped() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("events.log");
        fs::write(&path, "{\"id\":1,\"name\":\"r1\"}\n{\"id\":2,\"na").expect("write");

        let log = AppendLog::open(&path).expect("open");
        let records: Vec<Record> = log.read_all().expect("read");
        assert_eq!(records, vec![record(1)]);
    }

    #[test]
    fn corrupt_middle_line_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("events.log");
        fs::write(
            &path,
            "{\"id\":1,\"name\":\"r1\"}\nnot json\n{\"id\":3,\"name\":\"r3\"}\n",
        )
        .expect("write");

        let log = AppendLog::open(&path).expect("open");
        let err = log.read_all::<Record>().expect_err("corrupt");
        assert!(matches!(err, LogError::Corrupt { line: 2, .. }));
    }

    #[test]
    fn rewrite_replaces_contents_and_keeps_appending() {
        let dir = TempDir::new().expect("tempdir");
        let log = AppendLog::open(dir.path().join("events.log")).expect("open");
        for id in 1..=4 {
            log.append(&record(id)).expect("append");
        }

        let written = log
            .rewrite_with(|records: Vec<Record>| {
                records.into_iter().filter(|r| r.id >= 3).collect()
            })
            .expect("rewrite");
        assert_eq!(written, 2);
        log.append(&record(5)).expect("append after rewrite");

        let records: Vec<Record> = log.read_all().expect("read");
        assert_eq!(records, vec![record(3), record(4), record(5)]);
    }

    #[test]
    fn high_water_mark_outlives_the_records_it_covers() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("events.log");
        let log = AppendLog::open(&path).expect("open");
        for id in 1..=3 {
            log.append(&record(id)).expect("append");
        }

        log.rewrite_marked(3, |_: Vec<Record>| Vec::new())
            .expect("rewrite");
        log.rewrite_with(|records: Vec<Record>| records)
            .expect("plain rewrite keeps the mark");

        let reopened = AppendLog::open(&path).expect("reopen");
        let (records, high_water) = reopened.read_marked::<Record>().expect("read");
        assert!(records.is_empty());
        assert_eq!(high_water, Some(3));
        assert!(reopened.read_all::<Record>().expect("read").is_empty());
    }
}
