//! Append-only event log in the MindWare event file layout.
//!
//! Every file starts with two fixed rows: the column header, then a
//! `Start Event` with an empty name. Recording tools compute the offset of
//! every later event relative to that start event, so the layout below is
//! an external contract and must not drift:
//!
//! ```text
//! Event Type<TAB>Name<TAB>Date<TAB>Time
//! Start Event<TAB><TAB>MM/DD/YYYY<TAB>HH:MM:SS.mmm AM/PM
//! ```

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Column header, always the first line of the file.
pub const HEADER: &str = "Event Type\tName\tDate\tTime";

/// Event type of the mandatory first record.
pub const START_EVENT: &str = "Start Event";

/// `MM/DD/YYYY`
pub const DATE_FORMAT: &str = "%m/%d/%Y";

/// `HH:MM:SS.mmm AM/PM` on a 12-hour clock.
pub const TIME_FORMAT: &str = "%I:%M:%S%.3f %p";

/// Event log error.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Event log I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Event log already closed: {}", .0.display())]
    Closed(PathBuf),
    #[error("Event log lock poisoned")]
    Poisoned,
}

/// One durable record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub event_type: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    /// Create an event stamped with an explicit instant.
    #[must_use]
    pub fn new(event_type: &str, name: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type: sanitize(event_type),
            name: sanitize(name),
            timestamp,
        }
    }

    /// Format the record as one line, without the trailing newline.
    #[must_use]
    pub fn to_record(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}",
            self.event_type,
            self.name,
            self.timestamp.format(DATE_FORMAT),
            self.timestamp.format(TIME_FORMAT),
        )
    }
}

// Tabs and line breaks inside a field would shift columns or split a record.
fn sanitize(field: &str) -> String {
    field.replace(['\t', '\r', '\n'], " ")
}

struct Inner {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

/// Handle to an open event log file.
///
/// Clones share the same file. All appends go through a single lock, so
/// the order of lines on disk is the order in which `append` acquired it,
/// and the timestamp is taken under that lock so on-disk order and
/// timestamp order never disagree.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

impl EventLog {
    /// Create (or truncate) the file at `path` and write the header and
    /// the start event.
    ///
    /// # Errors
    /// Returns error if the file cannot be created or written.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EventLogError> {
        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(HEADER.as_bytes())?;
        writer.write_all(b"\n")?;

        let log = Self {
            inner: Arc::new(Inner {
                path,
                writer: Mutex::new(Some(writer)),
            }),
        };
        log.append(START_EVENT, "")?;

        tracing::debug!(path = %log.inner.path.display(), "Opened event log");
        Ok(log)
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Append one record stamped with the current UTC time.
    ///
    /// # Errors
    /// Returns error if the log is closed or the write fails.
    pub fn append(&self, event_type: &str, name: &str) -> Result<LogEvent, EventLogError> {
        let mut guard = self
            .inner
            .writer
            .lock()
            .map_err(|_| EventLogError::Poisoned)?;
        let writer = guard
            .as_mut()
            .ok_or_else(|| EventLogError::Closed(self.inner.path.clone()))?;

        let event = LogEvent::new(event_type, name, Utc::now());
        let mut line = event.to_record();
        line.push('\n');
        writer.write_all(line.as_bytes())?;
        writer.flush()?;

        Ok(event)
    }

    /// Flush, sync and release the file.
    ///
    /// Only the first call touches the file; later calls are no-ops.
    ///
    /// # Errors
    /// Returns error if the final flush or sync fails.
    pub fn close(&self) -> Result<(), EventLogError> {
        let mut guard = self
            .inner
            .writer
            .lock()
            .map_err(|_| EventLogError::Poisoned)?;
        let Some(mut writer) = guard.take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;

        tracing::debug!(path = %self.inner.path.display(), "Closed event log");
        Ok(())
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner
            .writer
            .lock()
            .map_or(true, |guard| guard.is_none())
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}
