//! Per-stream durable log.
//!
//! One JSONL file per stream; each line is one [`Event`]. The file is the source
//! of truth. On open it is replayed to rebuild two derived indexes: id → position
//! (for back-link traversal) and a time-sorted index (for range reads over long
//! histories). A torn final line left by a crash mid-write is truncated away.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{ContinuumError, Result};
use crate::events::types::{Event, StreamKey};

#[derive(Debug, Clone)]
struct IndexEntry {
    id: String,
    offset: u64,
    len: usize,
    timestamp: DateTime<Utc>,
}

/// An open stream log with its rebuilt indexes.
#[derive(Debug)]
pub struct StreamLog {
    path: PathBuf,
    file: File,
    entries: Vec<IndexEntry>,
    by_id: HashMap<String, usize>,
    by_time: BTreeSet<(DateTime<Utc>, usize)>,
    end: u64,
}

/// File location of a stream's log under `root`.
pub fn stream_path(root: &Path, key: &StreamKey) -> PathBuf {
    root.join(encode_component(&key.user_id))
        .join(encode_component(&key.project_id))
        .join(format!("{}.jsonl", encode_component(&key.branch)))
}

/// Percent-encode anything that is not safe as a single path component.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, b) in raw.bytes().enumerate() {
        let safe = b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || (b == b'.' && i > 0);
        if safe {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

impl StreamLog {
    /// Open (or create) the log at `path` and replay it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut log = Self {
            path,
            file,
            entries: Vec::new(),
            by_id: HashMap::new(),
            by_time: BTreeSet::new(),
            end: 0,
        };
        log.replay()?;
        Ok(log)
    }

    fn replay(&mut self) -> Result<()> {
        let total = self.file.metadata()?.len();
        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut offset = 0u64;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }
            let is_last = offset + read as u64 >= total;
            let complete = line.last() == Some(&b'\n');

            let parsed = if complete {
                serde_json::from_slice::<Event>(&line[..line.len() - 1]).ok()
            } else {
                None
            };

            let event = match parsed {
                Some(event) => event,
                None if is_last => {
                    tracing::warn!(
                        path = %self.path.display(),
                        offset,
                        bytes = read,
                        "truncating torn tail of stream log"
                    );
                    self.file.set_len(offset)?;
                    self.file.sync_data()?;
                    break;
                }
                None => {
                    return Err(self.corrupt(format!("undecodable entry at byte {offset}")));
                }
            };

            let expected = self.entries.last().map(|e| e.id.as_str());
            if event.previous_id.as_deref() != expected {
                return Err(self.corrupt(format!(
                    "event {} links to {:?}, expected {:?}",
                    event.id, event.previous_id, expected
                )));
            }

            self.index(&event, offset, read);
            offset += read as u64;
        }

        self.end = offset;
        tracing::debug!(path = %self.path.display(), events = self.entries.len(), "stream log replayed");
        Ok(())
    }

    fn corrupt(&self, reason: String) -> ContinuumError {
        ContinuumError::CorruptLog {
            path: self.path.display().to_string(),
            reason,
        }
    }

    fn index(&mut self, event: &Event, offset: u64, len: usize) {
        let pos = self.entries.len();
        self.entries.push(IndexEntry {
            id: event.id.clone(),
            offset,
            len,
            timestamp: event.timestamp,
        });
        self.by_id.insert(event.id.clone(), pos);
        self.by_time.insert((event.timestamp, pos));
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Id of the newest event.
    pub fn head(&self) -> Option<&str> {
        self.entries.last().map(|e| e.id.as_str())
    }

    pub fn head_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|e| e.timestamp)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Position of the newest event with `timestamp <= at`.
    pub fn latest_at_or_before(&self, at: DateTime<Utc>) -> Option<usize> {
        self.by_time
            .range(..=(at, usize::MAX))
            .next_back()
            .map(|(_, pos)| *pos)
    }

    /// Ids of events strictly after `pos` (all events when `pos` is `None`).
    pub fn ids_after(&self, pos: Option<usize>) -> impl Iterator<Item = &str> {
        let start = pos.map(|p| p + 1).unwrap_or(0);
        self.entries[start.min(self.entries.len())..]
            .iter()
            .map(|e| e.id.as_str())
    }

    /// Durably append one event. The event's back-link must point at the current head.
    ///
    /// Returns only after the bytes are flushed to stable storage.
    pub fn append(&mut self, event: &Event) -> Result<()> {
        if event.previous_id.as_deref() != self.head() {
            return Err(ContinuumError::InvalidEvent(format!(
                "event {} does not link to stream head",
                event.id
            )));
        }

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        if let Err(err) = self.write_line(&line) {
            // Drop any partial bytes so the next append starts on a clean boundary.
            if let Err(trunc) = self.file.set_len(self.end) {
                tracing::error!(path = %self.path.display(), error = %trunc, "failed to roll back partial write");
            }
            return Err(ContinuumError::AppendFailure(err));
        }

        let offset = self.end;
        self.end += line.len() as u64;
        self.index(event, offset, line.len());
        Ok(())
    }

    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line)?;
        self.file.sync_data()
    }

    /// Read the event stored at `pos`.
    pub fn read_at(&mut self, pos: usize) -> Result<Event> {
        let entry = self
            .entries
            .get(pos)
            .ok_or_else(|| self.corrupt(format!("index position {pos} out of range")))?
            .clone();

        let mut buf = vec![0u8; entry.len];
        self.file.seek(SeekFrom::Start(entry.offset))?;
        self.file.read_exact(&mut buf)?;

        let event: Event = serde_json::from_slice(buf.trim_ascii_end())?;
        if event.id != entry.id {
            return Err(self.corrupt(format!(
                "index points at {} but found {}",
                entry.id, event.id
            )));
        }
        Ok(event)
    }

    /// Read an event by id.
    pub fn read(&mut self, id: &str) -> Result<Event> {
        let pos = self
            .position(id)
            .ok_or_else(|| ContinuumError::EventNotFound(id.to_string()))?;
        self.read_at(pos)
    }
}
