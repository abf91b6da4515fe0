//! Append path and backward reads over per-stream logs.
//!
//! [`EventStore::append`] is the only write entry point. Writers to one stream are
//! serialized by that stream's mutex; different streams proceed in parallel. The
//! local fsync is the only thing an append waits on: replication is handed to the
//! persisted [`SyncQueue`] and the sync worker is woken with a non-blocking signal.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::lock;
use crate::error::{ContinuumError, Result};
use crate::events::log::{stream_path, StreamLog};
use crate::events::types::{Event, EventFilter, NewEvent, StreamKey};
use crate::sync::{SyncQueue, SyncSignal};

/// Default number of events returned by a backward read.
pub const DEFAULT_READ_LIMIT: usize = 50;

/// Hard ceiling on a single backward read.
pub const MAX_READ_LIMIT: usize = 1000;

type SharedLog = Arc<Mutex<StreamLog>>;

pub struct EventStore {
    root: PathBuf,
    streams: Mutex<HashMap<StreamKey, SharedLog>>,
    queue: SyncQueue,
    signals: Option<mpsc::Sender<SyncSignal>>,
}

impl EventStore {
    /// Open the store rooted at `root` (the `streams/` directory).
    pub fn open(root: impl Into<PathBuf>, queue: SyncQueue) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            streams: Mutex::new(HashMap::new()),
            queue,
            signals: None,
        })
    }

    /// Wake the sync worker through `tx` after each append.
    pub fn with_signals(mut self, tx: mpsc::Sender<SyncSignal>) -> Self {
        self.signals = Some(tx);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Get the open log for `key`. With `create == false`, a stream that has never
    /// been written yields `None` instead of creating an empty file.
    fn stream(&self, key: &StreamKey, create: bool) -> Result<Option<SharedLog>> {
        let mut streams = lock(&self.streams);
        if let Some(log) = streams.get(key) {
            return Ok(Some(Arc::clone(log)));
        }

        let path = stream_path(&self.root, key);
        if !create && !path.exists() {
            return Ok(None);
        }

        let log = Arc::new(Mutex::new(StreamLog::open(path)?));
        streams.insert(key.clone(), Arc::clone(&log));
        Ok(Some(log))
    }

    fn existing_stream(&self, key: &StreamKey) -> Result<Option<SharedLog>> {
        self.stream(key, false)
    }

    /// Validate, link to the stream head, durably write, and enqueue for replication.
    ///
    /// Returns the stored event. Fails only if validation or the local write fails.
    pub fn append(&self, new: NewEvent) -> Result<Event> {
        new.validate()?;

        let stream = self
            .stream(&new.stream, true)?
            .ok_or_else(|| ContinuumError::InvalidEvent("stream could not be opened".into()))?;
        let mut log = lock(&stream);

        let now = Utc::now();
        // Keep timestamps non-decreasing along the chain so the time index stays sorted.
        let timestamp = match log.head_timestamp() {
            Some(head_ts) if head_ts > now => head_ts,
            _ => now,
        };

        let event = Event {
            id: next_event_id(log.head(), timestamp),
            previous_id: log.head().map(String::from),
            user_id: new.stream.user_id,
            project_id: new.stream.project_id,
            branch: new.stream.branch,
            timestamp,
            category: new.category,
            description: new.description,
            files: new.files,
            impact: new.impact,
            tags: new.tags,
            shared: new.shared,
            commit: new.commit,
            node_refs: new.node_refs,
        };

        log.append(&event)?;

        // Still under the stream lock so the queue sees this stream's events in order.
        match self.queue.enqueue(&event) {
            Ok(_) => {
                if let Some(tx) = &self.signals {
                    // Full channel means the worker already has a wake-up pending.
                    let _ = tx.try_send(SyncSignal::Enqueued);
                }
            }
            Err(err) => {
                tracing::warn!(
                    event_id = %event.id,
                    error = %err,
                    "event logged but not enqueued; it will be re-enqueued on next start"
                );
            }
        }
        drop(log);

        tracing::debug!(
            event_id = %event.id,
            stream = %event.stream_key(),
            category = %event.category,
            "event appended"
        );
        Ok(event)
    }

    /// Read up to `limit` events newest-first, starting at `from` (or the head) and
    /// following back-links towards the start of the stream.
    pub fn read_backward(
        &self,
        key: &StreamKey,
        from: Option<&str>,
        limit: usize,
        filter: &EventFilter,
    ) -> Result<Vec<Event>> {
        let limit = limit.min(MAX_READ_LIMIT);
        let Some(stream) = self.existing_stream(key)? else {
            return match from {
                Some(id) => Err(ContinuumError::EventNotFound(id.to_string())),
                None => Ok(Vec::new()),
            };
        };
        let mut log = lock(&stream);

        let mut pos = match from {
            Some(id) => Some(
                log.position(id)
                    .ok_or_else(|| ContinuumError::EventNotFound(id.to_string()))?,
            ),
            None => log.len().checked_sub(1),
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Skip straight past everything newer than `until` using the time index.
        if let (Some(start), Some(until)) = (pos, filter.until) {
            pos = log.latest_at_or_before(until).map(|p| p.min(start));
        }

        let mut out = Vec::with_capacity(limit.min(64));
        while let Some(p) = pos {
            let event = log.read_at(p)?;
            if filter.since.is_some_and(|since| event.timestamp < since) {
                break;
            }

            pos = match event.previous_id.as_deref() {
                Some(prev) => Some(log.position(prev).ok_or_else(|| ContinuumError::CorruptLog {
                    path: log.path().display().to_string(),
                    reason: format!("event {} links to missing {prev}", event.id),
                })?),
                None => None,
            };

            if filter.matches(&event) {
                out.push(event);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Id of the newest event in the stream.
    pub fn head(&self, key: &StreamKey) -> Result<Option<String>> {
        match self.existing_stream(key)? {
            Some(stream) => Ok(lock(&stream).head().map(String::from)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &StreamKey, id: &str) -> Result<bool> {
        match self.existing_stream(key)? {
            Some(stream) => Ok(lock(&stream).contains(id)),
            None => Ok(false),
        }
    }

    pub fn get(&self, key: &StreamKey, id: &str) -> Result<Event> {
        let stream = self
            .existing_stream(key)?
            .ok_or_else(|| ContinuumError::EventNotFound(id.to_string()))?;
        let mut log = lock(&stream);
        log.read(id)
    }

    /// Number of events appended after `id` (after nothing, i.e. all, when `None`).
    pub fn count_after(&self, key: &StreamKey, id: Option<&str>) -> Result<usize> {
        let Some(stream) = self.existing_stream(key)? else {
            return match id {
                Some(id) => Err(ContinuumError::EventNotFound(id.to_string())),
                None => Ok(0),
            };
        };
        let log = lock(&stream);
        let pos = match id {
            Some(id) => Some(
                log.position(id)
                    .ok_or_else(|| ContinuumError::EventNotFound(id.to_string()))?,
            ),
            None => None,
        };
        Ok(log.ids_after(pos).count())
    }

    /// Re-enqueue every logged event past its stream's watermark.
    ///
    /// Covers a crash between the log fsync and the queue insert. Returns the number
    /// of events that were missing from the queue.
    pub fn recover_pending(&self) -> Result<usize> {
        let mut recovered = 0;
        for path in log_files(&self.root)? {
            let mut log = StreamLog::open(&path)?;
            let Some(head) = log.head().map(String::from) else {
                continue;
            };
            let key = log.read_at(0)?.stream_key();

            let after = match self.queue.watermark(&key)? {
                Some(mark) => log.position(&mark),
                None => None,
            };
            let pending: Vec<String> = log.ids_after(after).map(String::from).collect();
            for id in &pending {
                let event = log.read(id)?;
                if self.queue.requeue(&event)? {
                    recovered += 1;
                }
            }
            self.queue.set_watermark(&key, &head)?;

            if !pending.is_empty() {
                tracing::info!(stream = %key, checked = pending.len(), "recovered stream past watermark");
            }
            lock(&self.streams)
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(log)));
        }
        Ok(recovered)
    }
}

/// All `*.jsonl` files at `<root>/<user>/<project>/`.
fn log_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }
    for user in std::fs::read_dir(root)? {
        let user = user?.path();
        if !user.is_dir() {
            continue;
        }
        for project in std::fs::read_dir(&user)? {
            let project = project?.path();
            if !project.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&project)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "jsonl") {
                    files.push(path);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

/// A v7 id strictly greater than `head`, even if the clock went backwards.
fn next_event_id(head: Option<&str>, at: DateTime<Utc>) -> String {
    let id = Uuid::now_v7();
    let Some(head) = head.and_then(|h| Uuid::parse_str(h).ok()) else {
        return id.to_string();
    };
    if id > head {
        return id.to_string();
    }

    let head_ms = head
        .get_timestamp()
        .map(|ts| {
            let (secs, nanos) = ts.to_unix();
            secs * 1000 + u64::from(nanos) / 1_000_000
        })
        .unwrap_or(0);
    let ms = head_ms.max(u64::try_from(at.timestamp_millis()).unwrap_or(0)) + 1;
    let ts = uuid::Timestamp::from_unix(uuid::NoContext, ms / 1000, ((ms % 1000) * 1_000_000) as u32);
    Uuid::new_v7(ts).to_string()
}
