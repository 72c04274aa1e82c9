//! Durable session state.
//!
//! The store keeps two things per session directory:
//! - `events.jsonl`: the append-only event log, one JSON event per line
//! - `kv.json`: a key/value snapshot table for point-in-time queries
//!
//! An event is written and synced before `append` returns. The key/value
//! table is rewritten atomically through a temporary file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::task::TaskId;
use crate::orchestration::track::TrackId;
use crate::state::event::{Event, NewEvent};
use crate::state::replay::SessionProjection;
use crate::{clog_debug, clog_warn, Error, Result};

pub const EVENTS_FILE: &str = "events.jsonl";
pub const KV_FILE: &str = "kv.json";
pub const CHECKPOINT_KEY: &str = "session.checkpoint";

const KEY_PATTERN: &str = r"^[a-z][a-z0-9_-]*(\.[A-Za-z0-9_-]+)*$";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvEntry {
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

struct StoreInner {
    events: Vec<Event>,
    kv: BTreeMap<String, KvEntry>,
    log: Option<File>,
    subscribers: Vec<Sender<Event>>,
}

/// Append-only event log plus key/value table for one session.
pub struct StateStore {
    dir: Option<PathBuf>,
    inner: Mutex<StoreInner>,
    key_pattern: Regex,
}

impl StateStore {
    /// Open (or create) a store in `dir`, loading any existing log.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let events_path = dir.join(EVENTS_FILE);
        let (events, torn) = read_events(&events_path)?;
        if torn {
            rewrite_events(&events_path, &events)?;
        }
        let kv = read_kv(&dir.join(KV_FILE))?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)?;

        clog_debug!(
            "StateStore::open dir={} events={} keys={}",
            dir.display(),
            events.len(),
            kv.len()
        );

        Ok(Self {
            dir: Some(dir.to_path_buf()),
            inner: Mutex::new(StoreInner {
                events,
                kv,
                log: Some(log),
                subscribers: Vec::new(),
            }),
            key_pattern: key_regex()?,
        })
    }

    /// A store that keeps everything in memory. Used by tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            dir: None,
            inner: Mutex::new(StoreInner {
                events: Vec::new(),
                kv: BTreeMap::new(),
                log: None,
                subscribers: Vec::new(),
            }),
            key_pattern: key_regex()?,
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Validation("state store lock poisoned".into()))
    }

    // ========== Event Log ==========

    /// Assign the next sequence number, persist the event, and notify subscribers.
    pub fn append(&self, event: NewEvent) -> Result<Event> {
        let mut inner = self.lock()?;
        let seq = inner.events.last().map_or(1, |e| e.seq + 1);
        let event = event.into_event(seq, Utc::now());

        if let Some(log) = inner.log.as_mut() {
            let line = serde_json::to_string(&event)?;
            writeln!(log, "{}", line)?;
            log.flush()?;
            log.sync_data()?;
        } else if self.dir.is_some() {
            return Err(Error::SessionClosed("state store has been archived".into()));
        }

        inner.events.push(event.clone());
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        Ok(event)
    }

    /// Receive every event appended from now on.
    pub fn subscribe(&self) -> Result<Receiver<Event>> {
        let (tx, rx) = unbounded();
        self.lock()?.subscribers.push(tx);
        Ok(rx)
    }

    pub fn events(&self) -> Result<Vec<Event>> {
        Ok(self.lock()?.events.clone())
    }

    pub fn events_after(&self, seq: u64) -> Result<Vec<Event>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| e.seq > seq)
            .cloned()
            .collect())
    }

    /// Audit log for one task.
    pub fn task_log(&self, task: &TaskId) -> Result<Vec<Event>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| e.task_id.as_ref() == Some(task))
            .cloned()
            .collect())
    }

    /// Audit log for one track.
    pub fn track_log(&self, track: &TrackId) -> Result<Vec<Event>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| e.track_id.as_ref() == Some(track))
            .cloned()
            .collect())
    }

    pub fn last_seq(&self) -> Result<u64> {
        Ok(self.lock()?.events.last().map_or(0, |e| e.seq))
    }

    // ========== Key/Value Table ==========

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        if !self.key_pattern.is_match(key) {
            return Err(Error::InvalidKey(key.to_string()));
        }
        let entry = KvEntry {
            value: serde_json::to_value(value)?,
            updated_at: Utc::now(),
        };
        let mut inner = self.lock()?;
        inner.kv.insert(key.to_string(), entry);
        if let Some(dir) = &self.dir {
            write_kv(&dir.join(KV_FILE), &inner.kv)?;
        }
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let inner = self.lock()?;
        match inner.kv.get(key) {
            Some(entry) => Ok(Some(serde_json::from_value(entry.value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn entry(&self, key: &str) -> Result<Option<KvEntry>> {
        Ok(self.lock()?.kv.get(key).cloned())
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn entries(&self, prefix: &str) -> Result<Vec<(String, KvEntry)>> {
        Ok(self
            .lock()?
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    // ========== Checkpoints ==========

    pub fn checkpoint(&self, projection: &SessionProjection) -> Result<()> {
        clog_debug!("StateStore::checkpoint seq={}", projection.last_seq);
        self.put(CHECKPOINT_KEY, projection)
    }

    pub fn load_checkpoint(&self) -> Result<Option<SessionProjection>> {
        self.get(CHECKPOINT_KEY)
    }

    /// Close the log and move the session directory to `dest`.
    pub fn archive(&self, dest: &Path) -> Result<()> {
        let mut inner = self.lock()?;
        inner.log = None;
        inner.subscribers.clear();
        if let Some(dir) = &self.dir {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(dir, dest)?;
            clog_debug!("Archived session {} -> {}", dir.display(), dest.display());
        }
        Ok(())
    }
}

fn key_regex() -> Result<Regex> {
    Regex::new(KEY_PATTERN).map_err(|e| Error::Validation(format!("bad key pattern: {}", e)))
}

/// Load the log. The flag is set when a torn final line was dropped.
fn read_events(path: &Path) -> Result<(Vec<Event>, bool)> {
    if !path.exists() {
        return Ok((Vec::new(), false));
    }
    let reader = BufReader::new(File::open(path)?);
    let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;
    let last = lines.len().saturating_sub(1);

    let mut events = Vec::with_capacity(lines.len());
    let mut torn = false;
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) => events.push(event),
            // A crash mid-append can leave a torn final line.
            Err(e) if i == last => {
                clog_warn!("Dropping torn final event line in {}: {}", path.display(), e);
                torn = true;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok((events, torn))
}

fn rewrite_events(path: &Path, events: &[Event]) -> Result<()> {
    let mut contents = String::new();
    for event in events {
        contents.push_str(&serde_json::to_string(event)?);
        contents.push('\n');
    }
    let temp_path = path.with_extension("jsonl.tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

fn read_kv(path: &Path) -> Result<BTreeMap<String, KvEntry>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

fn write_kv(path: &Path, kv: &BTreeMap<String, KvEntry>) -> Result<()> {
    let contents = serde_json::to_string_pretty(kv)?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
