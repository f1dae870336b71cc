use std::{
    path::{Path, PathBuf},
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A single analytics event as kept by the [`EventStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub experiment_id: String,
    pub variant_id: String,
    /// `experiment_exposure` for exposures, otherwise the conversion event name.
    pub event_type: String,
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Bounded, append-only event log, optionally persisted to a JSON file.
///
/// Only the most recent `max_events` events are kept. The file is rewritten after every change;
/// a missing or corrupt file is treated as empty.
#[derive(Debug)]
pub struct EventStore {
    path: Option<PathBuf>,
    events: RwLock<Vec<StoredEvent>>,
    max_events: usize,
}

impl EventStore {
    /// Default number of events kept.
    pub const DEFAULT_MAX_EVENTS: usize = 10_000;

    /// Default file name used by the server binary.
    pub const DEFAULT_FILE: &'static str = ".analytics-data.json";

    /// An event store that is never persisted.
    pub fn in_memory() -> EventStore {
        EventStore {
            path: None,
            events: RwLock::new(Vec::new()),
            max_events: EventStore::DEFAULT_MAX_EVENTS,
        }
    }

    /// Load events from `path`, persisting every change back to it.
    pub fn open(path: impl AsRef<Path>) -> EventStore {
        let path = path.as_ref().to_owned();
        let events: Vec<StoredEvent> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                log::warn!(target: "edge_experiments",
                           path:debug = path;
                           "starting with empty event store, file is corrupt: {:?}", err);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        log::debug!(target: "edge_experiments",
                    path:debug = path,
                    events = events.len();
                    "loaded event store");

        EventStore {
            path: Some(path),
            events: RwLock::new(events),
            max_events: EventStore::DEFAULT_MAX_EVENTS,
        }
    }

    pub fn with_max_events(mut self, max_events: usize) -> EventStore {
        self.max_events = max_events;
        self
    }

    /// Append `event`, evicting the oldest events past the cap.
    ///
    /// The event is kept in memory even if persisting it fails.
    pub fn add(&self, event: StoredEvent) -> Result<()> {
        let mut events = self.events.write().map_err(poisoned)?;
        events.push(event);
        if events.len() > self.max_events {
            let excess = events.len() - self.max_events;
            events.drain(..excess);
        }
        self.persist(&events)
    }

    /// Snapshot of all events, oldest first.
    pub fn events(&self) -> Vec<StoredEvent> {
        self.events
            .read()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every event. This cannot be undone.
    pub fn clear(&self) -> Result<()> {
        let mut events = self.events.write().map_err(poisoned)?;
        events.clear();
        self.persist(&events)
    }

    fn persist(&self, events: &[StoredEvent]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(events)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Storage("event store lock poisoned".to_owned())
}
