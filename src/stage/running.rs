//! In-flight registry.
//!
//! An entity is admitted when its ID is first seen and released when the
//! pipeline reports it on `done`. A re-scan of an entity still in flight is
//! dropped. When the registry is full, the caller re-submits the entity later.
//! Subsystems working on the same entity type share one registry so a record
//! is never processed by two of them at once.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::constants::{SLOW_COMPLETION_THRESHOLD, STALE_RUNNING_THRESHOLD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    AlreadyRunning,
    Overflow,
}

#[derive(Debug)]
struct RunningEntry {
    subsystem: String,
    started: Instant,
}

#[derive(Debug)]
pub struct RunningMap {
    entries: DashMap<String, RunningEntry>,
    concurrent: usize,
    stale_after: Duration,
}

impl RunningMap {
    pub fn new(concurrent: usize) -> Self {
        Self::with_stale_threshold(concurrent, STALE_RUNNING_THRESHOLD)
    }

    pub fn with_stale_threshold(concurrent: usize, stale_after: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            concurrent: concurrent.max(1),
            stale_after,
        }
    }

    pub fn concurrent(&self) -> usize {
        self.concurrent
    }

    /// Admissions for one registry are made from the handler loop, one at a time.
    pub fn try_admit(&self, object_id: &str, subsystem: &str) -> Admission {
        if let Some(mut entry) = self.entries.get_mut(object_id) {
            let elapsed = entry.started.elapsed();
            if elapsed > self.stale_after {
                warn!(
                    object_id = %object_id,
                    held_by = %entry.subsystem,
                    subsystem = %subsystem,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Entity still processing"
                );
                entry.started = Instant::now();
            }
            return Admission::AlreadyRunning;
        }

        if self.entries.len() >= self.concurrent {
            return Admission::Overflow;
        }

        self.entries.insert(
            object_id.to_string(),
            RunningEntry {
                subsystem: subsystem.to_string(),
                started: Instant::now(),
            },
        );
        Admission::Admitted
    }

    /// Remove an entry, returning how long it was in flight.
    pub fn release(&self, object_id: &str) -> Option<Duration> {
        let (_, entry) = self.entries.remove(object_id)?;
        let elapsed = entry.started.elapsed();
        if elapsed > SLOW_COMPLETION_THRESHOLD {
            warn!(
                object_id = %object_id,
                subsystem = %entry.subsystem,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow completion"
            );
        }
        Some(elapsed)
    }

    pub fn contains(&self, object_id: &str) -> bool {
        self.entries.contains_key(object_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
