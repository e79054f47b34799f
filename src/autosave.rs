//! Periodic autosave with change detection.
//!
//! Every scene mutation pushes the save deadline out by one interval. When
//! the deadline passes, a save is due only if the canonical form differs from
//! the last one that was persisted successfully.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug)]
pub struct Autosave {
    interval: Duration,
    deadline: Option<Instant>,
    last_persisted: Option<String>,
    /// Save handed out and not yet confirmed
    in_flight: Option<String>,
    failures: u32,
}

impl Autosave {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            last_persisted: None,
            in_flight: None,
            failures: 0,
        }
    }

    /// Record what the store already holds (e.g. after the initial load)
    pub fn mark_baseline(&mut self, serialized: &str) {
        self.last_persisted = Some(serialized.to_string());
    }

    /// A mutation happened: restart the timer
    pub fn touch(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn needs_save(&self, serialized: &str) -> bool {
        self.last_persisted.as_deref() != Some(serialized)
    }

    /// If the timer fired, decide whether `serialized` must be written.
    ///
    /// Returns the payload to persist; the caller reports the outcome through
    /// [`mark_persisted`](Self::mark_persisted) or
    /// [`mark_failed`](Self::mark_failed).
    pub fn take_due(&mut self, now: Instant, serialized: &str) -> Option<String> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.deadline = None;
        if !self.needs_save(serialized) {
            debug!("autosave: nothing changed since last save");
            return None;
        }
        if self.in_flight.as_deref() == Some(serialized) {
            return None;
        }
        self.in_flight = Some(serialized.to_string());
        Some(serialized.to_string())
    }

    pub fn mark_persisted(&mut self, serialized: &str) {
        if self.in_flight.as_deref() == Some(serialized) {
            self.in_flight = None;
        }
        self.last_persisted = Some(serialized.to_string());
        self.failures = 0;
    }

    /// The save failed; retry on the next tick
    pub fn mark_failed(&mut self, now: Instant) {
        self.in_flight = None;
        self.failures += 1;
        warn!(failures = self.failures, "autosave failed, retrying next tick");
        if self.deadline.is_none() {
            self.deadline = Some(now + self.interval);
        }
    }
}
