//! Timing and policy configuration for an editor session.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::history::BlankCanvasPolicy;
use crate::scene::DEFAULT_CANVAS_SIZE;

/// Session timings and policies. Every field has a default, so a config file
/// only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Quiet period that coalesces a burst of edits into one history entry
    pub history_debounce_ms: u64,
    /// How long undo/redo keeps ignoring notifications after restoring
    pub history_settle_ms: u64,
    /// Undo stack bound; the oldest entries are dropped first
    pub max_history: usize,
    pub blank_canvas_policy: BlankCanvasPolicy,
    /// Quiet period before a local edit is published to peers
    pub publish_debounce_ms: u64,
    /// Suppression window after applying a remote snapshot
    pub inbound_settle_ms: u64,
    /// Suppression window after the initial load from persistence
    pub load_settle_ms: u64,
    pub autosave_interval_ms: u64,
    pub canvas_width: f64,
    pub canvas_height: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_debounce_ms: 300,
            history_settle_ms: 400,
            max_history: 100,
            blank_canvas_policy: BlankCanvasPolicy::Refuse,
            publish_debounce_ms: 250,
            inbound_settle_ms: 200,
            load_settle_ms: 250,
            autosave_interval_ms: 10_000,
            canvas_width: DEFAULT_CANVAS_SIZE,
            canvas_height: DEFAULT_CANVAS_SIZE,
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn history_debounce(&self) -> Duration {
        Duration::from_millis(self.history_debounce_ms)
    }

    pub fn history_settle(&self) -> Duration {
        Duration::from_millis(self.history_settle_ms)
    }

    pub fn publish_debounce(&self) -> Duration {
        Duration::from_millis(self.publish_debounce_ms)
    }

    pub fn inbound_settle(&self) -> Duration {
        Duration::from_millis(self.inbound_settle_ms)
    }

    pub fn load_settle(&self) -> Duration {
        Duration::from_millis(self.load_settle_ms)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms)
    }
}
