//! Undo/redo history built from scene snapshots.
//!
//! The engine remembers the last committed scene state. When an edit settles
//! (after a debounce window) the previous committed state is pushed onto the
//! undo stack and the fresh capture becomes the committed state. Undo and
//! redo restore whole snapshots; while one is replaying, every change
//! notification is ignored so the replay cannot record itself.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::config::SessionConfig;
use crate::scene::Scene;
use crate::snapshot::{self, Snapshot};

/// What undo may do when the previous state has no objects at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlankCanvasPolicy {
    /// Undo may blank a non-empty canvas
    Allow,
    /// Undo reports `WouldBlank` instead of blanking a non-empty canvas
    #[default]
    Refuse,
}

/// One history state: the scene plus the canvas size and zoom it was taken at
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub snapshot: Snapshot,
    pub width: f64,
    pub height: f64,
    pub zoom: f64,
}

impl HistoryEntry {
    fn capture(scene: &Scene) -> Result<Self> {
        Ok(Self {
            snapshot: snapshot::capture(scene)?,
            width: scene.width(),
            height: scene.height(),
            zoom: 1.0,
        })
    }
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryState {
    Idle,
    /// An edit is waiting for its debounce window to close
    Capturing { deadline: Instant },
    /// Undo/redo restored a state and is waiting for it to settle
    Replaying { settle_at: Instant },
}

/// Result of an undo or redo request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    Applied,
    /// Nothing to undo/redo
    Empty,
    /// A previous undo/redo is still settling; the request was ignored
    Busy,
    /// Refused by [`BlankCanvasPolicy::Refuse`]
    WouldBlank,
}

/// Observable summary, published on every stack change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryStatus {
    pub can_undo: bool,
    pub can_redo: bool,
    pub can_undo_safely: bool,
    pub undo_depth: usize,
    pub redo_depth: usize,
}

/// Reported by [`HistoryEngine::poll`] when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryTick {
    /// A debounced capture was committed (or found nothing new)
    Committed { pushed: bool },
    /// An undo/redo finished settling
    Settled,
}

/// Linear undo/redo over scene snapshots
pub struct HistoryEngine {
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: Vec<HistoryEntry>,
    /// Last committed state of the scene
    current: HistoryEntry,
    state: HistoryState,
    max_history: usize,
    debounce: Duration,
    settle: Duration,
    policy: BlankCanvasPolicy,
    status_tx: watch::Sender<HistoryStatus>,
}

impl HistoryEngine {
    /// Create an engine whose baseline is the scene as it is now
    pub fn new(scene: &Scene, config: &SessionConfig) -> Result<Self> {
        let (status_tx, _) = watch::channel(HistoryStatus::default());
        Ok(Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            current: HistoryEntry::capture(scene)?,
            state: HistoryState::Idle,
            max_history: config.max_history.max(1),
            debounce: config.history_debounce(),
            settle: config.history_settle(),
            policy: config.blank_canvas_policy,
            status_tx,
        })
    }

    /// Subscribe to status changes (replaces polling the stacks)
    pub fn subscribe(&self) -> watch::Receiver<HistoryStatus> {
        self.status_tx.subscribe()
    }

    /// True between an undo/redo and its settle deadline.
    /// Edits are not recorded in that window.
    pub fn is_replaying(&self) -> bool {
        matches!(self.state, HistoryState::Replaying { .. })
    }

    /// Note that the scene changed. Ignored while replaying; otherwise
    /// (re)starts the debounce window. Returns whether it was accepted.
    pub fn record_mutation(&mut self, now: Instant) -> bool {
        if self.is_replaying() {
            return false;
        }
        self.state = HistoryState::Capturing {
            deadline: now + self.debounce,
        };
        true
    }

    /// When [`poll`](Self::poll) next has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            HistoryState::Idle => None,
            HistoryState::Capturing { deadline } => Some(deadline),
            HistoryState::Replaying { settle_at } => Some(settle_at),
        }
    }

    /// Fire any due timer
    pub fn poll(&mut self, now: Instant, scene: &Scene) -> Result<Option<HistoryTick>> {
        match self.state {
            HistoryState::Capturing { deadline } if now >= deadline => {
                self.state = HistoryState::Idle;
                let pushed = self.commit(scene)?;
                Ok(Some(HistoryTick::Committed { pushed }))
            }
            HistoryState::Replaying { settle_at } if now >= settle_at => {
                self.state = HistoryState::Idle;
                Ok(Some(HistoryTick::Settled))
            }
            _ => Ok(None),
        }
    }

    /// Commit a pending capture immediately
    pub fn flush(&mut self, scene: &Scene) -> Result<bool> {
        if let HistoryState::Capturing { .. } = self.state {
            self.state = HistoryState::Idle;
            return self.commit(scene);
        }
        Ok(false)
    }

    /// Push the previous committed state if the scene really changed
    fn commit(&mut self, scene: &Scene) -> Result<bool> {
        let captured = HistoryEntry::capture(scene)?;
        if captured.snapshot == self.current.snapshot {
            debug!("history: scene unchanged, nothing to record");
            return Ok(false);
        }
        let previous = std::mem::replace(&mut self.current, captured);
        let duplicate = self
            .undo_stack
            .back()
            .is_some_and(|top| top.snapshot == previous.snapshot);
        if duplicate {
            debug!("history: previous state already on top of undo stack");
        } else {
            self.undo_stack.push_back(previous);
            while self.undo_stack.len() > self.max_history {
                self.undo_stack.pop_front();
            }
        }
        self.redo_stack.clear();
        self.notify();
        Ok(!duplicate)
    }

    /// Adopt the scene as the committed state without recording an entry.
    /// Used after a remote snapshot was applied.
    pub fn rebase(&mut self, scene: &Scene) -> Result<()> {
        self.current = HistoryEntry::capture(scene)?;
        if let HistoryState::Capturing { .. } = self.state {
            self.state = HistoryState::Idle;
        }
        self.notify();
        Ok(())
    }

    /// Restore the previous state
    pub fn undo(&mut self, scene: &mut Scene, now: Instant) -> Result<HistoryOutcome> {
        if self.is_replaying() {
            return Ok(HistoryOutcome::Busy);
        }
        self.flush(scene)?;
        if self.undo_stack.is_empty() {
            debug!("history: nothing to undo");
            return Ok(HistoryOutcome::Empty);
        }
        if self.policy == BlankCanvasPolicy::Refuse && self.would_blank_canvas() {
            debug!("history: undo refused, it would blank the canvas");
            return Ok(HistoryOutcome::WouldBlank);
        }
        let Some(target) = self.undo_stack.pop_back() else {
            return Ok(HistoryOutcome::Empty);
        };
        let live = HistoryEntry::capture(scene)?;
        match self.replay(&target, scene, now) {
            Ok(()) => {
                self.redo_stack.push(live);
                self.current = target;
                self.notify();
                Ok(HistoryOutcome::Applied)
            }
            Err(err) => {
                self.undo_stack.push_back(target);
                Err(err)
            }
        }
    }

    /// Re-apply the state undone most recently
    pub fn redo(&mut self, scene: &mut Scene, now: Instant) -> Result<HistoryOutcome> {
        if self.is_replaying() {
            return Ok(HistoryOutcome::Busy);
        }
        self.flush(scene)?;
        let Some(target) = self.redo_stack.pop() else {
            debug!("history: nothing to redo");
            return Ok(HistoryOutcome::Empty);
        };
        let live = HistoryEntry::capture(scene)?;
        match self.replay(&target, scene, now) {
            Ok(()) => {
                self.undo_stack.push_back(live);
                self.current = target;
                self.notify();
                Ok(HistoryOutcome::Applied)
            }
            Err(err) => {
                self.redo_stack.push(target);
                Err(err)
            }
        }
    }

    fn replay(&mut self, entry: &HistoryEntry, scene: &mut Scene, now: Instant) -> Result<()> {
        self.state = HistoryState::Replaying {
            settle_at: now + self.settle,
        };
        if let Err(err) = snapshot::restore(&entry.snapshot, scene) {
            self.state = HistoryState::Idle;
            return Err(err.into());
        }
        scene.resize(entry.width * entry.zoom, entry.height * entry.zoom);
        Ok(())
    }

    /// True if undoing now would replace a non-empty canvas with an empty one
    pub fn would_blank_canvas(&self) -> bool {
        self.undo_stack
            .back()
            .is_some_and(|top| top.snapshot.is_blank() && !self.current.snapshot.is_blank())
    }

    /// Anything on the undo stack, blank or not
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    /// Undo is available and would not blank the canvas
    pub fn can_undo_safely(&self) -> bool {
        self.can_undo() && !self.would_blank_canvas()
    }

    /// Cleared by every committed edit
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Depth of the undo stack, at most `max_history`
    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    /// Depth of the redo stack
    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    /// Top of the redo stack
    pub fn peek_redo(&self) -> Option<&HistoryEntry> {
        self.redo_stack.last()
    }

    /// Drop both stacks and adopt the scene as the new baseline
    pub fn reset(&mut self, scene: &Scene) -> Result<()> {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.state = HistoryState::Idle;
        self.rebase(scene)
    }

    /// Current flags and depths, the same value [`subscribe`](Self::subscribe)
    /// receivers see
    pub fn status(&self) -> HistoryStatus {
        HistoryStatus {
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
            can_undo_safely: self.can_undo_safely(),
            undo_depth: self.undo_stack.len(),
            redo_depth: self.redo_stack.len(),
        }
    }

    fn notify(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ObjectId;
    use crate::scene::{RectProps, SceneObject, Shape, TextProps, Transform};
    use proptest::prelude::*;

    const STEP: Duration = Duration::from_millis(1000);

    fn config() -> SessionConfig {
        SessionConfig {
            blank_canvas_policy: BlankCanvasPolicy::Allow,
            ..SessionConfig::default()
        }
    }

    fn rect(id: &str, left: f64) -> SceneObject {
        SceneObject::new(
            ObjectId::from_raw(id),
            Shape::Rect(RectProps::default()),
            Transform::new(left, 0.0, 10.0, 10.0),
        )
    }

    /// Apply `edit`, then let the debounce window close
    fn edit(
        history: &mut HistoryEngine,
        scene: &mut Scene,
        now: &mut Instant,
        edit: impl FnOnce(&mut Scene),
    ) {
        edit(scene);
        scene.take_events();
        history.record_mutation(*now);
        *now += STEP;
        history.poll(*now, scene).unwrap();
    }

    fn settle(history: &mut HistoryEngine, scene: &mut Scene, now: &mut Instant) {
        scene.take_events();
        *now += STEP;
        assert_eq!(history.poll(*now, scene).unwrap(), Some(HistoryTick::Settled));
    }

    #[test]
    fn debounce_coalesces_a_burst_into_one_entry() {
        let mut scene = Scene::default();
        let mut history = HistoryEngine::new(&scene, &config()).unwrap();
        let t0 = Instant::now();
        for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
            scene.add(rect(id, 0.0));
            history.record_mutation(t0 + Duration::from_millis(100 * i as u64));
        }
        assert_eq!(history.poll(t0 + Duration::from_millis(400), &scene).unwrap(), None);
        assert_eq!(
            history.poll(t0 + Duration::from_millis(500), &scene).unwrap(),
            Some(HistoryTick::Committed { pushed: true })
        );
        assert_eq!(history.undo_count(), 1);
    }

    #[test]
    fn unchanged_scene_records_nothing() {
        let mut scene = Scene::default();
        let mut history = HistoryEngine::new(&scene, &config()).unwrap();
        let mut now = Instant::now();
        edit(&mut history, &mut scene, &mut now, |s| {
            s.add(rect("a", 0.0));
        });
        // A notification without an actual change
        edit(&mut history, &mut scene, &mut now, |_| {});
        assert_eq!(history.undo_count(), 1);
    }

    #[test]
    fn text_color_change_then_undo() {
        let mut scene = Scene::default();
        let mut history = HistoryEngine::new(&scene, &config()).unwrap();
        let mut now = Instant::now();
        let id = ObjectId::from_raw("text");
        edit(&mut history, &mut scene, &mut now, |s| {
            s.add(SceneObject::new(
                id.clone(),
                Shape::Text(TextProps::new("hello")),
                Transform::new(0.0, 0.0, 200.0, 24.0),
            ));
        });
        edit(&mut history, &mut scene, &mut now, |s| {
            s.modify(&id, |o| o.style.fill = Some("#ff0000".into()));
        });
        let recolored = snapshot::capture(&scene).unwrap();
        assert_eq!(history.undo_count(), 2);

        assert_eq!(history.undo(&mut scene, now).unwrap(), HistoryOutcome::Applied);
        assert_eq!(scene.get(&id).unwrap().style.fill.as_deref(), Some("#000000"));
        assert_eq!(history.undo_count(), 1);
        assert_eq!(history.redo_count(), 1);
        assert_eq!(history.peek_redo().unwrap().snapshot, recolored);
    }

    #[test]
    fn second_undo_while_settling_is_ignored() {
        let mut scene = Scene::default();
        let mut history = HistoryEngine::new(&scene, &config()).unwrap();
        let mut now = Instant::now();
        edit(&mut history, &mut scene, &mut now, |s| {
            s.add(rect("a", 0.0));
        });
        edit(&mut history, &mut scene, &mut now, |s| {
            s.add(rect("b", 0.0));
        });
        assert_eq!(history.undo(&mut scene, now).unwrap(), HistoryOutcome::Applied);
        assert_eq!(history.undo(&mut scene, now).unwrap(), HistoryOutcome::Busy);
        assert_eq!(history.undo_count(), 1);
        settle(&mut history, &mut scene, &mut now);
        assert_eq!(history.undo(&mut scene, now).unwrap(), HistoryOutcome::Applied);
    }

    #[test]
    fn replay_notifications_are_not_recorded() {
        let mut scene = Scene::default();
        let mut history = HistoryEngine::new(&scene, &config()).unwrap();
        let mut now = Instant::now();
        edit(&mut history, &mut scene, &mut now, |s| {
            s.add(rect("a", 0.0));
        });
        history.undo(&mut scene, now).unwrap();
        assert!(scene.has_pending_events());
        assert!(!history.record_mutation(now));
        settle(&mut history, &mut scene, &mut now);
        assert_eq!(history.undo_count(), 0);
        assert_eq!(history.redo_count(), 1);
    }

    #[test]
    fn new_edit_after_undo_clears_redo() {
        let mut scene = Scene::default();
        let mut history = HistoryEngine::new(&scene, &config()).unwrap();
        let mut now = Instant::now();
        edit(&mut history, &mut scene, &mut now, |s| {
            s.add(rect("a", 0.0));
        });
        edit(&mut history, &mut scene, &mut now, |s| {
            s.add(rect("b", 0.0));
        });
        history.undo(&mut scene, now).unwrap();
        settle(&mut history, &mut scene, &mut now);
        assert!(history.can_redo());

        edit(&mut history, &mut scene, &mut now, |s| {
            s.add(rect("c", 0.0));
        });
        assert!(!history.can_redo());
        assert_eq!(history.redo(&mut scene, now).unwrap(), HistoryOutcome::Empty);
    }

    #[test]
    fn undo_flushes_a_pending_capture_first() {
        let mut scene = Scene::default();
        let mut history = HistoryEngine::new(&scene, &config()).unwrap();
        let mut now = Instant::now();
        edit(&mut history, &mut scene, &mut now, |s| {
            s.add(rect("a", 0.0));
        });
        scene.add(rect("b", 0.0));
        history.record_mutation(now);
        // Undo before the debounce closes reverts exactly the pending edit
        assert_eq!(history.undo(&mut scene, now).unwrap(), HistoryOutcome::Applied);
        assert_eq!(scene.len(), 1);
        assert!(scene.get(&ObjectId::from_raw("a")).is_some());
    }

    #[test]
    fn blank_canvas_guard_is_visible_and_enforced() {
        let mut scene = Scene::default();
        let refuse = SessionConfig::default();
        let mut history = HistoryEngine::new(&scene, &refuse).unwrap();
        let mut now = Instant::now();
        edit(&mut history, &mut scene, &mut now, |s| {
            s.add(rect("a", 0.0));
        });
        assert!(history.can_undo());
        assert!(history.would_blank_canvas());
        assert!(!history.can_undo_safely());
        assert!(!history.status().can_undo_safely);
        assert_eq!(history.undo(&mut scene, now).unwrap(), HistoryOutcome::WouldBlank);
        assert_eq!(scene.len(), 1);
        assert_eq!(history.undo_count(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut scene = Scene::default();
        let small = SessionConfig {
            max_history: 3,
            ..config()
        };
        let mut history = HistoryEngine::new(&scene, &small).unwrap();
        let mut now = Instant::now();
        for i in 0..10 {
            edit(&mut history, &mut scene, &mut now, |s| {
                s.add(rect(&format!("r{i}"), 0.0));
            });
        }
        assert_eq!(history.undo_count(), 3);
    }

    #[test]
    fn status_channel_tracks_stacks() {
        let mut scene = Scene::default();
        let mut history = HistoryEngine::new(&scene, &config()).unwrap();
        let rx = history.subscribe();
        let mut now = Instant::now();
        edit(&mut history, &mut scene, &mut now, |s| {
            s.add(rect("a", 0.0));
        });
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow().undo_depth, 1);
        assert!(!rx.borrow().can_redo);
    }

    #[test]
    fn rebase_moves_baseline_without_recording() {
        let mut scene = Scene::default();
        let mut history = HistoryEngine::new(&scene, &config()).unwrap();
        scene.add(rect("remote", 0.0));
        history.rebase(&scene).unwrap();
        assert_eq!(history.undo_count(), 0);

        let mut now = Instant::now();
        edit(&mut history, &mut scene, &mut now, |s| {
            s.add(rect("local", 0.0));
        });
        history.undo(&mut scene, now).unwrap();
        // The remote object stays, only the local edit is reverted
        assert!(scene.get(&ObjectId::from_raw("remote")).is_some());
        assert!(scene.get(&ObjectId::from_raw("local")).is_none());
    }

    proptest! {
        #[test]
        fn n_edits_then_n_undos_restore_the_start(moves in prop::collection::vec(1.0f64..500.0, 1..12)) {
            let mut scene = Scene::default();
            scene.add(rect("base", 0.0));
            scene.take_events();
            let mut history = HistoryEngine::new(&scene, &config()).unwrap();
            let initial = snapshot::capture(&scene).unwrap();
            let mut now = Instant::now();

            let id = ObjectId::from_raw("base");
            for (i, left) in moves.iter().enumerate() {
                let target = *left + i as f64 * 1000.0;
                edit(&mut history, &mut scene, &mut now, |s| {
                    s.modify(&id, |o| o.transform.left = target);
                });
            }
            let edited = snapshot::capture(&scene).unwrap();

            for _ in 0..moves.len() {
                prop_assert_eq!(history.undo(&mut scene, now).unwrap(), HistoryOutcome::Applied);
                settle(&mut history, &mut scene, &mut now);
            }
            prop_assert_eq!(snapshot::capture(&scene).unwrap(), initial);
            prop_assert!(!history.can_undo());

            for _ in 0..moves.len() {
                prop_assert_eq!(history.redo(&mut scene, now).unwrap(), HistoryOutcome::Applied);
                settle(&mut history, &mut scene, &mut now);
            }
            prop_assert_eq!(snapshot::capture(&scene).unwrap(), edited);
        }
    }
}
