//! Reconciliation between the local scene and the shared document.
//!
//! Outbound, a debounced publish writes the local snapshot only when it
//! differs from what the document already holds, and remembers what it sent.
//! Inbound, a document change is skipped when it is our own echo or when it
//! matches the local scene already; otherwise it is handed back for applying.
//! The title follows the same pattern with a single scalar.

use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

use crate::document::SharedDoc;
use crate::ids::ReplicaId;
use crate::snapshot::Snapshot;

/// Result of flushing a pending publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The document already holds this exact snapshot
    Unchanged,
}

/// What to do with the document's current canvas
#[derive(Debug, Clone, PartialEq)]
pub enum InboundDecision {
    /// The local scene is not initialised yet
    NotReady,
    /// Nothing has been published in this session
    Empty,
    /// Our own last write coming back
    SelfEcho,
    /// Identical to the local scene
    Unchanged,
    /// The stored json could not be decoded; local state stays authoritative
    Malformed,
    /// A genuine remote edit
    Apply(Snapshot),
}

/// Counters for the decisions taken so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub published: u64,
    pub publish_skipped: u64,
    pub echoes_skipped: u64,
    pub unchanged_skipped: u64,
    pub applied: u64,
    pub malformed: u64,
}

/// Canvas snapshot reconciler
#[derive(Debug)]
pub struct SyncReconciler {
    replica: ReplicaId,
    debounce: Duration,
    publish_at: Option<Instant>,
    /// Serialized form of our most recent publish
    last_sent: Option<String>,
    stats: ReconcileStats,
}

impl SyncReconciler {
    pub fn new(replica: ReplicaId, debounce: Duration) -> Self {
        Self {
            replica,
            debounce,
            publish_at: None,
            last_sent: None,
            stats: ReconcileStats::default(),
        }
    }

    /// (Re)start the publish debounce; any pending publish is replaced
    pub fn schedule_publish(&mut self, now: Instant) {
        self.publish_at = Some(now + self.debounce);
    }

    /// Publish at `at` regardless of the debounce (post-undo/redo sync)
    pub fn publish_at(&mut self, at: Instant) {
        self.publish_at = Some(at);
    }

    /// Move a due publish to `at` (used while suppression holds it back)
    pub fn defer_publish(&mut self, at: Instant) {
        if self.publish_at.is_some() {
            self.publish_at = Some(at);
        }
    }

    pub fn publish_due(&self, now: Instant) -> bool {
        self.publish_at.is_some_and(|at| now >= at)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.publish_at
    }

    /// Publish `snapshot` unless the document already holds it. Clears the
    /// pending publish either way.
    pub fn flush_publish(
        &mut self,
        doc: &mut SharedDoc,
        snapshot: &Snapshot,
        now_ms: u64,
    ) -> Result<PublishOutcome> {
        self.publish_at = None;
        let json = snapshot.serialized();
        if doc.canvas()?.is_some_and(|stored| stored.json == json) {
            debug!("outbound: document already holds this snapshot");
            self.stats.publish_skipped += 1;
            return Ok(PublishOutcome::Unchanged);
        }
        self.last_sent = Some(json.to_string());
        doc.publish_canvas(json, self.replica, now_ms)?;
        self.stats.published += 1;
        debug!(bytes = json.len(), "outbound: published snapshot");
        Ok(PublishOutcome::Published)
    }

    /// Decide whether the document's canvas must be applied locally.
    /// `local` is a fresh capture of the scene, `None` if not initialised.
    pub fn assess_inbound(&mut self, doc: &SharedDoc, local: Option<&Snapshot>) -> Result<InboundDecision> {
        let Some(local) = local else {
            return Ok(InboundDecision::NotReady);
        };
        let Some(stored) = doc.canvas()? else {
            return Ok(InboundDecision::Empty);
        };
        if stored.sender_id == Some(self.replica) && self.last_sent.as_deref() == Some(stored.json.as_str()) {
            self.stats.echoes_skipped += 1;
            return Ok(InboundDecision::SelfEcho);
        }
        if stored.json == local.serialized() {
            self.stats.unchanged_skipped += 1;
            return Ok(InboundDecision::Unchanged);
        }
        let remote = match Snapshot::parse(&stored.json) {
            Ok(remote) => remote,
            Err(err) => {
                warn!(sender = ?stored.sender_id, "inbound: skipping malformed snapshot: {err}");
                self.stats.malformed += 1;
                return Ok(InboundDecision::Malformed);
            }
        };
        // Same scene in a different encoding
        if &remote == local {
            self.stats.unchanged_skipped += 1;
            return Ok(InboundDecision::Unchanged);
        }
        self.stats.applied += 1;
        Ok(InboundDecision::Apply(remote))
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }
}

/// Title reconciler: same echo/no-op checks over a single string
#[derive(Debug)]
pub struct TitleSync {
    replica: ReplicaId,
    current: String,
    last_sent: Option<String>,
}

impl TitleSync {
    pub fn new(replica: ReplicaId, initial: impl Into<String>) -> Self {
        Self {
            replica,
            current: initial.into(),
            last_sent: None,
        }
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    /// Adopt a title from persistence without publishing it
    pub fn set_baseline(&mut self, title: impl Into<String>) {
        self.current = title.into();
    }

    /// Local rename. Publishes unless the document already has this title.
    pub fn set_local(&mut self, doc: &mut SharedDoc, title: &str, now_ms: u64) -> Result<bool> {
        self.current = title.to_string();
        if doc.title()?.is_some_and(|stored| stored.title == title) {
            return Ok(false);
        }
        self.last_sent = Some(title.to_string());
        doc.publish_title(title, self.replica, now_ms)?;
        Ok(true)
    }

    /// Returns the new title when the document holds a remote rename
    pub fn assess_inbound(&mut self, doc: &SharedDoc) -> Result<Option<String>> {
        let Some(stored) = doc.title()? else {
            return Ok(None);
        };
        if stored.sender_id == Some(self.replica) && self.last_sent.as_deref() == Some(stored.title.as_str()) {
            return Ok(None);
        }
        if stored.title == self.current {
            return Ok(None);
        }
        self.current = stored.title.clone();
        Ok(Some(stored.title))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DesignData;

    fn snapshot(background: &str) -> Snapshot {
        let mut design = DesignData::empty(100.0, 100.0);
        design.background = Some(background.to_string());
        Snapshot::from_design(design).unwrap()
    }

    #[test]
    fn publish_is_debounced_cancel_and_replace() {
        let mut rec = SyncReconciler::new(ReplicaId(1), Duration::from_millis(250));
        let t0 = Instant::now();
        rec.schedule_publish(t0);
        rec.schedule_publish(t0 + Duration::from_millis(200));
        assert!(!rec.publish_due(t0 + Duration::from_millis(300)));
        assert!(rec.publish_due(t0 + Duration::from_millis(450)));
    }

    #[test]
    fn publishing_the_stored_value_is_skipped() {
        let mut doc = SharedDoc::new();
        let mut rec = SyncReconciler::new(ReplicaId(1), Duration::ZERO);
        let snap = snapshot("white");
        assert_eq!(rec.flush_publish(&mut doc, &snap, 1).unwrap(), PublishOutcome::Published);
        assert_eq!(rec.flush_publish(&mut doc, &snap, 2).unwrap(), PublishOutcome::Unchanged);
        assert_eq!(rec.stats().published, 1);
    }

    #[test]
    fn own_write_is_recognised_as_echo() {
        let mut doc = SharedDoc::new();
        let mut rec = SyncReconciler::new(ReplicaId(1), Duration::ZERO);
        let sent = snapshot("white");
        rec.flush_publish(&mut doc, &sent, 1).unwrap();
        // The scene moved on locally since the publish
        let local = snapshot("black");
        assert_eq!(rec.assess_inbound(&doc, Some(&local)).unwrap(), InboundDecision::SelfEcho);
    }

    #[test]
    fn remote_write_is_applied_unless_already_reflected() {
        let mut doc = SharedDoc::new();
        let remote = snapshot("red");
        doc.publish_canvas(remote.serialized(), ReplicaId(2), 1).unwrap();

        let mut rec = SyncReconciler::new(ReplicaId(1), Duration::ZERO);
        assert_eq!(rec.assess_inbound(&doc, None).unwrap(), InboundDecision::NotReady);
        assert_eq!(
            rec.assess_inbound(&doc, Some(&snapshot("white"))).unwrap(),
            InboundDecision::Apply(remote.clone())
        );
        assert_eq!(rec.assess_inbound(&doc, Some(&remote)).unwrap(), InboundDecision::Unchanged);
    }

    #[test]
    fn malformed_remote_json_is_skipped() {
        let mut doc = SharedDoc::new();
        doc.publish_canvas("{broken", ReplicaId(2), 1).unwrap();
        let mut rec = SyncReconciler::new(ReplicaId(1), Duration::ZERO);
        assert_eq!(
            rec.assess_inbound(&doc, Some(&snapshot("white"))).unwrap(),
            InboundDecision::Malformed
        );
        assert_eq!(rec.stats().malformed, 1);
    }

    #[test]
    fn title_echo_and_remote_rename() {
        let mut doc = SharedDoc::new();
        let mut mine = TitleSync::new(ReplicaId(1), "Untitled");
        assert!(mine.set_local(&mut doc, "Launch poster", 1).unwrap());
        assert_eq!(mine.assess_inbound(&doc).unwrap(), None);

        doc.publish_title("Final poster", ReplicaId(2), 2).unwrap();
        assert_eq!(mine.assess_inbound(&doc).unwrap().as_deref(), Some("Final poster"));
        assert_eq!(mine.current(), "Final poster");
        assert_eq!(mine.assess_inbound(&doc).unwrap(), None);
    }
}
