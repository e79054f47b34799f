//! `SyncSession`: the per-editor context that owns the scene and wires
//! history, suppression, reconciliation, presence, comments and autosave
//! together.
//!
//! The session does no I/O and reads no clock. Every entry point takes the
//! current `Instant`; the driver asks [`SyncSession::next_deadline`] when to
//! call [`SyncSession::poll`] next. The shared document is passed in by the
//! caller, who owns locking it.

use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info};

use crate::autosave::Autosave;
use crate::comments::Comment;
use crate::config::SessionConfig;
use crate::document::SharedDoc;
use crate::history::{HistoryEngine, HistoryOutcome, HistoryStatus, HistoryTick};
use crate::ids::{now_ms, ObjectId, ReplicaId};
use crate::presence::{AwarenessMessage, Collaborator, PresenceState, PresenceTracker, UserInfo};
use crate::reconcile::{InboundDecision, PublishOutcome, ReconcileStats, SyncReconciler, TitleSync};
use crate::scene::{Scene, SceneObject, Shape, Transform};
use crate::snapshot::{self, DesignData, Snapshot};
use crate::suppress::Suppression;

/// Title used until one is loaded or set
pub const DEFAULT_TITLE: &str = "My Design";

/// A save the driver should hand to the persistence store
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSave {
    pub design: DesignData,
    pub title: String,
    /// Canonical form, reported back on completion
    pub serialized: String,
}

/// Something the driver has to act on after [`SyncSession::poll`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    /// The shared document was written; peers need a sync round
    Published,
    /// An undo/redo finished settling
    HistorySettled,
    SaveDue(PendingSave),
}

/// What a shared document change did to the local session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocUpdate {
    /// A remote snapshot replaced the scene
    pub scene_replaced: bool,
    /// A remote rename
    pub title: Option<String>,
    pub comments_changed: bool,
}

impl DocUpdate {
    pub fn is_empty(&self) -> bool {
        !self.scene_replaced && self.title.is_none() && !self.comments_changed
    }
}

/// One open editor on one canvas
pub struct SyncSession {
    config: SessionConfig,
    replica: ReplicaId,
    scene: Scene,
    history: HistoryEngine,
    suppression: Suppression,
    reconciler: SyncReconciler,
    title: TitleSync,
    autosave: Autosave,
    presence: PresenceTracker,
    local_presence: PresenceState,
    comments: Vec<Comment>,
    /// Set once the initial load finished; inbound snapshots wait for it
    initialized: bool,
    /// A user edit landed while a replay was settling; capture it afterwards
    capture_after_replay: bool,
}

impl SyncSession {
    pub fn new(replica: ReplicaId, user: UserInfo, config: SessionConfig) -> Result<Self> {
        let scene = Scene::new(config.canvas_width, config.canvas_height);
        let history = HistoryEngine::new(&scene, &config)?;
        Ok(Self {
            replica,
            history,
            suppression: Suppression::new(),
            reconciler: SyncReconciler::new(replica, config.publish_debounce()),
            title: TitleSync::new(replica, DEFAULT_TITLE),
            autosave: Autosave::new(config.autosave_interval()),
            presence: PresenceTracker::new(),
            local_presence: PresenceState::new(user),
            comments: Vec::new(),
            initialized: false,
            capture_after_replay: false,
            scene,
            config,
        })
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Finish initialisation with the design loaded from persistence, if any.
    ///
    /// The load runs under suppression, so it is neither recorded in history
    /// nor published. History starts empty with the loaded scene as baseline.
    pub fn load_design(&mut self, now: Instant, design: Option<DesignData>, title: Option<String>) -> Result<()> {
        if let Some(design) = design {
            let loaded = Snapshot::from_design(design)?;
            let _guard = self.suppression.acquire(now, self.config.load_settle());
            let report = snapshot::restore(&loaded, &mut self.scene)?;
            self.scene.take_events();
            self.autosave.mark_baseline(loaded.serialized());
            info!(objects = report.added, "loaded design");
        }
        if let Some(title) = title {
            self.title.set_baseline(title);
        }
        self.history.reset(&self.scene)?;
        self.initialized = true;
        Ok(())
    }

    /// Mutate the scene as a local user edit
    pub fn edit<R>(&mut self, now: Instant, f: impl FnOnce(&mut Scene) -> R) -> R {
        let out = f(&mut self.scene);
        self.route_scene_events(now);
        out
    }

    /// Add a new object with a freshly minted id
    pub fn add_object(&mut self, now: Instant, shape: Shape, transform: Transform) -> ObjectId {
        let id = ObjectId::generate(self.replica);
        let obj = SceneObject::new(id.clone(), shape, transform);
        self.edit(now, |scene| scene.add(obj));
        id
    }

    /// Drain scene notifications and route them to history, outbound and
    /// autosave, unless they were caused by a restore.
    ///
    /// Restores drain their own notifications while the guard is held, so
    /// anything seen during a settle window is a user edit. It is held back,
    /// never dropped: the publish waits in [`poll`](Self::poll) and the
    /// history capture waits for the replay to settle.
    fn route_scene_events(&mut self, now: Instant) {
        let events = self.scene.take_events();
        if events.is_empty() {
            return;
        }
        if self.suppression.is_held() {
            debug!(count = events.len(), "ignoring scene events from a restore");
            return;
        }
        if events.iter().any(|e| e.has_extent) && !self.history.record_mutation(now) {
            debug!("edit during replay settle, capture deferred");
            self.capture_after_replay = true;
        }
        self.reconciler.schedule_publish(now);
        self.autosave.touch(now);
    }

    pub fn undo(&mut self, now: Instant) -> Result<HistoryOutcome> {
        self.route_scene_events(now);
        let outcome = self.history.undo(&mut self.scene, now)?;
        self.after_replay(now, outcome);
        Ok(outcome)
    }

    pub fn redo(&mut self, now: Instant) -> Result<HistoryOutcome> {
        self.route_scene_events(now);
        let outcome = self.history.redo(&mut self.scene, now)?;
        self.after_replay(now, outcome);
        Ok(outcome)
    }

    fn after_replay(&mut self, now: Instant, outcome: HistoryOutcome) {
        // Replay notifications are discarded; they must not look like edits
        self.scene.take_events();
        if outcome == HistoryOutcome::Applied {
            self.autosave.touch(now);
        }
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_undo_safely(&self) -> bool {
        self.history.can_undo_safely()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn history(&self) -> &HistoryEngine {
        &self.history
    }

    pub fn subscribe_history(&self) -> tokio::sync::watch::Receiver<HistoryStatus> {
        self.history.subscribe()
    }

    /// The shared document changed (remote sync or any other reason)
    pub fn on_doc_changed(&mut self, now: Instant, doc: &SharedDoc) -> Result<DocUpdate> {
        self.route_scene_events(now);
        let mut update = DocUpdate::default();

        let local = if self.initialized {
            Some(snapshot::capture(&self.scene)?)
        } else {
            None
        };
        match self.reconciler.assess_inbound(doc, local.as_ref())? {
            InboundDecision::Apply(remote) => {
                self.apply_remote(now, &remote)?;
                update.scene_replaced = true;
            }
            decision => debug!(?decision, "inbound canvas not applied"),
        }

        update.title = self.title.assess_inbound(doc)?;
        if let Some(title) = &update.title {
            info!(%title, "title changed remotely");
        }

        let comments = doc.comments()?;
        if comments != self.comments {
            self.comments = comments;
            update.comments_changed = true;
        }
        Ok(update)
    }

    fn apply_remote(&mut self, now: Instant, remote: &Snapshot) -> Result<()> {
        {
            let _guard = self.suppression.acquire(now, self.config.inbound_settle());
            let report = snapshot::restore(remote, &mut self.scene)?;
            self.scene.take_events();
            debug!(removed = report.removed, added = report.added, "applied remote snapshot");
        }
        self.history.rebase(&self.scene)
    }

    /// Fire due timers: history capture/settle, outbound publish, autosave
    pub fn poll(&mut self, now: Instant, doc: &mut SharedDoc) -> Result<Vec<SessionEffect>> {
        self.route_scene_events(now);
        let mut effects = Vec::new();

        if let Some(tick) = self.history.poll(now, &self.scene)? {
            if tick == HistoryTick::Settled {
                // Peers must see the replayed state
                self.reconciler.publish_at(now);
                if std::mem::take(&mut self.capture_after_replay) {
                    self.history.record_mutation(now);
                }
                effects.push(SessionEffect::HistorySettled);
            }
        }

        if self.reconciler.publish_due(now) {
            if self.suppression.is_active(now) || self.history.is_replaying() {
                let at = [self.suppression.release_deadline(now), self.history.next_deadline()]
                    .into_iter()
                    .flatten()
                    .max()
                    .unwrap_or(now + self.config.publish_debounce());
                debug!("outbound publish held back until suppression ends");
                self.reconciler.defer_publish(at);
            } else if self.initialized {
                let snap = snapshot::capture(&self.scene)?;
                if self.reconciler.flush_publish(doc, &snap, now_ms())? == PublishOutcome::Published {
                    effects.push(SessionEffect::Published);
                }
            } else {
                self.reconciler.defer_publish(now + self.config.publish_debounce());
            }
        }

        if self.autosave.next_deadline().is_some_and(|at| now >= at) {
            let snap = snapshot::capture(&self.scene)?;
            if let Some(serialized) = self.autosave.take_due(now, snap.serialized()) {
                effects.push(SessionEffect::SaveDue(PendingSave {
                    design: snap.into_design(),
                    title: self.title.current().to_string(),
                    serialized,
                }));
            }
        }
        Ok(effects)
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.history.next_deadline(),
            self.reconciler.next_deadline(),
            self.autosave.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn autosave_succeeded(&mut self, serialized: &str) {
        self.autosave.mark_persisted(serialized);
    }

    pub fn autosave_failed(&mut self, now: Instant) {
        self.autosave.mark_failed(now);
    }

    /// Explicit save request: the current design, regardless of timers
    pub fn save_now(&self) -> Result<PendingSave> {
        let snap = snapshot::capture(&self.scene)?;
        Ok(PendingSave {
            title: self.title.current().to_string(),
            serialized: snap.serialized().to_string(),
            design: snap.into_design(),
        })
    }

    pub fn design_data(&self) -> Result<DesignData> {
        Ok(snapshot::capture(&self.scene)?.into_design())
    }

    pub fn title(&self) -> &str {
        self.title.current()
    }

    /// Rename locally and publish. Returns whether the document was written.
    pub fn set_title(&mut self, now: Instant, doc: &mut SharedDoc, title: &str) -> Result<bool> {
        let written = self.title.set_local(doc, title, now_ms())?;
        self.autosave.touch(now);
        Ok(written)
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    /// Post a comment into the shared log
    pub fn add_comment(&mut self, doc: &mut SharedDoc, text: &str) -> Result<Comment> {
        let author = Some(self.local_presence.user.id.as_str()).filter(|id| !id.is_empty());
        let comment = Comment::new(self.replica, author, text)?;
        doc.append_comment(&comment)?;
        self.comments = doc.comments()?;
        Ok(comment)
    }

    /// Merge comments fetched from persistence. Returns how many were new.
    pub fn merge_loaded_comments(&mut self, doc: &mut SharedDoc, loaded: &[Comment]) -> Result<usize> {
        let mut added = 0;
        for comment in loaded {
            if doc.append_comment(comment)? {
                added += 1;
            }
        }
        self.comments = doc.comments()?;
        Ok(added)
    }

    pub fn local_presence(&self) -> &PresenceState {
        &self.local_presence
    }

    /// Toggle the title-editing indicator; returns the state to broadcast
    pub fn set_editing_title(&mut self, editing: bool) -> PresenceState {
        self.local_presence.editing_title = editing;
        self.local_presence.clone()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut PresenceTracker {
        &mut self.presence
    }

    /// Apply one awareness message; returns whether the peer list changed
    pub fn apply_awareness(&mut self, msg: &AwarenessMessage) -> bool {
        self.presence.apply(msg)
    }

    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.presence.collaborators()
    }

    pub fn stats(&self) -> ReconcileStats {
        self.reconciler.stats()
    }
}
