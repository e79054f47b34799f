//! Async editor driver.
//!
//! [`open`] loads the canvas from a [`DesignStore`], joins the session relay
//! and spawns one task that owns the [`SyncSession`]. The task sleeps until
//! the session's next deadline, a command from the [`EditorHandle`], or a
//! channel event, and turns session effects into relay syncs and saves.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::comments::Comment;
use crate::config::SessionConfig;
use crate::document::SharedDoc;
use crate::history::{HistoryOutcome, HistoryStatus};
use crate::ids::{ObjectId, ReplicaId};
use crate::persist::{DesignStore, SaveRequest};
use crate::presence::{Collaborator, UserInfo};
use crate::scene::{Scene, Shape, Transform};
use crate::session::{DocUpdate, PendingSave, SessionEffect, SyncSession};
use crate::snapshot::DesignData;
use crate::sync::protocol::DocHandle;
use crate::sync::{self, ChannelConfig, ChannelEvent, ChannelHandle, ConnectionStatus, Connector};

/// A scene mutation shipped to the editor task
pub type SceneEdit = Box<dyn FnOnce(&mut Scene) + Send>;

#[derive(Debug, Clone)]
pub struct EditorOptions {
    pub canvas_id: String,
    pub user: UserInfo,
    pub session: SessionConfig,
    pub channel: ChannelConfig,
}

impl EditorOptions {
    /// Defaults, with the relay session named after the canvas
    pub fn new(canvas_id: impl Into<String>, user: UserInfo) -> Self {
        let canvas_id = canvas_id.into();
        Self {
            channel: ChannelConfig::new(canvas_id.clone()),
            canvas_id,
            user,
            session: SessionConfig::default(),
        }
    }
}

/// Notifications for whoever renders the editor
#[derive(Debug, Clone, PartialEq)]
pub enum EditorEvent {
    /// A remote snapshot replaced the scene
    SceneReplaced,
    TitleChanged(String),
    CommentsChanged(Vec<Comment>),
    CollaboratorsChanged(Vec<Collaborator>),
    /// An autosave or explicit save reached the store
    Saved,
    PersistenceError(String),
    /// An undo or redo finished settling
    HistorySettled,
}

enum EditorCommand {
    Edit(SceneEdit),
    AddObject {
        shape: Shape,
        transform: Transform,
        reply: oneshot::Sender<ObjectId>,
    },
    Undo(oneshot::Sender<Result<HistoryOutcome>>),
    Redo(oneshot::Sender<Result<HistoryOutcome>>),
    SetTitle(String),
    AddComment {
        text: String,
        reply: oneshot::Sender<Result<Comment>>,
    },
    SetEditingTitle(bool),
    SaveNow(oneshot::Sender<Result<()>>),
    Design(oneshot::Sender<Result<DesignData>>),
    Title(oneshot::Sender<String>),
    Collaborators(oneshot::Sender<Vec<Collaborator>>),
    Shutdown,
}

/// Handle to a running editor
pub struct EditorHandle {
    replica: ReplicaId,
    commands: mpsc::UnboundedSender<EditorCommand>,
    history: watch::Receiver<HistoryStatus>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<Result<SharedDoc>>,
}

/// Open `options.canvas_id`: load it, join its relay session, start the task
pub async fn open<C: Connector>(
    connector: C,
    store: Arc<dyn DesignStore>,
    options: EditorOptions,
) -> Result<(EditorHandle, mpsc::UnboundedReceiver<EditorEvent>)> {
    let EditorOptions {
        canvas_id,
        user,
        session: config,
        channel: channel_config,
    } = options;
    let replica = ReplicaId::random();
    let mut session = SyncSession::new(replica, user, config)?;

    let (design, title) = match store.load(&canvas_id).await {
        Ok(Some(saved)) => (Some(saved.design_data), saved.metadata.title),
        Ok(None) => {
            info!(canvas_id, "no saved design, starting blank");
            (None, None)
        }
        Err(e) => {
            warn!(canvas_id, "loading design failed, starting blank: {e}");
            (None, None)
        }
    };
    session.load_design(Instant::now(), design, title)?;

    let doc = DocHandle::new(SharedDoc::new());
    match store.fetch_comments(&canvas_id).await {
        Ok(loaded) => {
            let added = doc
                .write(|d| session.merge_loaded_comments(d, &loaded))
                .await?;
            debug!(canvas_id, added, "merged stored comments");
        }
        Err(e) => warn!(canvas_id, "fetching comments failed: {e}"),
    }

    let (channel, channel_events) = sync::join(connector, channel_config, doc.clone());
    channel.set_presence(session.local_presence().clone());

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let history = session.subscribe_history();
    let status = channel.subscribe_status();

    let driver = Driver {
        session,
        store,
        canvas_id,
        doc,
        events: event_tx,
    };
    let task = tokio::spawn(driver.run(channel, channel_events, command_rx));

    Ok((
        EditorHandle {
            replica,
            commands: command_tx,
            history,
            status,
            task,
        },
        event_rx,
    ))
}

impl EditorHandle {
    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    fn send(&self, cmd: EditorCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| anyhow!("editor task has stopped"))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EditorCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| anyhow!("editor task has stopped"))
    }

    /// Mutate the scene. History and publishing follow from the change.
    pub fn edit(&self, f: impl FnOnce(&mut Scene) + Send + 'static) -> Result<()> {
        self.send(EditorCommand::Edit(Box::new(f)))
    }

    pub async fn add_object(&self, shape: Shape, transform: Transform) -> Result<ObjectId> {
        self.request(|reply| EditorCommand::AddObject {
            shape,
            transform,
            reply,
        })
        .await
    }

    pub async fn undo(&self) -> Result<HistoryOutcome> {
        self.request(EditorCommand::Undo).await?
    }

    pub async fn redo(&self) -> Result<HistoryOutcome> {
        self.request(EditorCommand::Redo).await?
    }

    pub fn set_title(&self, title: impl Into<String>) -> Result<()> {
        self.send(EditorCommand::SetTitle(title.into()))
    }

    pub async fn add_comment(&self, text: impl Into<String>) -> Result<Comment> {
        let text = text.into();
        self.request(|reply| EditorCommand::AddComment { text, reply })
            .await?
    }

    pub fn set_editing_title(&self, editing: bool) -> Result<()> {
        self.send(EditorCommand::SetEditingTitle(editing))
    }

    /// Save immediately, outside the autosave schedule
    pub async fn save_now(&self) -> Result<()> {
        self.request(EditorCommand::SaveNow).await?
    }

    /// Current scene in persisted form
    pub async fn design(&self) -> Result<DesignData> {
        self.request(EditorCommand::Design).await?
    }

    pub async fn title(&self) -> Result<String> {
        self.request(EditorCommand::Title).await
    }

    pub async fn collaborators(&self) -> Result<Vec<Collaborator>> {
        self.request(EditorCommand::Collaborators).await
    }

    pub fn history_status(&self) -> HistoryStatus {
        *self.history.borrow()
    }

    pub fn subscribe_history(&self) -> watch::Receiver<HistoryStatus> {
        self.history.clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stop the editor, leave the session, and return the shared document
    pub async fn shutdown(self) -> Result<SharedDoc> {
        let _ = self.commands.send(EditorCommand::Shutdown);
        self.task.await?
    }
}

/// State owned by the editor task
struct Driver {
    session: SyncSession,
    store: Arc<dyn DesignStore>,
    canvas_id: String,
    doc: DocHandle,
    events: mpsc::UnboundedSender<EditorEvent>,
}

impl Driver {
    async fn run(
        mut self,
        channel: ChannelHandle,
        mut channel_events: mpsc::Receiver<ChannelEvent>,
        mut commands: mpsc::UnboundedReceiver<EditorCommand>,
    ) -> Result<SharedDoc> {
        let result = self
            .run_loop(&channel, &mut channel_events, &mut commands)
            .await;
        // Unblocks a channel task waiting on a full event queue
        drop(channel_events);
        let doc = channel.leave().await;
        info!(canvas_id = %self.canvas_id, "editor closed");
        result.map(|()| doc)
    }

    async fn run_loop(
        &mut self,
        channel: &ChannelHandle,
        channel_events: &mut mpsc::Receiver<ChannelEvent>,
        commands: &mut mpsc::UnboundedReceiver<EditorCommand>,
    ) -> Result<()> {
        loop {
            let deadline = self.session.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(EditorCommand::Shutdown) | None => return Ok(()),
                        Some(cmd) => self.handle_command(channel, cmd).await?,
                    }
                }
                event = channel_events.recv() => {
                    match event {
                        Some(event) => self.handle_channel_event(event).await?,
                        None => {
                            warn!("session channel stopped");
                            return Ok(());
                        }
                    }
                }
                _ = timer => {}
            }

            self.poll().await?;
        }
    }

    fn emit(&self, event: EditorEvent) {
        let _ = self.events.send(event);
    }

    async fn poll(&mut self) -> Result<()> {
        let effects = {
            let mut doc = self.doc.lock().await;
            self.session.poll(Instant::now(), &mut doc)?
        };
        for effect in effects {
            match effect {
                SessionEffect::Published => self.doc.notify_changed(),
                SessionEffect::HistorySettled => self.emit(EditorEvent::HistorySettled),
                SessionEffect::SaveDue(pending) => {
                    if let Err(e) = self.save(pending).await {
                        warn!("autosave failed: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Hand a save to the store and report the outcome to the session
    async fn save(&mut self, pending: PendingSave) -> Result<()> {
        let PendingSave {
            design,
            title,
            serialized,
        } = pending;
        let request = SaveRequest::new(design, title);
        match self.store.save(&self.canvas_id, &request).await {
            Ok(()) => {
                self.session.autosave_succeeded(&serialized);
                debug!(canvas_id = %self.canvas_id, "design saved");
                self.emit(EditorEvent::Saved);
                Ok(())
            }
            Err(e) => {
                self.session.autosave_failed(Instant::now());
                self.emit(EditorEvent::PersistenceError(e.to_string()));
                Err(e.into())
            }
        }
    }

    async fn handle_command(&mut self, channel: &ChannelHandle, cmd: EditorCommand) -> Result<()> {
        let now = Instant::now();
        match cmd {
            EditorCommand::Edit(f) => self.session.edit(now, f),
            EditorCommand::AddObject {
                shape,
                transform,
                reply,
            } => {
                let _ = reply.send(self.session.add_object(now, shape, transform));
            }
            EditorCommand::Undo(reply) => {
                let _ = reply.send(self.session.undo(now));
            }
            EditorCommand::Redo(reply) => {
                let _ = reply.send(self.session.redo(now));
            }
            EditorCommand::SetTitle(title) => {
                let written = {
                    let mut doc = self.doc.lock().await;
                    self.session.set_title(now, &mut doc, &title)?
                };
                if written {
                    self.doc.notify_changed();
                    self.emit(EditorEvent::TitleChanged(self.session.title().to_string()));
                }
            }
            EditorCommand::AddComment { text, reply } => {
                let added = {
                    let mut doc = self.doc.lock().await;
                    self.session.add_comment(&mut doc, &text)
                };
                if let Ok(comment) = &added {
                    self.doc.notify_changed();
                    self.emit(EditorEvent::CommentsChanged(self.session.comments().to_vec()));
                    if let Err(e) = self.store.post_comment(&self.canvas_id, comment).await {
                        warn!("storing comment failed: {e}");
                        self.emit(EditorEvent::PersistenceError(e.to_string()));
                    }
                }
                let _ = reply.send(added);
            }
            EditorCommand::SetEditingTitle(editing) => {
                channel.set_presence(self.session.set_editing_title(editing));
            }
            EditorCommand::SaveNow(reply) => {
                let result = match self.session.save_now() {
                    Ok(pending) => self.save(pending).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            EditorCommand::Design(reply) => {
                let _ = reply.send(self.session.design_data());
            }
            EditorCommand::Title(reply) => {
                let _ = reply.send(self.session.title().to_string());
            }
            EditorCommand::Collaborators(reply) => {
                let _ = reply.send(self.session.collaborators());
            }
            EditorCommand::Shutdown => {}
        }
        Ok(())
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Welcome { client_id } => {
                self.session.presence_mut().set_local(Some(client_id));
            }
            ChannelEvent::DocChanged => {
                let update = {
                    let doc = self.doc.lock().await;
                    self.session.on_doc_changed(Instant::now(), &doc)?
                };
                self.report(update);
            }
            ChannelEvent::Awareness(msg) => {
                if self.session.apply_awareness(&msg) {
                    self.emit(EditorEvent::CollaboratorsChanged(self.session.collaborators()));
                }
            }
            ChannelEvent::Disconnected => {
                if self.session.presence().peer_count() > 0 {
                    self.session.presence_mut().clear();
                    self.emit(EditorEvent::CollaboratorsChanged(Vec::new()));
                }
            }
        }
        Ok(())
    }

    fn report(&self, update: DocUpdate) {
        if update.scene_replaced {
            self.emit(EditorEvent::SceneReplaced);
        }
        if let Some(title) = update.title {
            self.emit(EditorEvent::TitleChanged(title));
        }
        if update.comments_changed {
            self.emit(EditorEvent::CommentsChanged(self.session.comments().to_vec()));
        }
    }
}
