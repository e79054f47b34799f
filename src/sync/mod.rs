//! Session transport: a relay that owns one shared document per session and
//! a reconnecting client channel.
//!
//! The automerge document is the source of truth. This module only moves it:
//! - [`relay`]: hub that every participant of a session connects to
//! - [`join`]: client side, runs the sync protocol and awareness against the
//!   relay and reconnects with a fresh sync state after any drop

pub mod frame;
pub mod protocol;
pub mod relay;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use automerge::sync::State as SyncState;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::document::SharedDoc;
use crate::presence::{AwarenessMessage, ClientId, PresenceRecord, PresenceState};
use frame::{recv_frame, send_frame, Frame};
use protocol::{receive_sync_message, send_all_sync_messages, DocHandle};

/// Default delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Frames read on a dedicated task, since [`recv_frame`] is not cancel-safe.
/// Dropping the reader stops the task.
pub struct FrameReader {
    rx: mpsc::Receiver<Frame>,
    task: JoinHandle<()>,
}

impl FrameReader {
    pub fn spawn<R>(mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(async move {
            loop {
                match recv_frame(&mut reader).await {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("frame reader stopped: {e}");
                        break;
                    }
                }
            }
        });
        Self { rx, task }
    }

    /// Next frame, or None once the stream has closed. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Opens byte streams to a relay
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> Result<Self::Stream>;
}

/// Connects to a relay over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to relay at {}", self.addr))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Session (room) name, normally the canvas id
    pub session: String,
    pub reconnect_delay: Duration,
}

impl ChannelConfig {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Events from the channel task to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Connected (or reconnected) with this transient client id
    Welcome { client_id: ClientId },
    /// The shared document took in remote changes
    DocChanged,
    Awareness(AwarenessMessage),
    /// Connection lost; every remote presence record is stale
    Disconnected,
}

#[derive(Debug)]
enum ChannelCommand {
    SetPresence(PresenceState),
    Leave,
}

/// Handle to a running channel
pub struct ChannelHandle {
    doc: DocHandle,
    command_tx: mpsc::UnboundedSender<ChannelCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    pub fn doc(&self) -> &DocHandle {
        &self.doc
    }

    /// Publish local presence. Kept and re-sent after reconnects.
    pub fn set_presence(&self, state: PresenceState) {
        let _ = self.command_tx.send(ChannelCommand::SetPresence(state));
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Announce departure, stop the task, and hand back the document
    pub async fn leave(self) -> SharedDoc {
        let _ = self.command_tx.send(ChannelCommand::Leave);
        if let Err(e) = self.task.await {
            warn!("channel task ended abnormally: {e}");
        }
        self.doc.snapshot().await
    }
}

/// Join a session through `connector`, syncing `doc` with the relay
pub fn join<C: Connector>(
    connector: C,
    config: ChannelConfig,
    doc: DocHandle,
) -> (ChannelHandle, mpsc::Receiver<ChannelEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);

    let task = tokio::spawn(run_channel(
        connector,
        config,
        doc.clone(),
        command_rx,
        event_tx,
        status_tx,
    ));

    (
        ChannelHandle {
            doc,
            command_tx,
            status_rx,
            task,
        },
        event_rx,
    )
}

enum ConnectionEnd {
    Closed,
    Left,
}

/// Apply a command that arrived while offline. Returns false on leave.
fn absorb_offline(cmd: Option<ChannelCommand>, presence: &mut Option<PresenceState>) -> bool {
    match cmd {
        Some(ChannelCommand::SetPresence(state)) => {
            *presence = Some(state);
            true
        }
        Some(ChannelCommand::Leave) | None => false,
    }
}

async fn run_channel<C: Connector>(
    connector: C,
    config: ChannelConfig,
    doc: DocHandle,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::Sender<ChannelEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let mut presence: Option<PresenceState> = None;

    loop {
        status_tx.send_replace(ConnectionStatus::Connecting);

        let connect = connector.connect();
        tokio::pin!(connect);
        let connected = loop {
            tokio::select! {
                result = &mut connect => break result,
                cmd = commands.recv() => {
                    if !absorb_offline(cmd, &mut presence) {
                        status_tx.send_replace(ConnectionStatus::Disconnected);
                        return;
                    }
                }
            }
        };

        match connected {
            Ok(stream) => {
                let end = run_connection(
                    stream,
                    &config,
                    &doc,
                    &mut commands,
                    &events,
                    &status_tx,
                    &mut presence,
                )
                .await;
                match end {
                    Ok(ConnectionEnd::Left) => {
                        status_tx.send_replace(ConnectionStatus::Disconnected);
                        return;
                    }
                    Ok(ConnectionEnd::Closed) => {
                        info!(session = %config.session, "relay closed the connection")
                    }
                    Err(e) => warn!(session = %config.session, "connection failed: {e:#}"),
                }
                let _ = events.send(ChannelEvent::Disconnected).await;
            }
            Err(e) => warn!(session = %config.session, "connect failed: {e:#}"),
        }

        status_tx.send_replace(ConnectionStatus::Disconnected);

        let backoff = tokio::time::sleep(config.reconnect_delay);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                _ = &mut backoff => break,
                cmd = commands.recv() => {
                    if !absorb_offline(cmd, &mut presence) {
                        return;
                    }
                }
            }
        }
    }
}

async fn run_connection<S>(
    stream: S,
    config: &ChannelConfig,
    doc: &DocHandle,
    commands: &mut mpsc::UnboundedReceiver<ChannelCommand>,
    events: &mpsc::Sender<ChannelEvent>,
    status_tx: &watch::Sender<ConnectionStatus>,
    presence: &mut Option<PresenceState>,
) -> Result<ConnectionEnd>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut frames = FrameReader::spawn(reader);

    send_frame(
        &mut writer,
        &Frame::Hello {
            session: config.session.clone(),
        },
    )
    .await?;
    let client_id = match frames.recv().await {
        Some(Frame::Welcome { client_id }) => client_id,
        Some(other) => bail!("expected Welcome, got {other:?}"),
        None => bail!("relay closed before Welcome"),
    };
    info!(session = %config.session, %client_id, "connected to relay");
    status_tx.send_replace(ConnectionStatus::Connected);
    let _ = events.send(ChannelEvent::Welcome { client_id }).await;

    // A new connection always starts from a fresh sync state
    let mut sync_state = SyncState::new();
    let mut change_rx = doc.subscribe();
    change_rx.borrow_and_update();

    send_all_sync_messages(doc, &mut writer, &mut sync_state).await?;
    send_frame(&mut writer, &Frame::Awareness(AwarenessMessage::RequestAll)).await?;
    if let Some(state) = presence.clone() {
        send_frame(
            &mut writer,
            &Frame::Awareness(AwarenessMessage::Update(PresenceRecord { client_id, state })),
        )
        .await?;
    }

    loop {
        tokio::select! {
            result = change_rx.changed() => {
                if result.is_err() {
                    return Ok(ConnectionEnd::Closed);
                }
                send_all_sync_messages(doc, &mut writer, &mut sync_state).await?;
            }
            frame = frames.recv() => {
                match frame {
                    None => return Ok(ConnectionEnd::Closed),
                    Some(Frame::Sync(bytes)) => {
                        if receive_sync_message(doc, &mut sync_state, &bytes).await? {
                            let _ = events.send(ChannelEvent::DocChanged).await;
                        }
                        send_all_sync_messages(doc, &mut writer, &mut sync_state).await?;
                    }
                    Some(Frame::Awareness(msg)) => {
                        let _ = events.send(ChannelEvent::Awareness(msg)).await;
                    }
                    Some(other) => warn!("unexpected frame from relay: {other:?}"),
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(ChannelCommand::SetPresence(state)) => {
                        *presence = Some(state.clone());
                        send_frame(
                            &mut writer,
                            &Frame::Awareness(AwarenessMessage::Update(PresenceRecord { client_id, state })),
                        )
                        .await?;
                    }
                    Some(ChannelCommand::Leave) | None => {
                        let leave = Frame::Awareness(AwarenessMessage::Leave { client_id });
                        if let Err(e) = send_frame(&mut writer, &leave).await {
                            debug!("leave not delivered: {e}");
                        }
                        return Ok(ConnectionEnd::Left);
                    }
                }
            }
        }
    }
}
