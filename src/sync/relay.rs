//! Session relay: one shared document per room, hub and spoke.
//!
//! Each connection joins a room with `Hello`, gets a transient client id, and
//! then runs the automerge sync protocol against the room's document. Any
//! change a connection brings in wakes every other connection in the room.
//! Awareness records are kept per room and fanned out; when a connection
//! drops its record is removed and a `Leave` is broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use automerge::sync::State as SyncState;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::frame::{send_frame, Frame};
use super::protocol::{receive_sync_message, send_all_sync_messages, DocHandle};
use super::FrameReader;
use crate::document::SharedDoc;
use crate::presence::{AwarenessMessage, ClientId, PresenceRecord};

/// Awareness broadcast capacity per room
const AWARENESS_CAPACITY: usize = 64;

struct Room {
    doc: DocHandle,
    records: Mutex<HashMap<ClientId, PresenceRecord>>,
    /// (origin, message)
    awareness_tx: broadcast::Sender<(ClientId, AwarenessMessage)>,
    members: usize,
}

/// Relay shared by every connection
#[derive(Default)]
pub struct Relay {
    rooms: Mutex<HashMap<String, Arc<Mutex<Room>>>>,
    next_client: AtomicU64,
}

impl Relay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept TCP connections forever
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "relay listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle(stream).await {
                    debug!(%peer, "connection ended: {e}");
                }
            });
        }
    }

    /// Number of rooms with at least one member
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Copy of a room's document, if the room exists
    pub async fn room_doc(&self, session: &str) -> Option<SharedDoc> {
        let room = self.rooms.lock().await.get(session).cloned()?;
        let doc = room.lock().await.doc.clone();
        Some(doc.snapshot().await)
    }

    async fn enter(&self, session: &str) -> Arc<Mutex<Room>> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .entry(session.to_string())
            .or_insert_with(|| {
                info!(session, "opening room");
                let (awareness_tx, _) = broadcast::channel(AWARENESS_CAPACITY);
                Arc::new(Mutex::new(Room {
                    doc: DocHandle::new(SharedDoc::new()),
                    records: Mutex::new(HashMap::new()),
                    awareness_tx,
                    members: 0,
                }))
            })
            .clone();
        room.lock().await.members += 1;
        room
    }

    async fn exit(&self, session: &str, room: &Arc<Mutex<Room>>, client_id: ClientId) {
        let mut rooms = self.rooms.lock().await;
        let mut guard = room.lock().await;
        guard.records.lock().await.remove(&client_id);
        let _ = guard
            .awareness_tx
            .send((client_id, AwarenessMessage::Leave { client_id }));
        guard.members = guard.members.saturating_sub(1);
        if guard.members == 0 {
            info!(session, "closing empty room");
            rooms.remove(session);
        }
    }

    /// Serve one connection until it closes
    pub async fn handle<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut frames = FrameReader::spawn(reader);

        let session = match frames.recv().await {
            Some(Frame::Hello { session }) => session,
            Some(other) => bail!("expected Hello, got {other:?}"),
            None => bail!("connection closed before Hello"),
        };
        let client_id = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed) + 1);
        let room = self.enter(&session).await;
        info!(session, %client_id, "client joined");

        let result = self
            .run_member(&room, client_id, &mut frames, &mut writer)
            .await;

        self.exit(&session, &room, client_id).await;
        info!(session, %client_id, "client left");
        result
    }

    async fn run_member<S>(
        &self,
        room: &Arc<Mutex<Room>>,
        client_id: ClientId,
        frames: &mut FrameReader,
        writer: &mut WriteHalf<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (doc, mut awareness_rx, awareness_tx) = {
            let guard = room.lock().await;
            (
                guard.doc.clone(),
                guard.awareness_tx.subscribe(),
                guard.awareness_tx.clone(),
            )
        };
        let mut change_rx = doc.subscribe();
        change_rx.borrow_and_update();
        let mut sync_state = SyncState::new();

        send_frame(writer, &Frame::Welcome { client_id }).await?;
        send_all_sync_messages(&doc, writer, &mut sync_state).await?;
        self.send_records(room, client_id, writer).await?;

        loop {
            tokio::select! {
                result = change_rx.changed() => {
                    if result.is_err() {
                        break;
                    }
                    send_all_sync_messages(&doc, writer, &mut sync_state).await?;
                }
                result = awareness_rx.recv() => {
                    match result {
                        Ok((origin, msg)) if origin != client_id => {
                            send_frame(writer, &Frame::Awareness(msg)).await?;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%client_id, skipped, "awareness lagged, resending all records");
                            self.send_records(room, client_id, writer).await?;
                        }
                    }
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    match frame {
                        Frame::Sync(bytes) => {
                            if receive_sync_message(&doc, &mut sync_state, &bytes).await? {
                                doc.notify_changed();
                            }
                            send_all_sync_messages(&doc, writer, &mut sync_state).await?;
                        }
                        Frame::Awareness(AwarenessMessage::Update(mut record)) => {
                            // Clients cannot speak for other connections
                            record.client_id = client_id;
                            {
                                let guard = room.lock().await;
                                guard.records.lock().await.insert(client_id, record.clone());
                            }
                            let _ = awareness_tx.send((client_id, AwarenessMessage::Update(record)));
                        }
                        Frame::Awareness(AwarenessMessage::RequestAll) => {
                            self.send_records(room, client_id, writer).await?;
                        }
                        Frame::Awareness(AwarenessMessage::Leave { .. }) => {
                            {
                                let guard = room.lock().await;
                                guard.records.lock().await.remove(&client_id);
                            }
                            let _ = awareness_tx.send((client_id, AwarenessMessage::Leave { client_id }));
                        }
                        other => warn!(%client_id, "unexpected frame from client: {other:?}"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Send every other member's presence record
    async fn send_records<S>(
        &self,
        room: &Arc<Mutex<Room>>,
        client_id: ClientId,
        writer: &mut WriteHalf<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let records: Vec<PresenceRecord> = {
            let guard = room.lock().await;
            let records = guard.records.lock().await;
            records
                .values()
                .filter(|r| r.client_id != client_id)
                .cloned()
                .collect()
        };
        for record in records {
            send_frame(writer, &Frame::Awareness(AwarenessMessage::Update(record))).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ReplicaId;
    use crate::presence::{PresenceState, UserInfo};
    use crate::sync::frame::recv_frame;
    use automerge::sync::{Message as SyncMessage, State as SyncState, SyncDoc};
    use tokio::io::{duplex, split, DuplexStream};
    use tokio::time::{timeout, Duration};

    struct RawClient {
        frames: FrameReader,
        writer: WriteHalf<DuplexStream>,
    }

    impl RawClient {
        async fn connect(relay: &Arc<Relay>, session: &str) -> (Self, ClientId) {
            let (ours, theirs) = duplex(64 * 1024);
            tokio::spawn(relay.clone().handle(theirs));
            let (reader, writer) = split(ours);
            let mut client = Self {
                frames: FrameReader::spawn(reader),
                writer,
            };
            client
                .send(Frame::Hello {
                    session: session.into(),
                })
                .await;
            let Some(Frame::Welcome { client_id }) = client.recv(Duration::from_secs(5)).await
            else {
                panic!("expected Welcome");
            };
            (client, client_id)
        }

        async fn send(&mut self, frame: Frame) {
            send_frame(&mut self.writer, &frame).await.unwrap();
        }

        async fn recv(&mut self, wait: Duration) -> Option<Frame> {
            timeout(wait, self.frames.recv()).await.ok().flatten()
        }

        async fn recv_awareness(&mut self) -> AwarenessMessage {
            loop {
                match self.recv(Duration::from_secs(5)).await {
                    Some(Frame::Awareness(msg)) => return msg,
                    Some(_) => {}
                    None => panic!("timed out waiting for awareness"),
                }
            }
        }
    }

    fn update(name: &str) -> AwarenessMessage {
        AwarenessMessage::Update(PresenceRecord {
            client_id: ClientId(999),
            state: PresenceState::new(UserInfo::new(name, name, "")),
        })
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(Duration::from_secs(5), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn awareness_is_stamped_and_fanned_out() {
        let relay = Relay::new();
        let (mut a, a_id) = RawClient::connect(&relay, "room").await;
        let (mut b, b_id) = RawClient::connect(&relay, "room").await;
        assert_ne!(a_id, b_id);

        a.send(Frame::Awareness(update("ann"))).await;
        let AwarenessMessage::Update(seen) = b.recv_awareness().await else {
            panic!("expected update");
        };
        assert_eq!(seen.client_id, a_id);
        assert_eq!(seen.state.user.name, "ann");

        drop(a);
        assert_eq!(
            b.recv_awareness().await,
            AwarenessMessage::Leave { client_id: a_id }
        );
    }

    #[tokio::test]
    async fn late_joiner_gets_existing_records() {
        let relay = Relay::new();
        let (mut a, a_id) = RawClient::connect(&relay, "room").await;
        let (mut b, _) = RawClient::connect(&relay, "room").await;
        a.send(Frame::Awareness(update("ann"))).await;
        // Once b has seen it, the relay has stored it
        b.recv_awareness().await;

        let (mut c, _) = RawClient::connect(&relay, "room").await;
        let AwarenessMessage::Update(seen) = c.recv_awareness().await else {
            panic!("expected update");
        };
        assert_eq!(seen.client_id, a_id);
    }

    #[tokio::test]
    async fn rooms_are_isolated_and_dropped_when_empty() {
        let relay = Relay::new();
        let (mut a, _) = RawClient::connect(&relay, "one").await;
        let (b, _) = RawClient::connect(&relay, "two").await;
        assert_eq!(relay.room_count().await, 2);

        let mut doc = SharedDoc::new();
        doc.publish_title("only in one", ReplicaId(1), 1).unwrap();
        let mut state = SyncState::new();
        for _ in 0..10 {
            while let Some(msg) = doc.automerge().generate_sync_message(&mut state) {
                a.send(Frame::Sync(msg.encode())).await;
            }
            match a.recv(Duration::from_millis(200)).await {
                Some(Frame::Sync(bytes)) => {
                    let msg = SyncMessage::decode(&bytes).unwrap();
                    doc.automerge_mut()
                        .receive_sync_message(&mut state, msg)
                        .unwrap();
                }
                Some(_) => {}
                None => break,
            }
        }

        let relay_ref = &relay;
        wait_for(move || async move {
            match relay_ref.room_doc("one").await {
                Some(doc) => doc.title().ok().flatten().is_some(),
                None => false,
            }
        })
        .await;
        let one = relay.room_doc("one").await.unwrap();
        assert_eq!(one.title().unwrap().unwrap().title, "only in one");
        let two = relay.room_doc("two").await.unwrap();
        assert_eq!(two.title().unwrap(), None);

        drop(a);
        drop(b);
        wait_for(move || async move { relay_ref.room_count().await == 0 }).await;
    }

    #[tokio::test]
    async fn connection_without_hello_is_rejected() {
        let relay = Relay::new();
        let (mut ours, theirs) = duplex(1024);
        let task = tokio::spawn(relay.clone().handle(theirs));
        send_frame(&mut ours, &Frame::Sync(vec![])).await.unwrap();
        assert!(task.await.unwrap().is_err());
        // Relay side is gone, nothing was sent back
        assert!(recv_frame(&mut ours).await.is_err());
        assert_eq!(relay.room_count().await, 0);
    }
}
