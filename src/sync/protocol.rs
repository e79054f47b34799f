//! Automerge sync over frame streams.
//!
//! A [`DocHandle`] shares one [`SharedDoc`] between the editor and any number
//! of connection tasks. Local writes bump a watch counter so every connection
//! wakes up and sends what its peer is missing.

use std::sync::Arc;

use anyhow::Result;
use automerge::sync::{Message as SyncMessage, State as SyncState, SyncDoc};
use tokio::io::AsyncWrite;
use tokio::sync::{watch, Mutex, MutexGuard};

use super::frame::{send_frame, Frame};
use crate::document::SharedDoc;

/// Shared, lockable document plus a change signal
#[derive(Clone)]
pub struct DocHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocHandle").finish()
    }
}

struct Inner {
    doc: Mutex<SharedDoc>,
    /// Watch channel to signal local changes (never loses notifications)
    change_tx: watch::Sender<u64>,
}

impl DocHandle {
    pub fn new(doc: SharedDoc) -> Self {
        let (change_tx, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                doc: Mutex::new(doc),
                change_tx,
            }),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, SharedDoc> {
        self.inner.doc.lock().await
    }

    /// Run `f` on the document, then wake every connection
    pub async fn write<R>(&self, f: impl FnOnce(&mut SharedDoc) -> R) -> R {
        let out = {
            let mut doc = self.inner.doc.lock().await;
            f(&mut doc)
        };
        self.notify_changed();
        out
    }

    /// Signal that the document has changes peers may not have
    pub fn notify_changed(&self) {
        self.inner.change_tx.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.change_tx.subscribe()
    }

    /// Clone of the current document
    pub async fn snapshot(&self) -> SharedDoc {
        self.inner.doc.lock().await.clone()
    }
}

/// Send all pending sync messages until generate_sync_message returns None
pub async fn send_all_sync_messages<W: AsyncWrite + Unpin>(
    handle: &DocHandle,
    writer: &mut W,
    sync_state: &mut SyncState,
) -> Result<usize> {
    let mut sent = 0;
    loop {
        let msg = {
            let doc = handle.lock().await;
            doc.automerge().generate_sync_message(sync_state)
        };
        match msg {
            Some(msg) => {
                send_frame(writer, &Frame::Sync(msg.encode())).await?;
                sent += 1;
            }
            None => break,
        }
    }
    Ok(sent)
}

/// Apply one encoded sync message. Returns whether the document changed.
pub async fn receive_sync_message(
    handle: &DocHandle,
    sync_state: &mut SyncState,
    bytes: &[u8],
) -> Result<bool> {
    let msg = SyncMessage::decode(bytes)?;
    let mut doc = handle.lock().await;
    let before = doc.heads();
    doc.automerge_mut().receive_sync_message(sync_state, msg)?;
    Ok(doc.heads() != before)
}
