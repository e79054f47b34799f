//! Editors that lose their relay connection keep editing locally and catch
//! up after reconnecting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use designsync::config::SessionConfig;
use designsync::editor::{self, EditorEvent, EditorHandle, EditorOptions};
use designsync::persist::{DesignStore, MemoryDesignStore};
use designsync::presence::UserInfo;
use designsync::scene::{RectProps, Shape, Transform};
use designsync::sync::relay::Relay;
use designsync::sync::{ChannelConfig, ConnectionStatus, Connector};

/// Connects through a forwarding task that the test can cut
#[derive(Clone)]
struct FlakyConnector {
    relay: Arc<Relay>,
    online: Arc<AtomicBool>,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FlakyConnector {
    fn new(relay: &Arc<Relay>) -> Self {
        Self {
            relay: relay.clone(),
            online: Arc::new(AtomicBool::new(true)),
            links: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }

    fn go_online(&self) {
        self.online.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<DuplexStream> {
        if !self.online.load(Ordering::SeqCst) {
            bail!("network unreachable");
        }
        let (client, mut client_link) = duplex(256 * 1024);
        let (mut relay_link, relay_side) = duplex(256 * 1024);
        let relay = self.relay.clone();
        tokio::spawn(async move {
            let _ = relay.handle(relay_side).await;
        });
        let link = tokio::spawn(async move {
            let _ = tokio::io::copy_bidirectional(&mut client_link, &mut relay_link).await;
        });
        self.links.lock().unwrap().push(link);
        Ok(client)
    }
}

fn options(name: &str) -> EditorOptions {
    let mut options = EditorOptions::new("poster", UserInfo::new(name, name, ""));
    options.session = SessionConfig {
        history_debounce_ms: 20,
        history_settle_ms: 30,
        publish_debounce_ms: 20,
        inbound_settle_ms: 20,
        load_settle_ms: 10,
        autosave_interval_ms: 60_000,
        ..SessionConfig::default()
    };
    options.channel = ChannelConfig {
        session: "poster".into(),
        reconnect_delay: Duration::from_millis(50),
    };
    options
}

async fn open(
    connector: FlakyConnector,
    store: &Arc<MemoryDesignStore>,
    name: &str,
) -> (EditorHandle, mpsc::UnboundedReceiver<EditorEvent>) {
    let store: Arc<dyn DesignStore> = store.clone();
    let opened = editor::open(connector, store, options(name)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    opened
}

async fn wait_for_status(editor: &EditorHandle, status: ConnectionStatus) {
    let mut rx = editor.subscribe_connection();
    timeout(Duration::from_secs(5), rx.wait_for(|s| *s == status))
        .await
        .expect("timed out waiting for connection status")
        .unwrap();
}

async fn wait_for_objects(editor: &EditorHandle, count: usize) {
    timeout(Duration::from_secs(5), async {
        while editor.design().await.unwrap().objects.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for objects");
}

async fn wait_for_peers(events: &mut mpsc::UnboundedReceiver<EditorEvent>, count: usize) {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(EditorEvent::CollaboratorsChanged(peers)) = events.recv().await {
                if peers.len() == count {
                    return;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for collaborators");
}

fn rect(left: f64) -> (Shape, Transform) {
    (
        Shape::Rect(RectProps::default()),
        Transform::new(left, 0.0, 40.0, 40.0),
    )
}

#[tokio::test]
async fn offline_edits_reach_peers_after_reconnect() {
    let relay = Relay::new();
    let store = Arc::new(MemoryDesignStore::new());
    let flaky = FlakyConnector::new(&relay);
    let (a, _a_events) = open(flaky.clone(), &store, "ann").await;
    let (b, _b_events) = open(FlakyConnector::new(&relay), &store, "bob").await;

    let (shape, transform) = rect(0.0);
    a.add_object(shape, transform).await.unwrap();
    wait_for_objects(&b, 1).await;

    flaky.go_offline();
    wait_for_status(&a, ConnectionStatus::Disconnected).await;

    let (shape, transform) = rect(100.0);
    a.add_object(shape, transform).await.unwrap();
    wait_for_objects(&a, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.design().await.unwrap().objects.len(), 1);

    flaky.go_online();
    wait_for_status(&a, ConnectionStatus::Connected).await;
    wait_for_objects(&b, 2).await;

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn dropped_connection_clears_presence_until_rejoin() {
    let relay = Relay::new();
    let store = Arc::new(MemoryDesignStore::new());
    let flaky = FlakyConnector::new(&relay);
    let (a, _a_events) = open(flaky.clone(), &store, "ann").await;
    let (b, mut b_events) = open(FlakyConnector::new(&relay), &store, "bob").await;
    wait_for_peers(&mut b_events, 1).await;

    flaky.go_offline();
    wait_for_peers(&mut b_events, 0).await;

    flaky.go_online();
    wait_for_peers(&mut b_events, 1).await;
    let peers = b.collaborators().await.unwrap();
    assert_eq!(peers[0].name, "ann");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn leaving_hands_back_the_document() {
    let relay = Relay::new();
    let store = Arc::new(MemoryDesignStore::new());
    let (a, _events) = open(FlakyConnector::new(&relay), &store, "ann").await;
    a.set_title("Kept").unwrap();
    let doc = a.shutdown().await.unwrap();
    assert_eq!(doc.title().unwrap().unwrap().title, "Kept");
}
