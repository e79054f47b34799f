use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use designsync::comments::render_plain;
use designsync::config::SessionConfig;
use designsync::editor::{self, EditorEvent, EditorOptions};
use designsync::persist::{DesignStore, HttpDesignStore, MemoryDesignStore};
use designsync::presence::UserInfo;
use designsync::sync::relay::Relay;
use designsync::sync::TcpConnector;

/// Collaborative design sessions: relay and headless participant
#[derive(Parser, Debug)]
#[command(name = "designsync")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a session relay
    Relay {
        #[arg(long, env = "DESIGNSYNC_LISTEN", default_value = "127.0.0.1:7878")]
        listen: String,
    },
    /// Join a canvas session and log what happens in it until Ctrl-C
    Join {
        #[arg(long, env = "DESIGNSYNC_RELAY", default_value = "127.0.0.1:7878")]
        relay: String,
        /// Canvas id, also the relay session name
        #[arg(long, value_name = "ID")]
        session: String,
        /// Base URL of the canvas API; without it designs live in memory only
        #[arg(long, env = "DESIGNSYNC_API")]
        api: Option<String>,
        #[arg(long, default_value = "")]
        user_id: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        email: String,
        /// JSON file overriding session timings
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// List canvases stored behind the canvas API
    List {
        #[arg(long, env = "DESIGNSYNC_API")]
        api: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match args.command {
        Command::Relay { listen } => {
            let listener = TcpListener::bind(&listen).await?;
            Relay::new().serve(listener).await
        }
        Command::Join {
            relay,
            session,
            api,
            user_id,
            name,
            email,
            config,
        } => {
            let store: Arc<dyn DesignStore> = match api {
                Some(base) => Arc::new(HttpDesignStore::new(base)),
                None => Arc::new(MemoryDesignStore::new()),
            };
            let mut options = EditorOptions::new(session, UserInfo::new(user_id, name, email));
            if let Some(path) = config {
                options.session = SessionConfig::load(&path)?;
            }
            join(TcpConnector::new(relay), store, options).await
        }
        Command::List { api, limit, offset } => {
            let store = HttpDesignStore::new(api);
            for canvas in store.list(limit, offset).await? {
                let title = canvas.metadata.title.as_deref().unwrap_or("(untitled)");
                println!("{}\t{}", canvas.id, title);
            }
            Ok(())
        }
    }
}

async fn join(connector: TcpConnector, store: Arc<dyn DesignStore>, options: EditorOptions) -> Result<()> {
    let (handle, mut events) = editor::open(connector, store, options).await?;
    info!(replica = %handle.replica(), title = %handle.title().await?, "joined session");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    EditorEvent::SceneReplaced => {
                        let design = handle.design().await?;
                        info!(objects = design.objects.len(), "scene updated by a collaborator");
                    }
                    EditorEvent::TitleChanged(title) => info!(%title, "title changed"),
                    EditorEvent::CommentsChanged(comments) => {
                        if let Some(last) = comments.last() {
                            info!(
                                count = comments.len(),
                                author = %last.author_id,
                                text = %render_plain(&last.text),
                                "comments"
                            );
                        }
                    }
                    EditorEvent::CollaboratorsChanged(peers) => {
                        let names: Vec<_> = peers.iter().map(|p| p.name.as_str()).collect();
                        let editing_title: Vec<_> =
                            peers.iter().filter(|p| p.editing_title).map(|p| p.name.as_str()).collect();
                        info!(?names, ?editing_title, "collaborators");
                    }
                    EditorEvent::Saved => info!("saved"),
                    EditorEvent::PersistenceError(e) => warn!("persistence error: {e}"),
                    EditorEvent::HistorySettled => {}
                }
            }
        }
    }

    if let Err(e) = handle.save_now().await {
        warn!("final save failed: {e:#}");
    }
    handle.shutdown().await?;
    Ok(())
}
