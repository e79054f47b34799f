//! Persistence boundary: where designs, titles and comments are stored
//! between sessions.
//!
//! The session never talks to storage itself. The editor driver loads the
//! design once at startup and hands autosaves to a [`DesignStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::comments::Comment;
use crate::snapshot::DesignData;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("canvas not found: {0}")]
    NotFound(String),
    #[error("persistence request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("persistence api returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("persistence api rejected the request: {0}")]
    Rejected(String),
    #[error("store unavailable")]
    Unavailable,
}

/// `metadata` object stored next to a design
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// A stored design as returned by `load`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedCanvas {
    pub design_data: DesignData,
    #[serde(default)]
    pub metadata: CanvasMetadata,
}

/// Body of a save request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub design_data: DesignData,
    pub metadata: CanvasMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl SaveRequest {
    pub fn new(design_data: DesignData, title: impl Into<String>) -> Self {
        Self {
            design_data,
            metadata: CanvasMetadata {
                title: Some(title.into()),
                ..CanvasMetadata::default()
            },
            image_url: None,
        }
    }
}

/// One row of the canvas listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasSummary {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub metadata: CanvasMetadata,
}

/// Storage for designs and comments
#[async_trait]
pub trait DesignStore: Send + Sync {
    /// `None` when no design was ever saved under this id
    async fn load(&self, canvas_id: &str) -> Result<Option<SavedCanvas>, PersistError>;

    async fn save(&self, canvas_id: &str, request: &SaveRequest) -> Result<(), PersistError>;

    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<CanvasSummary>, PersistError>;

    async fn post_comment(&self, canvas_id: &str, comment: &Comment) -> Result<(), PersistError>;

    async fn fetch_comments(&self, canvas_id: &str) -> Result<Vec<Comment>, PersistError>;
}

/// `{success, data, message}` wrapper used by every API response
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "default_success")]
    success: bool,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

fn default_success() -> bool {
    true
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<Option<T>, PersistError> {
        if !self.success {
            return Err(PersistError::Rejected(
                self.message.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        Ok(self.data)
    }
}

/// HTTP client for the canvas API (`{base}/canvas/...`)
#[derive(Debug, Clone)]
pub struct HttpDesignStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDesignStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn canvas_url(&self, canvas_id: &str) -> String {
        format!("{}/canvas/{}", self.base_url, canvas_id)
    }

    fn save_url(&self, canvas_id: &str) -> String {
        format!("{}/save", self.canvas_url(canvas_id))
    }

    fn comments_url(&self, canvas_id: &str) -> String {
        format!("{}/comments", self.canvas_url(canvas_id))
    }

    fn list_url(&self, limit: u32, offset: u32) -> String {
        format!("{}/canvas?limit={limit}&offset={offset}", self.base_url)
    }
}

/// Fail on non-2xx, keeping the body for the error message
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, PersistError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(PersistError::Status { status, body })
}

async fn read_envelope<T: DeserializeOwned>(resp: reqwest::Response) -> Result<Option<T>, PersistError> {
    let envelope: Envelope<T> = check_status(resp).await?.json().await?;
    envelope.into_data()
}

#[async_trait]
impl DesignStore for HttpDesignStore {
    async fn load(&self, canvas_id: &str) -> Result<Option<SavedCanvas>, PersistError> {
        let resp = self.client.get(self.canvas_url(canvas_id)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(canvas_id, "no saved canvas, starting fresh");
            return Ok(None);
        }
        read_envelope(resp).await
    }

    async fn save(&self, canvas_id: &str, request: &SaveRequest) -> Result<(), PersistError> {
        let resp = self
            .client
            .post(self.save_url(canvas_id))
            .json(request)
            .send()
            .await?;
        read_envelope::<serde_json::Value>(resp).await?;
        Ok(())
    }

    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<CanvasSummary>, PersistError> {
        let resp = self.client.get(self.list_url(limit, offset)).send().await?;
        Ok(read_envelope(resp).await?.unwrap_or_default())
    }

    async fn post_comment(&self, canvas_id: &str, comment: &Comment) -> Result<(), PersistError> {
        let resp = self
            .client
            .post(self.comments_url(canvas_id))
            .json(comment)
            .send()
            .await?;
        read_envelope::<serde_json::Value>(resp).await?;
        Ok(())
    }

    async fn fetch_comments(&self, canvas_id: &str) -> Result<Vec<Comment>, PersistError> {
        let resp = self.client.get(self.comments_url(canvas_id)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Ok(read_envelope(resp).await?.unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    canvases: HashMap<String, SavedCanvas>,
    comments: HashMap<String, Vec<Comment>>,
    saves: usize,
    failing: bool,
}

/// In-process store for offline sessions and tests
#[derive(Debug, Default)]
pub struct MemoryDesignStore {
    state: Mutex<MemoryState>,
}

impl MemoryDesignStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`PersistError::Unavailable`] until reset
    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    /// Number of successful saves so far
    pub async fn save_count(&self) -> usize {
        self.state.lock().await.saves
    }

    pub async fn insert(&self, canvas_id: &str, canvas: SavedCanvas) {
        self.state.lock().await.canvases.insert(canvas_id.to_string(), canvas);
    }
}

#[async_trait]
impl DesignStore for MemoryDesignStore {
    async fn load(&self, canvas_id: &str) -> Result<Option<SavedCanvas>, PersistError> {
        let state = self.state.lock().await;
        if state.failing {
            return Err(PersistError::Unavailable);
        }
        Ok(state.canvases.get(canvas_id).cloned())
    }

    async fn save(&self, canvas_id: &str, request: &SaveRequest) -> Result<(), PersistError> {
        let mut state = self.state.lock().await;
        if state.failing {
            return Err(PersistError::Unavailable);
        }
        state.canvases.insert(
            canvas_id.to_string(),
            SavedCanvas {
                design_data: request.design_data.clone(),
                metadata: request.metadata.clone(),
            },
        );
        state.saves += 1;
        Ok(())
    }

    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<CanvasSummary>, PersistError> {
        let state = self.state.lock().await;
        if state.failing {
            return Err(PersistError::Unavailable);
        }
        let mut ids: Vec<&String> = state.canvases.keys().collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|id| CanvasSummary {
                id: id.clone(),
                metadata: state.canvases[id].metadata.clone(),
            })
            .collect())
    }

    async fn post_comment(&self, canvas_id: &str, comment: &Comment) -> Result<(), PersistError> {
        let mut state = self.state.lock().await;
        if state.failing {
            return Err(PersistError::Unavailable);
        }
        let log = state.comments.entry(canvas_id.to_string()).or_default();
        if !log.iter().any(|c| c.id == comment.id) {
            log.push(comment.clone());
        }
        Ok(())
    }

    async fn fetch_comments(&self, canvas_id: &str) -> Result<Vec<Comment>, PersistError> {
        let state = self.state.lock().await;
        if state.failing {
            return Err(PersistError::Unavailable);
        }
        Ok(state.comments.get(canvas_id).cloned().unwrap_or_default())
    }
}
