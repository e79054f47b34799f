//! The replicated document shared by every replica in a session.
//!
//! One automerge document per session holds:
//! - the last published scene snapshot (`json`) with its sender/time tags
//! - the canvas title with its own sender/time tags
//! - the comment log, one root key per comment (`comment/<id>`)
//!
//! Everything is a root-level scalar, so concurrent writers never race to
//! create a container object. Concurrent puts on the same key resolve
//! last-writer-wins by automerge's deterministic op ordering.

use anyhow::{anyhow, Result};
use automerge::{transaction::Transactable, Automerge, ChangeHash, ReadDoc, ScalarValue, ROOT};
use tracing::warn;

use crate::comments::{self, Comment};
use crate::ids::ReplicaId;

pub const KEY_JSON: &str = "json";
pub const KEY_UPDATED_AT: &str = "updatedAt";
pub const KEY_SENDER_ID: &str = "senderId";
pub const KEY_SENDER_TS: &str = "senderTs";
pub const KEY_TITLE: &str = "title";
pub const KEY_TITLE_SENDER_ID: &str = "titleSenderId";
pub const KEY_TITLE_SENDER_TS: &str = "titleSenderTs";
/// Prefix of the per-comment root keys
pub const COMMENT_PREFIX: &str = "comment/";

/// The published scene snapshot and who wrote it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasRecord {
    pub json: String,
    pub updated_at: u64,
    pub sender_id: Option<ReplicaId>,
    pub sender_ts: u64,
}

/// The shared title and who wrote it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleRecord {
    pub title: String,
    pub sender_id: Option<ReplicaId>,
    pub sender_ts: u64,
}

/// Automerge-backed shared map for one session
#[derive(Debug, Clone)]
pub struct SharedDoc {
    doc: Automerge,
}

impl SharedDoc {
    pub fn new() -> Self {
        Self {
            doc: Automerge::new(),
        }
    }

    pub fn from_automerge(doc: Automerge) -> Self {
        Self { doc }
    }

    /// Load from bytes produced by [`save`](Self::save)
    pub fn load(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            doc: Automerge::load(bytes)?,
        })
    }

    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// The underlying automerge document (for sync)
    pub fn automerge(&self) -> &Automerge {
        &self.doc
    }

    /// Mutable access (for applying sync messages)
    pub fn automerge_mut(&mut self) -> &mut Automerge {
        &mut self.doc
    }

    /// Merge every change from another replica's document
    pub fn merge(&mut self, other: &mut SharedDoc) -> Result<()> {
        self.doc.merge(&mut other.doc)?;
        Ok(())
    }

    pub fn heads(&mut self) -> Vec<ChangeHash> {
        self.doc.get_heads()
    }

    /// Write `{json, updatedAt, senderId, senderTs}` as one transaction.
    ///
    /// The keys are always written in this order, so when two replicas
    /// publish concurrently the same write wins on every key.
    pub fn publish_canvas(&mut self, json: &str, sender: ReplicaId, ts: u64) -> Result<()> {
        let mut tx = self.doc.transaction();
        tx.put(ROOT, KEY_JSON, json)?;
        tx.put(ROOT, KEY_UPDATED_AT, ts)?;
        tx.put(ROOT, KEY_SENDER_ID, sender.to_string())?;
        tx.put(ROOT, KEY_SENDER_TS, ts)?;
        tx.commit();
        Ok(())
    }

    /// Write `{title, titleSenderId, titleSenderTs}` as one transaction
    pub fn publish_title(&mut self, title: &str, sender: ReplicaId, ts: u64) -> Result<()> {
        let mut tx = self.doc.transaction();
        tx.put(ROOT, KEY_TITLE, title)?;
        tx.put(ROOT, KEY_TITLE_SENDER_ID, sender.to_string())?;
        tx.put(ROOT, KEY_TITLE_SENDER_TS, ts)?;
        tx.commit();
        Ok(())
    }

    /// Append a comment. Returns false if a comment with that id exists.
    pub fn append_comment(&mut self, comment: &Comment) -> Result<bool> {
        let key = format!("{COMMENT_PREFIX}{}", comment.id);
        if self.doc.get(ROOT, key.as_str())?.is_some() {
            return Ok(false);
        }
        let encoded = serde_json::to_string(comment)?;
        let mut tx = self.doc.transaction();
        tx.put(ROOT, key.as_str(), encoded)?;
        tx.commit();
        Ok(true)
    }

    /// The published canvas, if anyone has published one
    pub fn canvas(&self) -> Result<Option<CanvasRecord>> {
        let Some(json) = get_opt_string(&self.doc, KEY_JSON)? else {
            return Ok(None);
        };
        Ok(Some(CanvasRecord {
            json,
            updated_at: get_opt_u64(&self.doc, KEY_UPDATED_AT)?.unwrap_or(0),
            sender_id: get_opt_replica(&self.doc, KEY_SENDER_ID)?,
            sender_ts: get_opt_u64(&self.doc, KEY_SENDER_TS)?.unwrap_or(0),
        }))
    }

    /// The shared title, if anyone has set one
    pub fn title(&self) -> Result<Option<TitleRecord>> {
        let Some(title) = get_opt_string(&self.doc, KEY_TITLE)? else {
            return Ok(None);
        };
        Ok(Some(TitleRecord {
            title,
            sender_id: get_opt_replica(&self.doc, KEY_TITLE_SENDER_ID)?,
            sender_ts: get_opt_u64(&self.doc, KEY_TITLE_SENDER_TS)?.unwrap_or(0),
        }))
    }

    /// Every comment, in display order. Undecodable entries are skipped.
    pub fn comments(&self) -> Result<Vec<Comment>> {
        let mut out = Vec::new();
        for key in self.doc.keys(ROOT) {
            if !key.starts_with(COMMENT_PREFIX) {
                continue;
            }
            let Some(raw) = get_opt_string(&self.doc, &key)? else {
                continue;
            };
            match serde_json::from_str::<Comment>(&raw) {
                Ok(comment) => out.push(comment),
                Err(err) => warn!(key = %key, "skipping malformed comment: {err}"),
            }
        }
        comments::sort_for_display(&mut out);
        Ok(out)
    }

    pub fn comment_count(&self) -> usize {
        self.doc
            .keys(ROOT)
            .filter(|key| key.starts_with(COMMENT_PREFIX))
            .count()
    }
}

impl Default for SharedDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn get_opt_string(doc: &Automerge, key: &str) -> Result<Option<String>> {
    match doc.get(ROOT, key)? {
        Some((automerge::Value::Scalar(s), _)) => match s.as_ref() {
            ScalarValue::Str(v) => Ok(Some(v.to_string())),
            other => Err(anyhow!("expected string for key {key}, found {other}")),
        },
        Some(_) => Err(anyhow!("expected scalar for key {key}")),
        None => Ok(None),
    }
}

fn get_opt_u64(doc: &Automerge, key: &str) -> Result<Option<u64>> {
    match doc.get(ROOT, key)? {
        Some((automerge::Value::Scalar(s), _)) => match s.as_ref() {
            ScalarValue::Uint(n) => Ok(Some(*n)),
            ScalarValue::Int(n) | ScalarValue::Timestamp(n) => Ok(Some((*n).max(0) as u64)),
            ScalarValue::F64(n) => Ok(Some(n.max(0.0) as u64)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

fn get_opt_replica(doc: &Automerge, key: &str) -> Result<Option<ReplicaId>> {
    Ok(get_opt_string(doc, key)?.and_then(|raw| raw.parse().ok().map(ReplicaId)))
}
