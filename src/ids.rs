//! Identity for replicas, scene objects and comments.
//!
//! Object and comment ids are built as `<replica>-<millis>-<suffix>`: the
//! replica tag scopes the id to its origin, the timestamp orders it, and the
//! random suffix separates ids minted in the same millisecond. Collisions are
//! not defended against at runtime; the construction makes them practically
//! impossible.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of the random part of a generated id
const SUFFIX_LEN: usize = 9;

/// Wall-clock milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identifier of one replica (one editor instance in one session).
///
/// Written into the shared document as `senderId` so that a replica can
/// recognise its own writes when they come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().as_u64_pair().0)
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a scene object. Assigned once, never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Mint a fresh id for an object created on `origin`
    pub fn generate(origin: ReplicaId) -> Self {
        Self(generate_id(origin))
    }

    /// Wrap an id that already exists (loaded from a snapshot or the API)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build a `<replica>-<millis>-<suffix>` id string
pub fn generate_id(origin: ReplicaId) -> String {
    format!("{}-{}-{}", origin, now_ms(), random_suffix())
}

fn random_suffix() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    raw[..SUFFIX_LEN].to_string()
}
