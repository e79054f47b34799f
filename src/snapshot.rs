//! Scene snapshot codec.
//!
//! A [`Snapshot`] is an immutable, self-contained serialization of the whole
//! scene. Its canonical JSON string is the only thing ever compared: two
//! snapshots are equal iff their strings are byte-identical. Object `id` and
//! `name` are part of every serialized object, so identity survives a
//! capture on one replica and a restore on another.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scene::{Scene, SceneObject};

/// Format version written into every snapshot
pub const DESIGN_VERSION: &str = "1";

/// Errors from decoding or restoring a snapshot
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("snapshot contains object id {0} more than once")]
    DuplicateId(String),
}

/// Persisted scene shape: `{objects, background, width, height}`.
///
/// This is exactly the `designData` object exchanged with the persistence API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignData {
    #[serde(default = "default_version")]
    pub version: String,
    pub objects: Vec<SceneObject>,
    #[serde(default)]
    pub background: Option<String>,
    pub width: f64,
    pub height: f64,
}

fn default_version() -> String {
    DESIGN_VERSION.to_string()
}

impl DesignData {
    pub fn empty(width: f64, height: f64) -> Self {
        Self {
            version: default_version(),
            objects: Vec::new(),
            background: None,
            width,
            height,
        }
    }
}

/// Immutable scene serialization with its canonical string form
#[derive(Debug, Clone)]
pub struct Snapshot {
    design: DesignData,
    serialized: String,
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.serialized == other.serialized
    }
}

impl Eq for Snapshot {}

impl Snapshot {
    /// Encode design data into its canonical form
    pub fn from_design(design: DesignData) -> Result<Self, CodecError> {
        let serialized = serde_json::to_string(&design)?;
        Ok(Self { design, serialized })
    }

    /// Decode a serialized snapshot (e.g. the shared document's `json` field).
    ///
    /// The canonical form is re-derived from the decoded value, so the result
    /// compares equal to a local capture of the same scene.
    pub fn parse(json: &str) -> Result<Self, CodecError> {
        let design: DesignData = serde_json::from_str(json)?;
        check_unique_ids(&design.objects)?;
        Self::from_design(design)
    }

    pub fn serialized(&self) -> &str {
        &self.serialized
    }

    pub fn design(&self) -> &DesignData {
        &self.design
    }

    pub fn into_design(self) -> DesignData {
        self.design
    }

    pub fn objects(&self) -> &[SceneObject] {
        &self.design.objects
    }

    /// True if restoring this snapshot would leave no objects
    pub fn is_blank(&self) -> bool {
        self.design.objects.is_empty()
    }
}

/// Counts reported by a completed restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreReport {
    pub removed: usize,
    pub added: usize,
}

/// Capture the scene, guides included
pub fn capture(scene: &Scene) -> Result<Snapshot, CodecError> {
    Snapshot::from_design(DesignData {
        version: default_version(),
        objects: scene.objects().to_vec(),
        background: scene.background().map(str::to_string),
        width: scene.width(),
        height: scene.height(),
    })
}

/// Replace the scene with the snapshot's contents.
///
/// Fires removed/added notifications on the scene; callers must hold the
/// suppression guard while those are drained.
pub fn restore(snapshot: &Snapshot, scene: &mut Scene) -> Result<RestoreReport, CodecError> {
    let design = snapshot.design();
    check_unique_ids(&design.objects)?;
    let report = RestoreReport {
        removed: scene.len(),
        added: design.objects.len(),
    };
    scene.replace_all(
        design.objects.clone(),
        design.background.clone(),
        design.width,
        design.height,
    );
    Ok(report)
}

fn check_unique_ids(objects: &[SceneObject]) -> Result<(), CodecError> {
    let mut seen = HashSet::with_capacity(objects.len());
    for obj in objects {
        if !seen.insert(obj.id().as_str()) {
            return Err(CodecError::DuplicateId(obj.id().to_string()));
        }
    }
    Ok(())
}
