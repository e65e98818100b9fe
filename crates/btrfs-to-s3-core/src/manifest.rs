use serde::{Deserialize, Serialize};

use crate::error::{B2sError, Result};
use crate::snapshot::SnapshotKind;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    Full,
    Incremental,
}

impl ManifestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ManifestKind::Full => "full",
            ManifestKind::Incremental => "incremental",
        }
    }

    /// Directory component in the object layout (`full` | `inc`).
    pub fn dir_component(self) -> &'static str {
        match self {
            ManifestKind::Full => "full",
            ManifestKind::Incremental => "inc",
        }
    }

    pub fn snapshot_kind(self) -> SnapshotKind {
        match self {
            ManifestKind::Full => SnapshotKind::Full,
            ManifestKind::Incremental => SnapshotKind::Inc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub path: String,
    pub uuid: Option<String>,
    pub parent_uuid: Option<String>,
}

/// One uploaded chunk object, in ordinal order within the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub key: String,
    pub size: u64,
    pub sha256: String,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Descriptor {
    pub bucket: String,
    pub region: String,
    pub storage_class: String,
}

/// The durable description of one backup generation. Immutable once
/// published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub subvolume: String,
    pub kind: ManifestKind,
    pub created_at: String,
    pub snapshot: SnapshotInfo,
    pub parent_manifest: Option<String>,
    pub chunks: Vec<ChunkEntry>,
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub s3: S3Descriptor,
}

impl Manifest {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        let mut body = serde_json::to_vec_pretty(self)?;
        body.push(b'\n');
        Ok(body)
    }

    /// Parse and sanity-check a fetched manifest. `key` names the object in
    /// error messages.
    pub fn from_json_bytes(bytes: &[u8], key: &str) -> Result<Manifest> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| B2sError::Precondition(format!("{key}: invalid manifest: {e}")))?;
        if manifest.chunks.is_empty() {
            return Err(B2sError::Precondition(format!("{key}: manifest has no chunks")));
        }
        let sum: u64 = manifest.chunks.iter().map(|c| c.size).sum();
        if sum != manifest.total_bytes {
            return Err(B2sError::Precondition(format!(
                "{key}: chunk sizes sum to {sum}, total_bytes says {}",
                manifest.total_bytes
            )));
        }
        Ok(manifest)
    }
}

/// The per-subvolume pointer whose overwrite publishes a new generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentPointer {
    pub manifest_key: String,
    pub kind: ManifestKind,
    pub created_at: String,
}

impl CurrentPointer {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        let mut body = serde_json::to_vec_pretty(self)?;
        body.push(b'\n');
        Ok(body)
    }

    pub fn from_json_bytes(bytes: &[u8], key: &str) -> Result<CurrentPointer> {
        serde_json::from_slice(bytes)
            .map_err(|e| B2sError::Precondition(format!("{key}: invalid pointer: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Object-key layout
//
//   <prefix>/subvol/<name>/current.json
//   <prefix>/subvol/<name>/<full|inc>/<ts>/manifest.json
//   <prefix>/subvol/<name>/<full|inc>/<ts>/chunks/part-NNNNN.bin
// ---------------------------------------------------------------------------

/// Strip trailing slashes, then re-append exactly one for a non-empty prefix.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

pub fn current_key(prefix: &str, subvolume: &str) -> String {
    format!("{prefix}subvol/{subvolume}/current.json")
}

pub fn backup_prefix(prefix: &str, subvolume: &str, kind: ManifestKind, timestamp: &str) -> String {
    format!(
        "{prefix}subvol/{subvolume}/{}/{timestamp}/",
        kind.dir_component()
    )
}

pub fn manifest_key(prefix: &str, subvolume: &str, kind: ManifestKind, timestamp: &str) -> String {
    format!("{}manifest.json", backup_prefix(prefix, subvolume, kind, timestamp))
}

pub fn chunk_key(
    prefix: &str,
    subvolume: &str,
    kind: ManifestKind,
    timestamp: &str,
    index: u64,
) -> String {
    format!(
        "{}chunks/part-{index:05}.bin",
        backup_prefix(prefix, subvolume, kind, timestamp)
    )
}
