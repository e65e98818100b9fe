use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{B2sError, Result};
use crate::platform::{stderr_text, CommandRunner};

/// Timestamp format used in snapshot names, manifests, and object keys.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Full,
    Inc,
}

impl SnapshotKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotKind::Full => "full",
            SnapshotKind::Inc => "inc",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(SnapshotKind::Full),
            "inc" => Some(SnapshotKind::Inc),
            _ => None,
        }
    }
}

/// A read-only snapshot on the snapshot filesystem.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub name: String,
    pub path: PathBuf,
    pub kind: SnapshotKind,
    pub created_at: DateTime<Utc>,
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// `<subvol>__<timestamp>__<kind>`
pub fn snapshot_name(subvolume: &str, at: DateTime<Utc>, kind: SnapshotKind) -> String {
    format!("{subvolume}__{}__{}", format_timestamp(at), kind.as_str())
}

/// Parse a snapshot name back into (subvolume, created_at, kind).
///
/// The subvolume part may itself contain `__`, so the name is split from the
/// right. Returns `None` for anything that does not match the pattern.
pub fn parse_snapshot_name(name: &str) -> Option<(String, DateTime<Utc>, SnapshotKind)> {
    let mut parts = name.rsplitn(3, "__");
    let kind = SnapshotKind::parse(parts.next()?)?;
    let created_at = parse_timestamp(parts.next()?)?;
    let subvolume = parts.next()?;
    if subvolume.is_empty() {
        return None;
    }
    Some((subvolume.to_string(), created_at, kind))
}

/// Creates, lists, and prunes read-only snapshots under one base directory.
pub struct SnapshotManager {
    base_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl SnapshotManager {
    pub fn new(base_dir: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self { base_dir, runner }
    }

    /// Create a read-only snapshot named for `subvolume` at `at`.
    ///
    /// Names carry second-resolution timestamps; a collision within one
    /// second on the same subvolume means two runs raced past the lock and
    /// is treated as a fatal environment error.
    pub fn create(
        &self,
        subvolume_path: &Path,
        subvolume: &str,
        kind: SnapshotKind,
        at: DateTime<Utc>,
    ) -> Result<Snapshot> {
        let name = snapshot_name(subvolume, at, kind);
        let path = self.base_dir.join(&name);
        if path.exists() {
            return Err(B2sError::Snapshot(format!(
                "snapshot path already exists: {}",
                path.display()
            )));
        }
        std::fs::create_dir_all(&self.base_dir)?;
        self.run_btrfs(&[
            "btrfs",
            "subvolume",
            "snapshot",
            "-r",
            &subvolume_path.to_string_lossy(),
            &path.to_string_lossy(),
        ])?;
        Ok(Snapshot {
            name,
            path,
            kind,
            created_at: at,
        })
    }

    /// All snapshots of `subvolume`, newest first. Entries whose names do
    /// not parse are ignored.
    pub fn list(&self, subvolume: &str) -> Result<Vec<Snapshot>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some((name, created_at, kind)) = parse_snapshot_name(&file_name) else {
                continue;
            };
            if name != subvolume {
                continue;
            }
            snapshots.push(Snapshot {
                name: file_name,
                path: entry.path(),
                kind,
                created_at,
            });
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    /// Delete snapshots of `subvolume` beyond the `retain` newest,
    /// unconditionally preserving `required_parent`.
    pub fn prune(
        &self,
        subvolume: &str,
        retain: usize,
        required_parent: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        let snapshots = self.list(subvolume)?;
        let mut deleted = Vec::new();
        for (idx, snapshot) in snapshots.iter().enumerate() {
            if idx < retain {
                continue;
            }
            if required_parent == Some(snapshot.name.as_str()) {
                continue;
            }
            self.run_btrfs(&[
                "btrfs",
                "subvolume",
                "delete",
                &snapshot.path.to_string_lossy(),
            ])?;
            tracing::info!(snapshot = %snapshot.name, "pruned snapshot");
            deleted.push(snapshot.path.clone());
        }
        Ok(deleted)
    }

    fn run_btrfs(&self, args: &[&str]) -> Result<()> {
        let output = self.runner.run(args)?;
        if !output.status.success() {
            return Err(B2sError::Snapshot(format!(
                "`{}` failed: {}",
                args.join(" "),
                stderr_text(&output)
            )));
        }
        Ok(())
    }
}
