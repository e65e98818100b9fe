use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{B2sError, Result};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Smallest spool budget that still fits one S3 multipart part.
pub const MIN_SPOOL_SIZE_BYTES: u64 = 5 * MIB;

fn default_log_level() -> String {
    "info".into()
}
fn default_state_path() -> PathBuf {
    PathBuf::from("~/.local/state/btrfs_to_s3/state.json")
}
fn default_lock_path() -> PathBuf {
    PathBuf::from("/var/lock/btrfs_to_s3.lock")
}
fn default_spool_dir() -> PathBuf {
    PathBuf::from("/mnt/ssd/btrfs_to_s3_spool")
}
fn default_spool_size_bytes() -> u64 {
    200 * GIB
}
fn default_full_every_days() -> u32 {
    180
}
fn default_incremental_every_days() -> u32 {
    7
}
fn default_run_at() -> String {
    "02:00".into()
}
fn default_snapshot_base_dir() -> PathBuf {
    PathBuf::from("/srv/snapshots")
}
fn default_snapshot_retain() -> usize {
    2
}
fn default_chunk_size_bytes() -> u64 {
    200 * GIB
}
fn default_part_size_bytes() -> u64 {
    128 * MIB
}
fn default_storage_class_chunks() -> String {
    "DEEP_ARCHIVE".into()
}
fn default_storage_class_manifest() -> String {
    "STANDARD".into()
}
fn default_concurrency() -> usize {
    4
}
fn default_sse() -> String {
    "AES256".into()
}
fn default_restore_target_base_dir() -> PathBuf {
    PathBuf::from("/srv/restore")
}
fn default_verify_mode() -> String {
    "full".into()
}
fn default_sample_max_files() -> usize {
    1000
}
fn default_wait_for_restore() -> bool {
    true
}
fn default_restore_timeout_seconds() -> u64 {
    72 * 60 * 60
}
fn default_restore_tier() -> String {
    "Standard".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub snapshots: SnapshotsConfig,
    pub subvolumes: SubvolumesConfig,
    pub s3: S3Config,
    #[serde(default)]
    pub restore: RestoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    #[serde(default = "default_spool_size_bytes")]
    pub spool_size_bytes: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            state_path: default_state_path(),
            lock_path: default_lock_path(),
            spool_dir: default_spool_dir(),
            spool_size_bytes: default_spool_size_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_full_every_days")]
    pub full_every_days: u32,
    #[serde(default = "default_incremental_every_days")]
    pub incremental_every_days: u32,
    /// Daily anchor for cadence evaluation, `HH:MM` 24-hour form.
    #[serde(default = "default_run_at")]
    pub run_at: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            full_every_days: default_full_every_days(),
            incremental_every_days: default_incremental_every_days(),
            run_at: default_run_at(),
        }
    }
}

impl ScheduleConfig {
    /// Parse `run_at` into (hour, minute).
    pub fn run_at_hm(&self) -> Result<(u32, u32)> {
        parse_run_at(&self.run_at)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotsConfig {
    #[serde(default = "default_snapshot_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_snapshot_retain")]
    pub retain: usize,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            base_dir: default_snapshot_base_dir(),
            retain: default_snapshot_retain(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubvolumesConfig {
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub prefix: String,
    /// Logical chunk size: one object in the bucket per chunk.
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: u64,
    /// Multipart part size within a chunk upload.
    #[serde(default = "default_part_size_bytes")]
    pub part_size_bytes: u64,
    #[serde(default = "default_storage_class_chunks")]
    pub storage_class_chunks: String,
    #[serde(default = "default_storage_class_manifest")]
    pub storage_class_manifest: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_sse")]
    pub sse: String,
    #[serde(default)]
    pub spool_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestoreConfig {
    #[serde(default = "default_restore_target_base_dir")]
    pub target_base_dir: PathBuf,
    #[serde(default = "default_verify_mode")]
    pub verify_mode: String,
    #[serde(default = "default_sample_max_files")]
    pub sample_max_files: usize,
    #[serde(default = "default_wait_for_restore")]
    pub wait_for_restore: bool,
    #[serde(default = "default_restore_timeout_seconds")]
    pub restore_timeout_seconds: u64,
    #[serde(default = "default_restore_tier")]
    pub restore_tier: String,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            target_base_dir: default_restore_target_base_dir(),
            verify_mode: default_verify_mode(),
            sample_max_files: default_sample_max_files(),
            wait_for_restore: default_wait_for_restore(),
            restore_timeout_seconds: default_restore_timeout_seconds(),
            restore_tier: default_restore_tier(),
        }
    }
}

impl Config {
    /// Load, tilde-expand, and validate a TOML config file.
    ///
    /// The path itself must be absolute so systemd units and cron entries
    /// cannot depend on a working directory.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.is_absolute() {
            return Err(B2sError::Config(format!(
                "config path must be absolute: {}",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            B2sError::Config(format!("failed to read config {}: {e}", path.display()))
        })?;
        Config::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Config> {
        let mut config: Config =
            toml::from_str(raw).map_err(|e| B2sError::Config(format!("invalid TOML: {e}")))?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    fn expand_paths(&mut self) {
        for p in [
            &mut self.global.state_path,
            &mut self.global.lock_path,
            &mut self.global.spool_dir,
            &mut self.snapshots.base_dir,
            &mut self.restore.target_base_dir,
        ] {
            *p = expand_tilde(p);
        }
        for p in &mut self.subvolumes.paths {
            *p = expand_tilde(p);
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_log_level(&self.global.log_level)?;
        validate_absolute(&self.global.state_path, "global.state_path")?;
        validate_absolute(&self.global.lock_path, "global.lock_path")?;
        validate_absolute(&self.global.spool_dir, "global.spool_dir")?;
        validate_positive(self.global.spool_size_bytes, "global.spool_size_bytes")?;

        validate_positive(self.schedule.full_every_days as u64, "schedule.full_every_days")?;
        validate_positive(
            self.schedule.incremental_every_days as u64,
            "schedule.incremental_every_days",
        )?;
        parse_run_at(&self.schedule.run_at)?;

        validate_absolute(&self.snapshots.base_dir, "snapshots.base_dir")?;
        if self.snapshots.retain < 1 {
            return Err(B2sError::Config("snapshots.retain must be >= 1".into()));
        }

        if self.subvolumes.paths.is_empty() {
            return Err(B2sError::Config(
                "subvolumes.paths must include at least one path".into(),
            ));
        }
        for path in &self.subvolumes.paths {
            validate_absolute(path, "subvolumes.paths")?;
        }

        validate_required(&self.s3.bucket, "s3.bucket")?;
        validate_required(&self.s3.region, "s3.region")?;
        validate_required(&self.s3.prefix, "s3.prefix")?;
        validate_positive(self.s3.chunk_size_bytes, "s3.chunk_size_bytes")?;
        validate_positive(self.s3.part_size_bytes, "s3.part_size_bytes")?;
        if self.s3.concurrency < 1 {
            return Err(B2sError::Config("s3.concurrency must be >= 1".into()));
        }
        validate_required(&self.s3.storage_class_chunks, "s3.storage_class_chunks")?;
        validate_required(&self.s3.storage_class_manifest, "s3.storage_class_manifest")?;
        validate_required(&self.s3.sse, "s3.sse")?;
        if self.s3.spool_enabled && self.global.spool_size_bytes < MIN_SPOOL_SIZE_BYTES {
            return Err(B2sError::Config(
                "global.spool_size_bytes must be >= 5 MiB when spooling is enabled".into(),
            ));
        }

        validate_absolute(&self.restore.target_base_dir, "restore.target_base_dir")?;
        if !matches!(self.restore.verify_mode.as_str(), "none" | "sample" | "full") {
            return Err(B2sError::Config(
                "restore.verify_mode must be full, sample, or none".into(),
            ));
        }
        validate_positive(self.restore.sample_max_files as u64, "restore.sample_max_files")?;
        validate_positive(
            self.restore.restore_timeout_seconds,
            "restore.restore_timeout_seconds",
        )?;
        validate_required(&self.restore.restore_tier, "restore.restore_tier")?;

        Ok(())
    }
}

/// Stable short name of a subvolume: the final path component.
pub fn subvolume_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| {
            B2sError::Config(format!(
                "subvolume path has no final component: {}",
                path.display()
            ))
        })
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    if let Some(suffix) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(suffix);
        }
    }
    path.to_path_buf()
}

fn parse_run_at(value: &str) -> Result<(u32, u32)> {
    let err = || B2sError::Config("schedule.run_at must be HH:MM".into());
    let (h, m) = value.split_once(':').ok_or_else(err)?;
    let hour: u32 = h.parse().map_err(|_| err())?;
    let minute: u32 = m.parse().map_err(|_| err())?;
    if hour > 23 || minute > 59 {
        return Err(err());
    }
    Ok((hour, minute))
}

fn validate_absolute(path: &Path, field: &str) -> Result<()> {
    if !path.is_absolute() {
        return Err(B2sError::Config(format!(
            "{field} must be an absolute path: {}",
            path.display()
        )));
    }
    Ok(())
}

fn validate_positive(value: u64, field: &str) -> Result<()> {
    if value == 0 {
        return Err(B2sError::Config(format!("{field} must be > 0")));
    }
    Ok(())
}

fn validate_required(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        return Err(B2sError::Config(format!("{field} is required")));
    }
    Ok(())
}

fn validate_log_level(value: &str) -> Result<()> {
    match value.to_ascii_lowercase().as_str() {
        "debug" | "info" | "warning" | "error" | "critical" => Ok(()),
        other => Err(B2sError::Config(format!(
            "global.log_level must be debug, info, warning, error, or critical; got {other}"
        ))),
    }
}
