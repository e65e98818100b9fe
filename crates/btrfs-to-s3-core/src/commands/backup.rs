use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::chunker::Chunker;
use crate::config::{subvolume_name, Config};
use crate::error::{B2sError, Result};
use crate::lock::LockFile;
use crate::manifest::{
    self, ChunkEntry, CurrentPointer, Manifest, ManifestKind, S3Descriptor, SnapshotInfo,
    MANIFEST_VERSION,
};
use crate::metrics::{format_throughput, Metrics};
use crate::planner::{plan_subvolume, Plan};
use crate::platform::{CommandRunner, SystemRunner};
use crate::snapshot::{format_timestamp, Snapshot, SnapshotManager};
use crate::state::{load_state, save_state, State};
use crate::storage::{s3, ObjectStore, PutOptions};
use crate::streamer::open_send;
use crate::uploader::{SpoolSettings, Uploader};

#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub dry_run: bool,
    pub subvolumes: Vec<String>,
    pub once: bool,
    pub no_s3: bool,
}

/// Run the backup command against the real S3 store and btrfs tooling.
pub fn run(config: &Config, request: &BackupRequest, shutdown: &AtomicBool) -> Result<()> {
    let store: Option<Arc<dyn ObjectStore>> = if request.dry_run || request.no_s3 {
        None
    } else {
        if !s3::has_ambient_credentials() {
            return Err(B2sError::Storage(
                "no S3 credentials in the environment (AWS_PROFILE or key pair)".into(),
            ));
        }
        Some(Arc::new(s3::S3Store::new(
            &config.s3.region,
            &config.s3.bucket,
        )?))
    };
    run_with(config, request, store, Arc::new(SystemRunner), shutdown)
}

/// Backup driver with injectable store and command runner.
///
/// Acquires the lock, loads state, then per subvolume: snapshot, plan,
/// stream, chunk+upload, publish, persist state, prune. A failing
/// subvolume is logged and the driver moves on; the first failure becomes
/// the process result.
pub fn run_with(
    config: &Config,
    request: &BackupRequest,
    store: Option<Arc<dyn ObjectStore>>,
    runner: Arc<dyn CommandRunner>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let selected = select_subvolumes(config, &request.subvolumes)?;
    let now = Utc::now();
    let state = load_state(&config.global.state_path)?;
    let snapshot_manager = SnapshotManager::new(config.snapshots.base_dir.clone(), runner.clone());

    if request.dry_run {
        for path in &selected {
            let name = subvolume_name(path)?;
            let plan = plan_for(config, &state, &name, now, request.once);
            info!(
                event = "backup_plan",
                subvolume = %name,
                plan = plan.describe(),
                "dry run"
            );
        }
        return Ok(());
    }

    let mut lock = LockFile::new(config.global.lock_path.clone());
    lock.acquire()?;

    let timestamp = format_timestamp(now);
    let uploader = store.map(|store| {
        let spool = config.s3.spool_enabled.then(|| SpoolSettings {
            dir: config.global.spool_dir.clone(),
            size_bytes: config.global.spool_size_bytes,
        });
        Uploader::new(
            store,
            config.s3.part_size_bytes,
            config.s3.concurrency,
            spool,
        )
    });

    let mut state = state;
    let mut first_failure: Option<(String, B2sError)> = None;

    for path in &selected {
        let name = subvolume_name(path)?;
        if shutdown.load(Ordering::Relaxed) {
            first_failure.get_or_insert((name, B2sError::Interrupted));
            break;
        }
        let plan = plan_for(config, &state, &name, now, request.once);
        if let Plan::Skip { reason } = &plan {
            info!(event = "backup_not_due", subvolume = %name, reason = *reason, "skipping");
            continue;
        }
        let result = backup_subvolume(
            config,
            &name,
            path,
            &plan,
            now,
            &timestamp,
            &snapshot_manager,
            uploader.as_ref(),
            &mut state,
            shutdown,
        );
        if let Err(e) = result {
            error!(event = "backup_failed", subvolume = %name, error = %e);
            first_failure.get_or_insert((name, e));
        }
    }

    if uploader.is_some() && first_failure.is_none() {
        state.last_run_at = Some(timestamp);
        save_state(&config.global.state_path, &state)?;
    }

    lock.release();

    if let Some((subvolume, e)) = first_failure {
        error!(
            event = "backup_run_failed",
            first_failing_subvolume = %subvolume,
            error = %e,
            "backup run failed"
        );
        return Err(e);
    }
    Ok(())
}

fn plan_for(config: &Config, state: &State, name: &str, now: DateTime<Utc>, once: bool) -> Plan {
    plan_subvolume(
        name,
        state.subvolumes.get(name),
        &config.schedule,
        now,
        once,
        &|p: &Path| p.exists(),
    )
}

fn select_subvolumes(config: &Config, filter: &[String]) -> Result<Vec<PathBuf>> {
    if filter.is_empty() {
        return Ok(config.subvolumes.paths.clone());
    }
    let selected: Vec<PathBuf> = config
        .subvolumes
        .paths
        .iter()
        .filter(|path| {
            subvolume_name(path)
                .map(|name| filter.iter().any(|f| *f == name))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if selected.is_empty() {
        return Err(B2sError::Config(format!(
            "no configured subvolume matches the filter: {}",
            filter.join(", ")
        )));
    }
    Ok(selected)
}

#[allow(clippy::too_many_arguments)]
fn backup_subvolume(
    config: &Config,
    name: &str,
    subvolume_path: &Path,
    plan: &Plan,
    now: DateTime<Utc>,
    timestamp: &str,
    snapshot_manager: &SnapshotManager,
    uploader: Option<&Uploader>,
    state: &mut State,
    shutdown: &AtomicBool,
) -> Result<()> {
    let (kind, parent_snapshot, parent_manifest) = match plan {
        Plan::Full { .. } => (ManifestKind::Full, None, None),
        Plan::Incremental {
            parent_snapshot,
            parent_manifest,
        } => (
            ManifestKind::Incremental,
            Some(parent_snapshot.clone()),
            Some(parent_manifest.clone()),
        ),
        Plan::Skip { .. } => return Ok(()),
    };

    let snapshot =
        snapshot_manager.create(subvolume_path, name, kind.snapshot_kind(), now)?;
    info!(
        event = "snapshot_created",
        subvolume = %name,
        path = %snapshot.path.display(),
        kind = kind.snapshot_kind().as_str()
    );

    let start = Instant::now();
    let (total_bytes, chunks) = stream_and_upload(
        config,
        name,
        kind,
        timestamp,
        &snapshot,
        parent_snapshot.as_deref(),
        uploader,
        shutdown,
    )?;

    let metrics = Metrics::new(total_bytes, start.elapsed().as_secs_f64());
    info!(
        event = "backup_metrics",
        subvolume = %name,
        total_bytes = metrics.total_bytes,
        elapsed_seconds = metrics.elapsed_seconds,
        throughput = %format_throughput(metrics.throughput_bytes_per_sec())
    );

    let Some(uploader) = uploader else {
        info!(event = "backup_no_s3", subvolume = %name, chunk_count = chunks.len(), "uploads suppressed");
        return Ok(());
    };

    let prefix = manifest::normalize_prefix(&config.s3.prefix);
    let manifest_key = manifest::manifest_key(&prefix, name, kind, timestamp);
    let current_key = manifest::current_key(&prefix, name);
    let manifest = Manifest {
        version: MANIFEST_VERSION,
        subvolume: name.to_string(),
        kind,
        created_at: timestamp.to_string(),
        snapshot: SnapshotInfo {
            name: snapshot.name.clone(),
            path: snapshot.path.to_string_lossy().to_string(),
            uuid: None,
            parent_uuid: None,
        },
        parent_manifest: parent_manifest.clone(),
        chunks,
        total_bytes,
        chunk_size: config.s3.chunk_size_bytes,
        s3: S3Descriptor {
            bucket: config.s3.bucket.clone(),
            region: config.s3.region.clone(),
            storage_class: config.s3.storage_class_chunks.clone(),
        },
    };
    let pointer = CurrentPointer {
        manifest_key: manifest_key.clone(),
        kind,
        created_at: timestamp.to_string(),
    };

    publish(uploader, config, &manifest, &pointer, &manifest_key, &current_key)?;
    info!(
        event = "backup_published",
        subvolume = %name,
        manifest_key = %manifest_key,
        chunk_count = manifest.chunks.len()
    );

    let entry = state.subvolumes.entry(name.to_string()).or_default();
    entry.last_snapshot = Some(snapshot.name.clone());
    entry.last_snapshot_path = Some(snapshot.path.to_string_lossy().to_string());
    entry.last_manifest = Some(manifest_key);
    if kind == ManifestKind::Full {
        entry.last_full_at = Some(timestamp.to_string());
    }
    save_state(&config.global.state_path, state)?;

    snapshot_manager.prune(name, config.snapshots.retain, Some(&snapshot.name))?;
    Ok(())
}

/// Open the send stream and push every chunk through the uploader (or a
/// draining hasher under `--no-s3`).
#[allow(clippy::too_many_arguments)]
fn stream_and_upload(
    config: &Config,
    name: &str,
    kind: ManifestKind,
    timestamp: &str,
    snapshot: &Snapshot,
    parent_snapshot: Option<&Path>,
    uploader: Option<&Uploader>,
    shutdown: &AtomicBool,
) -> Result<(u64, Vec<ChunkEntry>)> {
    let prefix = manifest::normalize_prefix(&config.s3.prefix);
    let chunk_opts = PutOptions {
        storage_class: config.s3.storage_class_chunks.clone(),
        sse: config.s3.sse.clone(),
        content_type: None,
    };

    let (send, stdout) = open_send(&snapshot.path, parent_snapshot)?;
    let mut chunker = Chunker::new(stdout, config.s3.chunk_size_bytes)?;
    let mut chunks: Vec<ChunkEntry> = Vec::new();
    let mut total_bytes: u64 = 0;

    let stream_result = (|| -> Result<()> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(B2sError::Interrupted);
            }
            let Some(mut body) = chunker.next_chunk()? else {
                return Ok(());
            };
            let index = body.index();
            match uploader {
                Some(uploader) => {
                    let key = manifest::chunk_key(&prefix, name, kind, timestamp, index);
                    let outcome =
                        uploader.put_large(&key, &mut body, &chunk_opts, config.s3.chunk_size_bytes)?;
                    let (size, sha256) = body.finish()?;
                    chunks.push(ChunkEntry {
                        key,
                        size,
                        sha256,
                        etag: outcome.etag,
                    });
                    total_bytes += size;
                }
                None => {
                    std::io::copy(&mut body, &mut std::io::sink())?;
                    let (size, sha256) = body.finish()?;
                    info!(
                        event = "chunk_local",
                        subvolume = %name,
                        index,
                        size,
                        sha256 = %sha256
                    );
                    total_bytes += size;
                }
            }
        }
    })();

    drop(chunker);

    match stream_result {
        Ok(()) => {
            send.finish()?;
            Ok((total_bytes, chunks))
        }
        Err(e) => {
            let stderr = send.abort();
            error!(
                event = "backup_stream_failed",
                subvolume = %name,
                error = %e,
                btrfs_send_stderr = %stderr
            );
            Err(e)
        }
    }
}

/// Upload the manifest, then overwrite the pointer. State only moves after
/// the pointer PUT succeeds; a crash before that leaves the previous
/// generation published.
fn publish(
    uploader: &Uploader,
    config: &Config,
    manifest: &Manifest,
    pointer: &CurrentPointer,
    manifest_key: &str,
    current_key: &str,
) -> Result<()> {
    let opts = PutOptions {
        storage_class: config.s3.storage_class_manifest.clone(),
        sse: config.s3.sse.clone(),
        content_type: Some("application/json"),
    };
    uploader.put_small(manifest_key, &manifest.to_json_bytes()?, &opts)?;
    info!(event = "manifest_uploaded", key = %manifest_key);
    uploader.put_small(current_key, &pointer.to_json_bytes()?, &opts)?;
    info!(event = "pointer_updated", key = %current_key);
    Ok(())
}
