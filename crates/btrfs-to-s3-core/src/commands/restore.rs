use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::Config;
use crate::error::{B2sError, Result};
use crate::manifest::{self, CurrentPointer, Manifest, ManifestKind};
use crate::metrics::{format_throughput, Metrics};
use crate::platform::{stderr_text, CommandRunner, SystemRunner};
use crate::storage::{is_restore_ready, needs_restore, s3, ObjectStore};
use crate::streamer::open_receive;
use crate::verify::{self, VerifyMode};

/// Days of restored-copy availability requested from RestoreObject.
const RESTORE_DAYS: i32 = 1;

/// Archive-restore poll backoff: 1s doubling to a 120s cap, full jitter.
const POLL_BASE_DELAY: Duration = Duration::from_secs(1);
const POLL_MAX_DELAY: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub subvolume: String,
    pub target: PathBuf,
    pub manifest_key: Option<String>,
    pub verify: Option<String>,
    pub wait_restore: Option<bool>,
    pub restore_timeout: Option<u64>,
}

/// Run the restore command against the real S3 store and btrfs tooling.
pub fn run(config: &Config, request: &RestoreRequest) -> Result<()> {
    if !s3::has_ambient_credentials() {
        return Err(B2sError::Storage(
            "no S3 credentials in the environment (AWS_PROFILE or key pair)".into(),
        ));
    }
    let store: Arc<dyn ObjectStore> =
        Arc::new(s3::S3Store::new(&config.s3.region, &config.s3.bucket)?);
    run_with(config, request, store, Arc::new(SystemRunner))
}

/// Restore driver with injectable store and command runner.
pub fn run_with(
    config: &Config,
    request: &RestoreRequest,
    store: Arc<dyn ObjectStore>,
    runner: Arc<dyn CommandRunner>,
) -> Result<()> {
    let prefix = manifest::normalize_prefix(&config.s3.prefix);
    let manifest_key = match &request.manifest_key {
        Some(key) => key.clone(),
        None => {
            let current_key = manifest::current_key(&prefix, &request.subvolume);
            fetch_pointer(store.as_ref(), &current_key)?.manifest_key
        }
    };

    let chain = resolve_manifest_chain(store.as_ref(), &manifest_key)?;
    info!(
        event = "restore_chain_resolved",
        subvolume = %request.subvolume,
        manifests = chain.len(),
        start = %manifest_key
    );

    if request.target.exists() {
        return Err(B2sError::Precondition(format!(
            "target path already exists: {}",
            request.target.display()
        )));
    }
    let receive_dir = request
        .target
        .parent()
        .ok_or_else(|| {
            B2sError::Precondition(format!(
                "target path has no parent directory: {}",
                request.target.display()
            ))
        })?
        .to_path_buf();
    std::fs::create_dir_all(&receive_dir)?;

    let wait_restore = request
        .wait_restore
        .unwrap_or(config.restore.wait_for_restore);
    let restore_timeout = Duration::from_secs(
        request
            .restore_timeout
            .unwrap_or(config.restore.restore_timeout_seconds),
    );

    let start = Instant::now();
    let mut total_bytes: u64 = 0;
    for manifest in &chain {
        ensure_chunks_ready(
            store.as_ref(),
            manifest,
            wait_restore,
            &config.restore.restore_tier,
            restore_timeout,
        )?;
        total_bytes += apply_manifest(
            store.as_ref(),
            manifest,
            &request.target,
            &receive_dir,
            runner.as_ref(),
        )?;
    }

    set_subvolume_writable(&request.target, runner.as_ref())?;
    if verify::subvolume_uuid(&request.target, runner.as_ref())?.is_none() {
        return Err(B2sError::Precondition(format!(
            "restored target has no valid UUID: {}",
            request.target.display()
        )));
    }

    let metrics = Metrics::new(total_bytes, start.elapsed().as_secs_f64());
    info!(
        event = "restore_metrics",
        subvolume = %request.subvolume,
        total_bytes = metrics.total_bytes,
        elapsed_seconds = metrics.elapsed_seconds,
        throughput = %format_throughput(metrics.throughput_bytes_per_sec())
    );

    let mode = match &request.verify {
        Some(mode) => VerifyMode::parse(mode)?,
        None => VerifyMode::parse(&config.restore.verify_mode)?,
    };
    if mode == VerifyMode::None {
        info!(event = "restore_verify_skipped", mode = "none");
    } else {
        let source = chain
            .last()
            .map(|m| PathBuf::from(&m.snapshot.path));
        verify::verify_restore(
            source.as_deref(),
            &request.target,
            mode,
            config.restore.sample_max_files,
            runner.as_ref(),
        )?;
        info!(event = "restore_verify_complete", mode = mode.as_str());
    }

    info!(event = "restore_complete", subvolume = %request.subvolume);
    Ok(())
}

/// Fetch and parse the subvolume's `current.json`.
pub fn fetch_pointer(store: &dyn ObjectStore, current_key: &str) -> Result<CurrentPointer> {
    let bytes = store.get(current_key)?.ok_or_else(|| {
        B2sError::Precondition(format!("missing pointer object: {current_key}"))
    })?;
    CurrentPointer::from_json_bytes(&bytes, current_key)
}

/// Walk `parent_manifest` links back to the full manifest, returning the
/// chain oldest-first. A missing or unreadable ancestor is fatal and the
/// error names the key.
pub fn resolve_manifest_chain(store: &dyn ObjectStore, start_key: &str) -> Result<Vec<Manifest>> {
    let mut manifests: Vec<Manifest> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut current_key = start_key.to_string();
    loop {
        if !seen.insert(current_key.clone()) {
            return Err(B2sError::Precondition(format!(
                "manifest chain loop detected at {current_key}"
            )));
        }
        let bytes = store.get(&current_key)?.ok_or_else(|| {
            B2sError::Precondition(format!("chain broken: missing manifest {current_key}"))
        })?;
        let manifest = Manifest::from_json_bytes(&bytes, &current_key)?;
        let parent = manifest.parent_manifest.clone();
        manifests.push(manifest);
        match parent {
            Some(parent) if !parent.is_empty() => current_key = parent,
            _ => break,
        }
    }
    manifests.reverse();
    match manifests.first() {
        Some(first) if first.kind == ManifestKind::Full => Ok(manifests),
        _ => Err(B2sError::Precondition(
            "manifest chain does not terminate at a full backup".into(),
        )),
    }
}

/// Make every chunk of a manifest readable, issuing RestoreObject and
/// polling for archival classes.
pub fn ensure_chunks_ready(
    store: &dyn ObjectStore,
    manifest: &Manifest,
    wait_restore: bool,
    restore_tier: &str,
    timeout: Duration,
) -> Result<()> {
    let mut pending: Vec<String> = Vec::new();
    for chunk in &manifest.chunks {
        let head = store.head(&chunk.key)?.ok_or_else(|| {
            B2sError::Precondition(format!("manifest references missing object: {}", chunk.key))
        })?;
        if !needs_restore(head.storage_class.as_deref()) {
            continue;
        }
        if is_restore_ready(head.restore.as_deref()) {
            continue;
        }
        if !wait_restore {
            return Err(B2sError::RestoreTimeout(format!(
                "{} is not restored and wait_for_restore is disabled",
                chunk.key
            )));
        }
        if head.restore.is_none() {
            store.restore_object(&chunk.key, restore_tier, RESTORE_DAYS)?;
            info!(event = "restore_requested", key = %chunk.key, tier = restore_tier);
        }
        pending.push(chunk.key.clone());
    }
    if pending.is_empty() {
        return Ok(());
    }

    let deadline = Instant::now() + timeout;
    let mut delay = POLL_BASE_DELAY;
    while !pending.is_empty() {
        if Instant::now() >= deadline {
            pending.sort();
            return Err(B2sError::RestoreTimeout(format!(
                "timed out waiting for archive restore of: {}",
                pending.join(", ")
            )));
        }
        let jitter_ms = rand::random::<u64>() % (delay.as_millis() as u64 + 1);
        std::thread::sleep(Duration::from_millis(jitter_ms));
        delay = (delay * 2).min(POLL_MAX_DELAY);

        let mut still_pending = Vec::new();
        for key in pending {
            let head = store.head(&key)?.ok_or_else(|| {
                B2sError::Precondition(format!("object vanished while awaiting restore: {key}"))
            })?;
            if !is_restore_ready(head.restore.as_deref()) {
                still_pending.push(key);
            }
        }
        pending = still_pending;
    }
    Ok(())
}

/// Replay one manifest's chunk stream into `btrfs receive` and move the
/// received subvolume onto the target path.
fn apply_manifest(
    store: &dyn ObjectStore,
    manifest: &Manifest,
    target: &Path,
    receive_dir: &Path,
    runner: &dyn CommandRunner,
) -> Result<u64> {
    let received_name = Path::new(&manifest.snapshot.path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| {
            B2sError::Precondition(format!(
                "{}: snapshot path has no final component",
                manifest.subvolume
            ))
        })?;

    let (receive, mut stdin) = open_receive(receive_dir)?;
    let stream_result = download_and_verify_chunks(store, manifest, &mut stdin);
    drop(stdin);

    let bytes_written = match stream_result {
        Ok(bytes) => {
            receive.finish()?;
            bytes
        }
        Err(e) => {
            let stderr = receive.abort();
            return Err(attach_receive_stderr(e, &stderr));
        }
    };

    let created = receive_dir.join(&received_name);
    if created.as_path() != target {
        if !created.exists() {
            return Err(B2sError::Receive(format!(
                "received subvolume missing: {}",
                created.display()
            )));
        }
        if target.exists() {
            delete_subvolume(target, runner)?;
        }
        std::fs::rename(&created, target)?;
    }
    Ok(bytes_written)
}

/// Stream every chunk in ordinal order into `output`, teeing each byte into
/// a SHA-256 computation and failing on the first digest mismatch.
pub fn download_and_verify_chunks(
    store: &dyn ObjectStore,
    manifest: &Manifest,
    output: &mut dyn Write,
) -> Result<u64> {
    let mut total: u64 = 0;
    let mut buf = vec![0u8; 1024 * 1024];
    for chunk in &manifest.chunks {
        let mut reader = store.get_reader(&chunk.key)?;
        let mut hasher = Sha256::new();
        let mut chunk_bytes: u64 = 0;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(B2sError::Storage(format!("GET {}: {e}", chunk.key))),
            };
            hasher.update(&buf[..n]);
            output.write_all(&buf[..n])?;
            chunk_bytes += n as u64;
        }
        let digest = hex::encode(hasher.finalize());
        if digest != chunk.sha256 {
            return Err(B2sError::Integrity(format!(
                "hash mismatch for {}: expected {}, got {digest}",
                chunk.key, chunk.sha256
            )));
        }
        total += chunk_bytes;
    }
    Ok(total)
}

/// Append the receive child's stderr tail to the original error message.
fn attach_receive_stderr(e: B2sError, stderr: &str) -> B2sError {
    if stderr.is_empty() {
        return e;
    }
    let enrich = |msg: String| format!("{msg}; btrfs receive: {stderr}");
    match e {
        B2sError::Storage(m) => B2sError::Storage(enrich(m)),
        B2sError::Integrity(m) => B2sError::Integrity(enrich(m)),
        B2sError::Receive(m) => B2sError::Receive(enrich(m)),
        B2sError::Io(io) => B2sError::Receive(enrich(io.to_string())),
        other => other,
    }
}

fn delete_subvolume(path: &Path, runner: &dyn CommandRunner) -> Result<()> {
    let output = runner.run(&["btrfs", "subvolume", "delete", &path.to_string_lossy()])?;
    if !output.status.success() {
        return Err(B2sError::Receive(format!(
            "failed to delete subvolume {}: {}",
            path.display(),
            stderr_text(&output)
        )));
    }
    Ok(())
}

fn set_subvolume_writable(path: &Path, runner: &dyn CommandRunner) -> Result<()> {
    let output = runner.run(&[
        "btrfs",
        "property",
        "set",
        "-f",
        "-ts",
        &path.to_string_lossy(),
        "ro",
        "false",
    ])?;
    if !output.status.success() {
        return Err(B2sError::Receive(format!(
            "failed to clear read-only flag on {}: {}",
            path.display(),
            stderr_text(&output)
        )));
    }
    Ok(())
}
