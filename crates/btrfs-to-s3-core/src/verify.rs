use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{B2sError, Result};
use crate::platform::{stderr_text, CommandRunner};

/// Post-restore verification depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    None,
    Sample,
    Full,
}

impl VerifyMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(VerifyMode::None),
            "sample" => Ok(VerifyMode::Sample),
            "full" => Ok(VerifyMode::Full),
            other => Err(B2sError::Config(format!("unknown verify mode: {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerifyMode::None => "none",
            VerifyMode::Sample => "sample",
            VerifyMode::Full => "full",
        }
    }
}

/// Verify a restored subvolume against its reference snapshot.
///
/// `none` is a no-op. Otherwise Btrfs metadata is checked first; the content
/// phase runs only when the reference snapshot is still on disk, and is
/// reported as skipped when it is not.
pub fn verify_restore(
    source: Option<&Path>,
    target: &Path,
    mode: VerifyMode,
    sample_max_files: usize,
    runner: &dyn CommandRunner,
) -> Result<()> {
    if mode == VerifyMode::None {
        return Ok(());
    }
    verify_metadata(target, runner)?;
    let Some(source) = source.filter(|p| p.exists()) else {
        tracing::info!(target = %target.display(), "reference snapshot unavailable, content verification skipped");
        return Ok(());
    };
    verify_content(source, target, mode, sample_max_files)
}

/// Check that the target is a writable directory and a Btrfs subvolume with
/// a valid UUID.
pub fn verify_metadata(target: &Path, runner: &dyn CommandRunner) -> Result<()> {
    if !target.is_dir() {
        return Err(B2sError::Precondition(format!(
            "restore target is not a directory: {}",
            target.display()
        )));
    }
    if nix::unistd::access(target, nix::unistd::AccessFlags::W_OK).is_err() {
        return Err(B2sError::Precondition(format!(
            "restore target is not writable: {}",
            target.display()
        )));
    }
    let uuid = subvolume_uuid(target, runner)?;
    if uuid.is_none() {
        return Err(B2sError::Precondition(format!(
            "restore target has no valid UUID: {}",
            target.display()
        )));
    }
    Ok(())
}

/// UUID reported by `btrfs subvolume show`, or `None` when unparseable.
pub fn subvolume_uuid(target: &Path, runner: &dyn CommandRunner) -> Result<Option<String>> {
    let output = runner.run(&[
        "btrfs",
        "subvolume",
        "show",
        &target.to_string_lossy(),
    ])?;
    if !output.status.success() {
        return Err(B2sError::Precondition(format!(
            "restore target is not a subvolume: {}: {}",
            target.display(),
            stderr_text(&output)
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("UUID:") {
            let value = rest.trim();
            if is_uuid(value) {
                return Ok(Some(value.to_string()));
            }
            return Ok(None);
        }
    }
    Ok(None)
}

fn is_uuid(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (idx, b) in bytes.iter().enumerate() {
        match idx {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}

/// Compare the restored tree against the reference snapshot.
///
/// Directory and file sets must match exactly; symlink targets must match;
/// then regular files are size- and hash-compared: all of them for `full`,
/// the first `sample_max_files` in sorted order for `sample`. The first
/// discrepancy fails with the offending relative path.
pub fn verify_content(
    source: &Path,
    target: &Path,
    mode: VerifyMode,
    sample_max_files: usize,
) -> Result<()> {
    if !source.is_dir() {
        return Err(B2sError::Precondition(format!(
            "reference snapshot is not a directory: {}",
            source.display()
        )));
    }
    let (source_dirs, source_files) = collect_entries(source)?;
    let (target_dirs, target_files) = collect_entries(target)?;

    check_missing_extra(&source_dirs, &target_dirs, "directory")?;
    check_missing_extra(&source_files, &target_files, "file")?;

    for rel in &source_files {
        let source_type = entry_type(&source.join(rel));
        let target_type = entry_type(&target.join(rel));
        if source_type != target_type {
            return Err(B2sError::Integrity(format!("type mismatch for {rel}")));
        }
        if source_type == EntryType::Symlink {
            let source_link = std::fs::read_link(source.join(rel))?;
            let target_link = std::fs::read_link(target.join(rel))?;
            if source_link != target_link {
                return Err(B2sError::Integrity(format!("symlink mismatch for {rel}")));
            }
        }
    }

    let regular: Vec<&String> = source_files
        .iter()
        .filter(|rel| entry_type(&source.join(rel.as_str())) == EntryType::File)
        .collect();
    let to_check: Vec<&String> = match mode {
        VerifyMode::None => return Ok(()),
        VerifyMode::Full => regular,
        VerifyMode::Sample => regular.into_iter().take(sample_max_files).collect(),
    };

    for rel in to_check {
        let source_path = source.join(rel);
        let target_path = target.join(rel);
        let source_len = source_path.metadata()?.len();
        let target_len = target_path.metadata()?.len();
        if source_len != target_len {
            return Err(B2sError::Integrity(format!("size mismatch for {rel}")));
        }
        if hash_file(&source_path)? != hash_file(&target_path)? {
            return Err(B2sError::Integrity(format!("hash mismatch for {rel}")));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryType {
    File,
    Dir,
    Symlink,
    Missing,
    Other,
}

fn entry_type(path: &Path) -> EntryType {
    match path.symlink_metadata() {
        Err(_) => EntryType::Missing,
        Ok(meta) => {
            let ft = meta.file_type();
            if ft.is_symlink() {
                EntryType::Symlink
            } else if ft.is_file() {
                EntryType::File
            } else if ft.is_dir() {
                EntryType::Dir
            } else {
                EntryType::Other
            }
        }
    }
}

/// Relative directory and file paths under `base`, sorted. Symlinks are
/// listed with files regardless of what they point at.
fn collect_entries(base: &Path) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut dirs = BTreeSet::new();
    let mut files = BTreeSet::new();
    walk(base, base, &mut dirs, &mut files)?;
    Ok((dirs, files))
}

fn walk(
    base: &Path,
    dir: &Path,
    dirs: &mut BTreeSet<String>,
    files: &mut BTreeSet<String>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let rel = path
            .strip_prefix(base)
            .map_err(|e| B2sError::Other(format!("walk escaped base dir: {e}")))?
            .to_string_lossy()
            .to_string();
        match entry_type(&path) {
            EntryType::Dir => {
                dirs.insert(rel);
                walk(base, &path, dirs, files)?;
            }
            EntryType::Missing => {}
            _ => {
                files.insert(rel);
            }
        }
    }
    Ok(())
}

fn check_missing_extra(
    source: &BTreeSet<String>,
    target: &BTreeSet<String>,
    label: &str,
) -> Result<()> {
    if let Some(missing) = source.difference(target).next() {
        return Err(B2sError::Integrity(format!("missing {label}: {missing}")));
    }
    if let Some(extra) = target.difference(source).next() {
        return Err(B2sError::Integrity(format!("extra {label}: {extra}")));
    }
    Ok(())
}

/// Streamed SHA-256 of a file.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}
