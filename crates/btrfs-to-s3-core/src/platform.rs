use std::process::{Command, Output, Stdio};

use crate::error::{B2sError, Result};

/// Runs external commands with captured output.
///
/// The btrfs tooling is the only thing behind this seam; tests substitute a
/// fake runner so snapshot and restore logic can run without a Btrfs mount.
pub trait CommandRunner: Send + Sync {
    fn run(&self, args: &[&str]) -> Result<Output>;
}

/// Real runner: inherits the environment, with sbin directories appended to
/// PATH so `btrfs` resolves under cron/systemd.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, args: &[&str]) -> Result<Output> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| B2sError::Other("empty command".into()))?;
        let output = Command::new(program)
            .args(rest)
            .env("PATH", sbin_path())
            .stdin(Stdio::null())
            .output()?;
        Ok(output)
    }
}

/// Current PATH with `/usr/sbin` and `/sbin` appended when absent.
pub fn sbin_path() -> String {
    ensure_sbin_on_path(&std::env::var("PATH").unwrap_or_default())
}

pub fn ensure_sbin_on_path(path: &str) -> String {
    let mut parts: Vec<&str> = path.split(':').filter(|p| !p.is_empty()).collect();
    for entry in ["/usr/sbin", "/sbin"] {
        if !parts.contains(&entry) {
            parts.push(entry);
        }
    }
    parts.join(":")
}

/// Trimmed stderr of a finished command, for error messages.
pub fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_missing_sbin_entries() {
        assert_eq!(
            ensure_sbin_on_path("/usr/bin:/bin"),
            "/usr/bin:/bin:/usr/sbin:/sbin"
        );
    }

    #[test]
    fn keeps_existing_sbin_entries() {
        assert_eq!(
            ensure_sbin_on_path("/usr/sbin:/usr/bin:/sbin"),
            "/usr/sbin:/usr/bin:/sbin"
        );
    }

    #[test]
    fn empty_path_gets_sbin_only() {
        assert_eq!(ensure_sbin_on_path(""), "/usr/sbin:/sbin");
    }
}
