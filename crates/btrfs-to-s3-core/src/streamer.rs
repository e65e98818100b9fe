use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{B2sError, Result};
use crate::platform;

/// Newest stderr bytes kept per child process.
const STDERR_RING_BYTES: usize = 64 * 1024;

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// `btrfs send` child with its stdout pipe and captured stderr.
///
/// Exactly one of [`finish`](SendStream::finish) or
/// [`abort`](SendStream::abort) must end the stream; if neither runs (panic,
/// early `?`), `Drop` kills and reaps the child so no orphan survives.
pub struct SendStream {
    child: Child,
    stderr_thread: Option<JoinHandle<Vec<u8>>>,
}

/// Spawn `btrfs send [-p parent] <snapshot>` and hand back the stream
/// together with its stdout pipe.
pub fn open_send(snapshot: &Path, parent: Option<&Path>) -> Result<(SendStream, ChildStdout)> {
    let mut cmd = Command::new("btrfs");
    cmd.arg("send");
    if let Some(parent) = parent {
        cmd.arg("-p").arg(parent);
    }
    cmd.arg(snapshot)
        .env("PATH", platform::sbin_path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| B2sError::Send(format!("failed to spawn btrfs send: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| B2sError::Send("btrfs send stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| B2sError::Send("btrfs send stderr not captured".into()))?;
    let stream = SendStream {
        child,
        stderr_thread: Some(drain_stderr(stderr)),
    };
    Ok((stream, stdout))
}

impl SendStream {
    /// Wait for the child after its stream was consumed to EOF.
    ///
    /// The caller must have dropped the stdout pipe first, otherwise a child
    /// blocked on a full pipe never exits.
    pub fn finish(mut self) -> Result<()> {
        let status = self.child.wait()?;
        let stderr = self.join_stderr();
        if !status.success() {
            return Err(B2sError::Send(format!(
                "btrfs send exited with {status}: {stderr}"
            )));
        }
        Ok(())
    }

    /// Terminate the child on the error path and return its stderr tail.
    pub fn abort(mut self) -> String {
        terminate_child(&mut self.child);
        self.join_stderr()
    }

    fn join_stderr(&mut self) -> String {
        join_stderr_thread(&mut self.stderr_thread)
    }
}

impl Drop for SendStream {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            terminate_child(&mut self.child);
        }
        let _ = join_stderr_thread(&mut self.stderr_thread);
    }
}

/// `btrfs receive` child with its stdin pipe and captured stderr.
pub struct ReceiveProcess {
    child: Child,
    stderr_thread: Option<JoinHandle<Vec<u8>>>,
}

/// Spawn `btrfs receive <dir>` and hand back the process with its stdin pipe.
pub fn open_receive(receive_dir: &Path) -> Result<(ReceiveProcess, ChildStdin)> {
    let mut child = Command::new("btrfs")
        .arg("receive")
        .arg(receive_dir)
        .env("PATH", platform::sbin_path())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| B2sError::Receive(format!("failed to spawn btrfs receive: {e}")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| B2sError::Receive("btrfs receive stdin not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| B2sError::Receive("btrfs receive stderr not captured".into()))?;
    let process = ReceiveProcess {
        child,
        stderr_thread: Some(drain_stderr(stderr)),
    };
    Ok((process, stdin))
}

impl ReceiveProcess {
    /// Wait for the child after its stdin was closed.
    pub fn finish(mut self) -> Result<()> {
        let status = self.child.wait()?;
        let stderr = join_stderr_thread(&mut self.stderr_thread);
        if !status.success() {
            return Err(B2sError::Receive(format!(
                "btrfs receive exited with {status}: {stderr}"
            )));
        }
        Ok(())
    }

    /// Terminate the child on the error path and return its stderr tail.
    pub fn abort(mut self) -> String {
        terminate_child(&mut self.child);
        join_stderr_thread(&mut self.stderr_thread)
    }
}

impl Drop for ReceiveProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            terminate_child(&mut self.child);
        }
        let _ = join_stderr_thread(&mut self.stderr_thread);
    }
}

/// SIGTERM, bounded grace, then SIGKILL. Always reaps the child.
fn terminate_child(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
    let deadline = Instant::now() + TERM_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50));
            }
            _ => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Drain a stderr pipe on a helper thread, keeping the newest bytes.
fn drain_stderr(mut stderr: ChildStderr) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut ring = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    ring.extend_from_slice(&buf[..n]);
                    if ring.len() > STDERR_RING_BYTES {
                        let excess = ring.len() - STDERR_RING_BYTES;
                        ring.drain(..excess);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        ring
    })
}

fn join_stderr_thread(slot: &mut Option<JoinHandle<Vec<u8>>>) -> String {
    match slot.take() {
        Some(handle) => match handle.join() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
            Err(_) => String::new(),
        },
        None => String::new(),
    }
}
