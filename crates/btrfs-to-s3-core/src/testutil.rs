use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::sync::Mutex;

use crate::error::Result;
use crate::platform::CommandRunner;

pub fn ok_output(stdout: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(0),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

pub fn failed_output(stderr: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(0x100),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Fake btrfs tooling: snapshots become plain directories, deletes remove
/// them, `subvolume show` reports a canned UUID.
pub struct FakeBtrfsRunner {
    pub calls: Mutex<Vec<Vec<String>>>,
    pub show_uuid: Option<String>,
    pub fail_snapshot: bool,
}

impl FakeBtrfsRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            show_uuid: Some("12345678-9abc-def0-1234-56789abcdef0".into()),
            fail_snapshot: false,
        }
    }

    pub fn recorded_calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for FakeBtrfsRunner {
    fn run(&self, args: &[&str]) -> Result<Output> {
        self.calls
            .lock()
            .unwrap()
            .push(args.iter().map(|s| s.to_string()).collect());
        match args {
            ["btrfs", "subvolume", "snapshot", "-r", _src, dst] => {
                if self.fail_snapshot {
                    return Ok(failed_output("ERROR: cannot snapshot"));
                }
                std::fs::create_dir_all(dst)?;
                Ok(ok_output(""))
            }
            ["btrfs", "subvolume", "delete", path] => {
                std::fs::remove_dir_all(path)?;
                Ok(ok_output(""))
            }
            ["btrfs", "subvolume", "show", _path] => match &self.show_uuid {
                Some(uuid) => Ok(ok_output(&format!(
                    "data\n\tName: \t\tdata\n\tUUID: \t\t{uuid}\n\tFlags: \t\treadonly\n"
                ))),
                None => Ok(failed_output("ERROR: not a subvolume")),
            },
            ["btrfs", "property", "set", ..] => Ok(ok_output("")),
            _ => Ok(failed_output("unexpected command")),
        }
    }
}
