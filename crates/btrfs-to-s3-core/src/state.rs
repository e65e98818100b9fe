use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Per-subvolume bookkeeping carried between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubvolumeState {
    pub last_snapshot: Option<String>,
    pub last_snapshot_path: Option<String>,
    pub last_manifest: Option<String>,
    pub last_full_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub subvolumes: BTreeMap<String, SubvolumeState>,
    #[serde(default)]
    pub last_run_at: Option<String>,
}

/// Load persisted state; a missing file is an empty state.
pub fn load_state(path: &Path) -> Result<State> {
    if !path.exists() {
        return Ok(State::default());
    }
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Persist state atomically: write a sibling temp file, then rename.
pub fn save_state(path: &Path, state: &State) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = serde_json::to_vec_pretty(state)?;
    body.push(b'\n');
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
