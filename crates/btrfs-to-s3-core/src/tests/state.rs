use crate::state::{load_state, save_state, State, SubvolumeState};

#[test]
fn missing_file_loads_empty_state() {
    let dir = tempfile::tempdir().unwrap();
    let state = load_state(&dir.path().join("state.json")).unwrap();
    assert_eq!(state, State::default());
}

#[test]
fn save_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut state = State::default();
    state.subvolumes.insert(
        "data".into(),
        SubvolumeState {
            last_snapshot: Some("data__20250601T020000Z__full".into()),
            last_snapshot_path: Some("/snap/data__20250601T020000Z__full".into()),
            last_manifest: Some("p/subvol/data/full/20250601T020000Z/manifest.json".into()),
            last_full_at: Some("20250601T020000Z".into()),
        },
    );
    state.last_run_at = Some("20250601T020000Z".into());

    save_state(&path, &state).unwrap();
    let loaded = load_state(&path).unwrap();
    assert_eq!(loaded, state);
}

#[test]
fn save_creates_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a/b/state.json");
    save_state(&path, &State::default()).unwrap();
    assert!(path.exists());
}

#[test]
fn save_leaves_no_temp_file_behind() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    save_state(&path, &State::default()).unwrap();
    save_state(&path, &State::default()).unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["state.json".to_string()]);
}

#[test]
fn unknown_fields_are_ignored_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(
        &path,
        r#"{"subvolumes": {}, "last_run_at": null, "future_field": 1}"#,
    )
    .unwrap();
    let state = load_state(&path).unwrap();
    assert_eq!(state, State::default());
}
