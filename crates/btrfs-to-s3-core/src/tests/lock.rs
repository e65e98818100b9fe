use crate::error::B2sError;
use crate::lock::LockFile;

#[test]
fn acquire_writes_pid_and_release_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("b2s.lock");

    let mut lock = LockFile::new(path.clone());
    lock.acquire().unwrap();
    assert!(lock.is_held());
    let recorded = std::fs::read_to_string(&path).unwrap();
    assert_eq!(recorded, std::process::id().to_string());

    lock.release();
    assert!(!path.exists());
    assert!(!lock.is_held());
}

#[test]
fn contention_with_live_owner_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("b2s.lock");

    let mut first = LockFile::new(path.clone());
    first.acquire().unwrap();

    let mut second = LockFile::new(path.clone());
    let err = second.acquire().unwrap_err();
    match err {
        B2sError::LockHeld(pid) => assert_eq!(pid, std::process::id().to_string()),
        other => panic!("expected LockHeld, got {other:?}"),
    }
    // The loser must not have released the winner's lock.
    assert!(path.exists());
    first.release();
}

#[test]
fn stale_lock_with_dead_pid_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("b2s.lock");
    // Beyond the default kernel pid ceiling, so signal 0 reports ESRCH.
    std::fs::write(&path, "999999999").unwrap();

    let mut lock = LockFile::new(path.clone());
    lock.acquire().unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        std::process::id().to_string()
    );
    lock.release();
}

#[test]
fn garbage_pid_text_is_treated_as_stale() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("b2s.lock");
    std::fs::write(&path, "not-a-pid").unwrap();

    let mut lock = LockFile::new(path.clone());
    lock.acquire().unwrap();
    lock.release();
}

#[test]
fn drop_releases_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("b2s.lock");
    {
        let mut lock = LockFile::new(path.clone());
        lock.acquire().unwrap();
        assert!(path.exists());
    }
    assert!(!path.exists());
}

#[test]
fn lock_parent_directory_is_created_on_demand() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/dir/b2s.lock");
    let mut lock = LockFile::new(path.clone());
    lock.acquire().unwrap();
    assert!(path.exists());
    lock.release();
}
