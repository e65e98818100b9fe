use crate::config::Config;
use crate::error::B2sError;

const MINIMAL: &str = r#"
[subvolumes]
paths = ["/srv/data"]

[s3]
bucket = "backup-bucket"
region = "eu-central-1"
prefix = "backups"
"#;

fn parse(extra: &str) -> Result<Config, B2sError> {
    Config::from_toml_str(&format!("{MINIMAL}\n{extra}"))
}

#[test]
fn minimal_config_gets_documented_defaults() {
    let config = parse("").unwrap();
    assert_eq!(config.global.log_level, "info");
    assert_eq!(config.schedule.full_every_days, 180);
    assert_eq!(config.schedule.incremental_every_days, 7);
    assert_eq!(config.schedule.run_at, "02:00");
    assert_eq!(config.snapshots.retain, 2);
    assert_eq!(config.s3.chunk_size_bytes, 200 * 1024 * 1024 * 1024);
    assert_eq!(config.s3.part_size_bytes, 128 * 1024 * 1024);
    assert_eq!(config.s3.storage_class_chunks, "DEEP_ARCHIVE");
    assert_eq!(config.s3.storage_class_manifest, "STANDARD");
    assert_eq!(config.s3.concurrency, 4);
    assert_eq!(config.s3.sse, "AES256");
    assert!(!config.s3.spool_enabled);
    assert_eq!(config.restore.verify_mode, "full");
    assert!(config.restore.wait_for_restore);
    assert_eq!(config.restore.restore_timeout_seconds, 72 * 60 * 60);
}

#[test]
fn missing_bucket_is_rejected() {
    let err = Config::from_toml_str(
        r#"
[subvolumes]
paths = ["/srv/data"]

[s3]
bucket = ""
region = "eu-central-1"
prefix = "backups"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("s3.bucket"), "{err}");
}

#[test]
fn relative_subvolume_path_is_rejected() {
    let err = Config::from_toml_str(
        r#"
[subvolumes]
paths = ["srv/data"]

[s3]
bucket = "b"
region = "r"
prefix = "p"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("subvolumes.paths"), "{err}");
}

#[test]
fn zero_day_cadence_is_rejected() {
    let err = parse("[schedule]\nfull_every_days = 0\n").unwrap_err();
    assert!(err.to_string().contains("full_every_days"), "{err}");
}

#[test]
fn malformed_run_at_is_rejected() {
    for bad in ["2am", "25:00", "02:60", "0200", "02:0x"] {
        let err = parse(&format!("[schedule]\nrun_at = \"{bad}\"\n")).unwrap_err();
        assert!(err.to_string().contains("run_at"), "{bad}: {err}");
    }
}

#[test]
fn valid_run_at_values_pass() {
    for good in ["00:00", "23:59", "02:00"] {
        parse(&format!("[schedule]\nrun_at = \"{good}\"\n")).unwrap();
    }
}

#[test]
fn zero_concurrency_is_rejected() {
    let mut config = parse("").unwrap();
    config.s3.concurrency = 0;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("concurrency"), "{err}");
}

#[test]
fn spool_needs_a_minimum_budget() {
    let mut config = parse("[global]\nspool_size_bytes = 1024\n").unwrap();
    config.s3.spool_enabled = true;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("spool_size_bytes"), "{err}");
}

#[test]
fn bad_verify_mode_is_rejected() {
    let err = parse("[restore]\nverify_mode = \"paranoid\"\n").unwrap_err();
    assert!(err.to_string().contains("verify_mode"), "{err}");
}

#[test]
fn bad_log_level_is_rejected() {
    let err = parse("[global]\nlog_level = \"chatty\"\n").unwrap_err();
    assert!(err.to_string().contains("log_level"), "{err}");
}

#[test]
fn tilde_paths_are_expanded_when_home_is_set() {
    if std::env::var("HOME").is_err() {
        return;
    }
    let config = parse("[global]\nstate_path = \"~/.local/state/b2s/state.json\"\n").unwrap();
    assert!(config.global.state_path.is_absolute());
    assert!(!config
        .global
        .state_path
        .to_string_lossy()
        .starts_with('~'));
}

#[test]
fn invalid_toml_is_a_config_error() {
    let err = Config::from_toml_str("not toml [").unwrap_err();
    assert!(matches!(err, B2sError::Config(_)), "{err:?}");
    assert_eq!(err.exit_code(), 2);
}
