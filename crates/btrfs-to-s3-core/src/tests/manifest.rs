use crate::manifest::{
    backup_prefix, chunk_key, current_key, manifest_key, normalize_prefix, ChunkEntry,
    CurrentPointer, Manifest, ManifestKind, S3Descriptor, SnapshotInfo, MANIFEST_VERSION,
};

fn sample_manifest() -> Manifest {
    Manifest {
        version: MANIFEST_VERSION,
        subvolume: "data".into(),
        kind: ManifestKind::Incremental,
        created_at: "20250608T020000Z".into(),
        snapshot: SnapshotInfo {
            name: "data__20250608T020000Z__inc".into(),
            path: "/snap/data__20250608T020000Z__inc".into(),
            uuid: None,
            parent_uuid: None,
        },
        parent_manifest: Some("backups/subvol/data/full/20250601T020000Z/manifest.json".into()),
        chunks: vec![
            ChunkEntry {
                key: "backups/subvol/data/inc/20250608T020000Z/chunks/part-00000.bin".into(),
                size: 1024,
                sha256: "aa".repeat(32),
                etag: Some("\"etag0\"".into()),
            },
            ChunkEntry {
                key: "backups/subvol/data/inc/20250608T020000Z/chunks/part-00001.bin".into(),
                size: 512,
                sha256: "bb".repeat(32),
                etag: None,
            },
        ],
        total_bytes: 1536,
        chunk_size: 10 * 1024 * 1024,
        s3: S3Descriptor {
            bucket: "backup-bucket".into(),
            region: "eu-central-1".into(),
            storage_class: "DEEP_ARCHIVE".into(),
        },
    }
}

#[test]
fn prefix_normalization() {
    assert_eq!(normalize_prefix(""), "");
    assert_eq!(normalize_prefix("backups"), "backups/");
    assert_eq!(normalize_prefix("backups/"), "backups/");
    assert_eq!(normalize_prefix("backups///"), "backups/");
    assert_eq!(normalize_prefix("a/b"), "a/b/");
}

#[test]
fn object_layout_is_bit_exact() {
    let prefix = normalize_prefix("backups");
    assert_eq!(
        current_key(&prefix, "data"),
        "backups/subvol/data/current.json"
    );
    assert_eq!(
        backup_prefix(&prefix, "data", ManifestKind::Full, "20250601T020000Z"),
        "backups/subvol/data/full/20250601T020000Z/"
    );
    assert_eq!(
        manifest_key(&prefix, "data", ManifestKind::Full, "20250601T020000Z"),
        "backups/subvol/data/full/20250601T020000Z/manifest.json"
    );
    assert_eq!(
        manifest_key(&prefix, "data", ManifestKind::Incremental, "20250608T020000Z"),
        "backups/subvol/data/inc/20250608T020000Z/manifest.json"
    );
    assert_eq!(
        chunk_key(&prefix, "data", ManifestKind::Full, "20250601T020000Z", 0),
        "backups/subvol/data/full/20250601T020000Z/chunks/part-00000.bin"
    );
    assert_eq!(
        chunk_key(&prefix, "data", ManifestKind::Full, "20250601T020000Z", 12345),
        "backups/subvol/data/full/20250601T020000Z/chunks/part-12345.bin"
    );
}

#[test]
fn empty_prefix_produces_rootless_keys() {
    let prefix = normalize_prefix("");
    assert_eq!(current_key(&prefix, "data"), "subvol/data/current.json");
}

#[test]
fn manifest_json_round_trip_preserves_wire_fields() {
    let manifest = sample_manifest();
    let bytes = manifest.to_json_bytes().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(value["version"], 1);
    assert_eq!(value["kind"], "incremental");
    assert_eq!(value["subvolume"], "data");
    assert_eq!(value["snapshot"]["name"], "data__20250608T020000Z__inc");
    assert_eq!(value["snapshot"]["uuid"], serde_json::Value::Null);
    assert_eq!(value["chunks"][1]["etag"], serde_json::Value::Null);
    assert_eq!(value["total_bytes"], 1536);
    assert_eq!(value["s3"]["storage_class"], "DEEP_ARCHIVE");

    let parsed = Manifest::from_json_bytes(&bytes, "k").unwrap();
    assert_eq!(parsed, manifest);
}

#[test]
fn full_manifest_serializes_null_parent() {
    let mut manifest = sample_manifest();
    manifest.kind = ManifestKind::Full;
    manifest.parent_manifest = None;
    let value: serde_json::Value =
        serde_json::from_slice(&manifest.to_json_bytes().unwrap()).unwrap();
    assert_eq!(value["kind"], "full");
    assert_eq!(value["parent_manifest"], serde_json::Value::Null);
}

#[test]
fn manifest_without_chunks_is_rejected() {
    let mut manifest = sample_manifest();
    manifest.chunks.clear();
    manifest.total_bytes = 0;
    let bytes = manifest.to_json_bytes().unwrap();
    let err = Manifest::from_json_bytes(&bytes, "k").unwrap_err();
    assert!(err.to_string().contains("no chunks"), "{err}");
}

#[test]
fn manifest_with_inconsistent_totals_is_rejected() {
    let mut manifest = sample_manifest();
    manifest.total_bytes = 9999;
    let bytes = manifest.to_json_bytes().unwrap();
    let err = Manifest::from_json_bytes(&bytes, "k").unwrap_err();
    assert!(err.to_string().contains("total_bytes"), "{err}");
}

#[test]
fn invalid_manifest_json_names_the_key() {
    let err = Manifest::from_json_bytes(b"{not json", "some/key").unwrap_err();
    assert!(err.to_string().contains("some/key"), "{err}");
}

#[test]
fn pointer_round_trip() {
    let pointer = CurrentPointer {
        manifest_key: "backups/subvol/data/full/20250601T020000Z/manifest.json".into(),
        kind: ManifestKind::Full,
        created_at: "20250601T020000Z".into(),
    };
    let bytes = pointer.to_json_bytes().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(
        value["manifest_key"],
        "backups/subvol/data/full/20250601T020000Z/manifest.json"
    );
    assert_eq!(value["kind"], "full");

    let parsed = CurrentPointer::from_json_bytes(&bytes, "k").unwrap();
    assert_eq!(parsed, pointer);
}
