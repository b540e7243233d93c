#[path = "../src/backup.rs"]
mod backup;

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

#[test]
fn export_and_import_roundtrip_preserves_database_bytes() {
    let workspace = temp_dir("resultsd-bundle-src");
    let workspace2 = temp_dir("resultsd-bundle-dst");
    let out_dir = temp_dir("resultsd-bundle-out");

    let db_src = workspace.join("results.sqlite3");
    let bytes = b"sqlite-test-payload";
    std::fs::write(&db_src, bytes).expect("write source db");

    let bundle_path = out_dir.join("workspace.rsdbackup.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 3);

    let expected_sha = {
        let digest = Sha256::digest(bytes);
        digest.iter().map(|b| format!("{:02x}", b)).collect::<String>()
    };
    assert_eq!(export.db_sha256, expected_sha);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    assert!(manifest.contains(backup::BUNDLE_FORMAT_V1));
    assert!(manifest.contains(&expected_sha));
    archive
        .by_name("db/results.sqlite3")
        .expect("database entry in bundle");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);
    assert_eq!(import.db_sha256, expected_sha);

    let restored = std::fs::read(workspace2.join("results.sqlite3")).expect("read restored db");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

fn write_bundle(path: &PathBuf, manifest: &str, db_bytes: &[u8]) {
    let f = File::create(path).expect("create bundle");
    let mut zip = zip::ZipWriter::new(f);
    let opts =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    zip.start_file("manifest.json", opts).expect("start manifest");
    zip.write_all(manifest.as_bytes()).expect("write manifest");
    zip.start_file("db/results.sqlite3", opts).expect("start db");
    zip.write_all(db_bytes).expect("write db");
    zip.finish().expect("finish zip");
}

#[test]
fn checksum_mismatch_refuses_import() {
    let workspace = temp_dir("resultsd-bundle-tampered");
    let out_dir = temp_dir("resultsd-bundle-tampered-out");

    let bundle_path = out_dir.join("tampered.rsdbackup.zip");
    let manifest = format!(
        "{{\"format\":\"{}\",\"version\":1,\"dbSha256\":\"{}\"}}",
        backup::BUNDLE_FORMAT_V1,
        "0".repeat(64)
    );
    write_bundle(&bundle_path, &manifest, b"not-the-hashed-bytes");

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("tampered bundle must be refused");
    assert!(
        err.to_string().contains("checksum"),
        "unexpected error: {}",
        err
    );
    assert!(!workspace.join("results.sqlite3").exists());

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn unknown_format_tag_refuses_import() {
    let workspace = temp_dir("resultsd-bundle-format");
    let out_dir = temp_dir("resultsd-bundle-format-out");

    let bundle_path = out_dir.join("foreign.zip");
    write_bundle(
        &bundle_path,
        "{\"format\":\"someone-elses-backup\",\"version\":9}",
        b"whatever",
    );

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("foreign bundle must be refused");
    assert!(
        err.to_string().contains("unsupported bundle format"),
        "unexpected error: {}",
        err
    );

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}
