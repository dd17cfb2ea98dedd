use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bastion_security::{
    hash_bytes, hash_string, load_and_verify_manifest, load_and_verify_manifest_with_key, signature_path_for,
    LoadOptions, TrustedKey,
};
use ed25519_dalek::{Signer, SigningKey};
use semver::Version;

use super::*;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);
const KEY_ID: [u8; 8] = *b"COREKEY1";

fn test_dir() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "bastion-core-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[3u8; 32])
}

fn trusted_key() -> TrustedKey {
    TrustedKey::new(KEY_ID, signing_key().verifying_key().to_bytes())
}

fn write_signed_manifest(path: &Path, content: &str) {
    fs::write(path, content).expect("write manifest");
    let mut blob = b"Ed".to_vec();
    blob.extend_from_slice(&KEY_ID);
    blob.extend_from_slice(&signing_key().sign(content.as_bytes()).to_bytes());
    fs::write(
        signature_path_for(path),
        format!("untrusted comment: core tests\n{}\n", STANDARD.encode(blob)),
    )
    .expect("write signature");
}

fn sample_digest() -> String {
    hash_string("hello\n")
}

#[test]
fn parse_manifest() {
    let content = format!(
        r#"
name = "bastion-demo"
version = "1.4.0"

[[files]]
path = "a.txt"
digest = "{digest}"
size = 6

[[files]]
path = "assets/logo.png"
digest = "{digest}"
size = 6
binary = true
"#,
        digest = sample_digest()
    );

    let parsed = InstallManifest::from_toml_str(&content).expect("manifest should parse");
    assert_eq!(parsed.name, "bastion-demo");
    assert_eq!(parsed.version, Version::new(1, 4, 0));
    assert_eq!(parsed.files.len(), 2);
    assert!(!parsed.files[0].binary);
    assert!(parsed.files[1].binary);
}

#[test]
fn parse_rejects_traversal_and_duplicates() {
    let digest = sample_digest();
    let traversal = format!(
        "name = \"x\"\nversion = \"1.0.0\"\n[[files]]\npath = \"../etc/passwd\"\ndigest = \"{digest}\"\nsize = 1\n"
    );
    let err = InstallManifest::from_toml_str(&traversal).expect_err("traversal must fail");
    assert!(format!("{err:#}").contains("'..'"));

    let duplicate = format!(
        "name = \"x\"\nversion = \"1.0.0\"\n[[files]]\npath = \"a\"\ndigest = \"{digest}\"\nsize = 1\n[[files]]\npath = \"a\"\ndigest = \"{digest}\"\nsize = 1\n"
    );
    let err = InstallManifest::from_toml_str(&duplicate).expect_err("duplicate must fail");
    assert!(err.to_string().contains("duplicate manifest file entry 'a'"));
}

#[test]
fn parse_rejects_malformed_digest() {
    let content = "name = \"x\"\nversion = \"1.0.0\"\n[[files]]\npath = \"a\"\ndigest = \"abc\"\nsize = 1\n";
    let err = InstallManifest::from_toml_str(content).expect_err("short digest must fail");
    assert!(err.to_string().contains("malformed digest"));
}

#[test]
fn validated_relative_path_rejects_non_normal_components() {
    assert_eq!(
        validated_relative_path("config/c.yaml").expect("valid"),
        PathBuf::from("config").join("c.yaml")
    );
    for bad in ["", "/abs", "a//b", "./a", "a/../b", "a\\b"] {
        assert!(validated_relative_path(bad).is_err(), "{bad:?} must fail");
    }
}

#[test]
fn generate_then_verify_installed_reports_drift() {
    let dir = test_dir();
    fs::create_dir_all(dir.join("config")).expect("mkdir config");
    fs::write(dir.join("a.txt"), "alpha\r\n").expect("write a");
    fs::write(dir.join("config").join("c.yaml"), "k: v\n").expect("write c");

    let manifest = InstallManifest::generate(
        "demo",
        Version::new(0, 1, 0),
        &dir,
        &[PathBuf::from("a.txt"), dir.join("config").join("c.yaml")],
    )
    .expect("generate");
    assert_eq!(manifest.files[0].path, "a.txt");
    assert_eq!(manifest.files[1].path, "config/c.yaml");
    assert!(manifest.verify_installed(&dir).expect("verify").is_empty());

    fs::write(dir.join("a.txt"), "changed\n").expect("modify a");
    fs::remove_file(dir.join("config").join("c.yaml")).expect("remove c");

    let drift = manifest.verify_installed(&dir).expect("verify");
    assert_eq!(drift.len(), 2);
    assert!(matches!(&drift[0], FileDrift::Modified { path, .. } if path == "a.txt"));
    assert_eq!(
        drift[1],
        FileDrift::Missing {
            path: "config/c.yaml".to_string()
        }
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn verify_installed_hashes_with_the_recorded_mode() {
    let dir = test_dir();
    let raw = b"one\r\ntwo\r\n";
    fs::write(dir.join("notes.txt"), raw).expect("write notes");
    let manifest_with = |binary: bool| {
        InstallManifest::from_toml_str(&format!(
            "name = \"demo\"\nversion = \"1.0.0\"\n[[files]]\npath = \"notes.txt\"\ndigest = \"{}\"\nsize = {}\nbinary = {binary}\n",
            hash_bytes(raw, true),
            raw.len()
        ))
        .expect("manifest should parse")
    };

    assert!(manifest_with(true)
        .verify_installed(&dir)
        .expect("verify")
        .is_empty());

    let drift = manifest_with(false).verify_installed(&dir).expect("verify");
    assert!(matches!(
        &drift[..],
        [FileDrift::Modified { actual, .. }] if *actual == hash_bytes(raw, false)
    ));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn manifest_round_trips_through_signed_load() {
    let dir = test_dir();
    fs::write(dir.join("a.txt"), "alpha\n").expect("write a");
    let manifest =
        InstallManifest::generate("demo", Version::new(2, 0, 0), &dir, &[PathBuf::from("a.txt")])
            .expect("generate");
    let manifest_path = dir.join("install-manifest.toml");
    write_signed_manifest(&manifest_path, &manifest.to_toml_string().expect("serialize"));

    let loaded =
        load_and_verify_manifest_with_key(&manifest_path, &LoadOptions::default(), &trusted_key())
            .expect("load");
    let parsed = InstallManifest::from_loaded(&loaded).expect("parse verified");
    assert_eq!(parsed, manifest);
    assert_eq!(
        parsed.content_digest().expect("digest"),
        manifest.content_digest().expect("digest")
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn unsigned_manifest_parses_only_when_allowed() {
    let dir = test_dir();
    let manifest_path = dir.join("install-manifest.toml");
    fs::write(&manifest_path, "name = \"dev\"\nversion = \"0.0.1\"\n").expect("write manifest");

    assert!(load_and_verify_manifest(&manifest_path, &LoadOptions::default()).is_err());

    let loaded = load_and_verify_manifest(
        &manifest_path,
        &LoadOptions {
            require_signature: false,
            ..LoadOptions::default()
        },
    )
    .expect("unsigned load");
    let parsed = InstallManifest::from_loaded(&loaded).expect("parse");
    assert_eq!(parsed.name, "dev");
    assert!(parsed.files.is_empty());

    let _ = fs::remove_dir_all(&dir);
}
