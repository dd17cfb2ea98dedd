use super::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bastion_core::{FileDrift, InstallManifest};
use bastion_installer::{ErrorClass, ErrorCode, RollbackOutcome, TargetLayout};
use bastion_security::{pinned_root_key, signature_path_for, TrustedKey};
use clap::Parser;
use ed25519_dalek::{Signer, SigningKey};
use semver::Version;

use crate::apply::{
    apply_manifest, failure_code, ApplyError, ApplyOutcome, ApplyRequest, FailureSummary,
};
use crate::completion::write_completions_script;
use crate::dispatch::{
    format_check_lines, format_hash_lines, format_verify_lines, hash_report, verify_report,
};
use crate::render::{
    format_failure_lines, format_rollback_lines, render_status_line, OutputStyle,
};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);
const KEY_ID: [u8; 8] = *b"CLIKEY01";

fn test_dir() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "bastion-cli-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

fn trusted_key() -> TrustedKey {
    TrustedKey::new(KEY_ID, signing_key().verifying_key().to_bytes())
}

fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("must create parent dir");
    }
    fs::write(path, contents).expect("must write file");
}

fn sign(path: &Path) {
    let content = fs::read(path).expect("read manifest");
    let mut blob = b"Ed".to_vec();
    blob.extend_from_slice(&KEY_ID);
    blob.extend_from_slice(&signing_key().sign(&content).to_bytes());
    fs::write(
        signature_path_for(path),
        format!("untrusted comment: cli tests\n{}\n", STANDARD.encode(blob)),
    )
    .expect("write signature");
}

/// Writes a manifest describing `files` under `source` into `dir`.
fn write_manifest(dir: &Path, source: &Path, files: &[&str], signed: bool) -> PathBuf {
    let relative: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();
    let manifest = InstallManifest::generate(
        "bastion-demo",
        Version::new(1, 2, 0),
        source,
        &relative,
    )
    .expect("must generate manifest");
    let path = dir.join("bastion-demo.manifest.toml");
    fs::write(&path, manifest.to_toml_string().expect("serialize")).expect("write manifest");
    if signed {
        sign(&path);
    }
    path
}

struct Fixture {
    root: PathBuf,
    source: PathBuf,
    target: PathBuf,
    manifest: PathBuf,
}

fn fixture(files: &[(&str, &[u8])]) -> Fixture {
    let root = test_dir();
    let source = root.join("source");
    let target = root.join("target");
    for (path, contents) in files {
        write_file(&source.join(path), contents);
    }
    fs::create_dir_all(&target).expect("must create target");
    let names: Vec<&str> = files.iter().map(|(path, _)| *path).collect();
    let manifest = write_manifest(&root, &source, &names, true);
    Fixture {
        root,
        source,
        target,
        manifest,
    }
}

impl Fixture {
    fn request(&self) -> ApplyRequest<'_> {
        ApplyRequest {
            manifest: &self.manifest,
            source: &self.source,
            target: &self.target,
            allow_unsigned: false,
        }
    }
}

#[test]
fn cli_parses_apply_flags() {
    let cli = Cli::try_parse_from([
        "bastion",
        "apply",
        "demo.manifest.toml",
        "--source",
        "stage",
        "--target",
        "/srv/app",
        "--allow-unsigned",
    ])
    .expect("must parse");

    match cli.command {
        Commands::Apply {
            manifest,
            source,
            target,
            allow_unsigned,
        } => {
            assert_eq!(manifest, PathBuf::from("demo.manifest.toml"));
            assert_eq!(source, PathBuf::from("stage"));
            assert_eq!(target, PathBuf::from("/srv/app"));
            assert!(allow_unsigned);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_rejects_manifest_command_without_files() {
    let err = Cli::try_parse_from([
        "bastion", "manifest", "stage", "--name", "demo", "--version", "1.0.0",
    ])
    .expect_err("files are required");
    assert_eq!(
        err.kind(),
        clap::error::ErrorKind::MissingRequiredArgument
    );
}

#[test]
fn completion_script_names_binary() {
    let mut output = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut output).expect("must render");
    let script = String::from_utf8(output).expect("utf8");
    assert!(script.contains("bastion"));
    assert!(script.contains("apply"));
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "installed bastion-demo 1.2.0"),
        "installed bastion-demo 1.2.0"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "installed bastion-demo 1.2.0"),
        "[OK] installed bastion-demo 1.2.0"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "rollback incomplete"),
        "[ERR] rollback incomplete"
    );
}

#[test]
fn hash_report_uses_relative_path_under_base() {
    let root = test_dir();
    let file = root.join("config/app.yaml");
    write_file(&file, b"key: value\r\n");

    let relative = hash_report(&file, Some(&root)).expect("must hash");
    assert_eq!(relative.path, "config/app.yaml");
    assert!(!relative.binary);
    assert_eq!(
        relative.digest,
        bastion_security::hash_string("key: value\n")
    );

    let absolute = hash_report(&file, None).expect("must hash");
    assert_eq!(absolute.digest, relative.digest);
    assert_eq!(absolute.size, 12);
    assert_eq!(
        format_hash_lines(&absolute),
        vec![format!("{}  {}", absolute.digest, file.display())]
    );

    let json = serde_json::to_value(&relative).expect("serialize");
    assert_eq!(json["path"], "config/app.yaml");
    assert_eq!(json["binary"], false);

    let _ = fs::remove_dir_all(root);
}

#[test]
fn verify_report_accepts_signed_manifest() {
    let fixture = fixture(&[("a.txt", b"alpha\n")]);

    let report = verify_report(&fixture.manifest, false, &trusted_key());
    assert!(report.signed);
    assert!(report.verified);
    assert!(report.error.is_none());
    assert_eq!(report.key_id.as_deref(), Some(hex_key_id().as_str()));
    assert_eq!(
        format_verify_lines(OutputStyle::Rich, &report),
        vec![format!(
            "[OK] signature verified for {} (key {})",
            fixture.manifest.display(),
            hex_key_id()
        )]
    );

    let _ = fs::remove_dir_all(&fixture.root);
}

fn hex_key_id() -> String {
    KEY_ID.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[test]
fn verify_report_rejects_tampered_manifest() {
    let fixture = fixture(&[("a.txt", b"alpha\n")]);
    let mut content = fs::read_to_string(&fixture.manifest).expect("read");
    content = content.replace("bastion-demo", "bastion-evil");
    fs::write(&fixture.manifest, content).expect("write");

    let report = verify_report(&fixture.manifest, false, &trusted_key());
    assert!(!report.verified);
    let error = report.error.expect("tampering must be reported");
    assert!(error.contains("signature"), "{error}");

    let _ = fs::remove_dir_all(&fixture.root);
}

#[test]
fn verify_report_with_placeholder_root_key_fails_closed() {
    let fixture = fixture(&[("a.txt", b"alpha\n")]);

    let report = verify_report(&fixture.manifest, false, pinned_root_key());
    assert!(!report.verified);
    let error = report.error.expect("placeholder key must be refused");
    assert!(error.contains("placeholder"), "{error}");

    let _ = fs::remove_dir_all(&fixture.root);
}

#[test]
fn unsigned_manifest_requires_explicit_opt_in() {
    let root = test_dir();
    let source = root.join("source");
    write_file(&source.join("a.txt"), b"alpha\n");
    let manifest = write_manifest(&root, &source, &["a.txt"], false);

    let strict = verify_report(&manifest, false, &trusted_key());
    assert!(!strict.signed);
    assert!(strict.error.is_some());

    let relaxed = verify_report(&manifest, true, &trusted_key());
    assert!(relaxed.error.is_none());
    assert!(!relaxed.verified);
    assert_eq!(
        format_verify_lines(OutputStyle::Plain, &relaxed),
        vec![format!(
            "{} is unsigned; accepted without verification",
            manifest.display()
        )]
    );

    let _ = fs::remove_dir_all(root);
}

#[test]
fn apply_installs_files_and_commits() {
    let fixture = fixture(&[
        ("a.txt", b"alpha v2\n"),
        ("config/app.yaml", b"mode: prod\n"),
    ]);
    write_file(&fixture.target.join("a.txt"), b"alpha v1\n");

    let mut progress = Vec::new();
    let report = apply_manifest(&fixture.request(), &trusted_key(), |done, total| {
        progress.push((done, total))
    })
    .expect("apply must run");

    assert!(report.verified);
    assert_eq!(report.name, "bastion-demo");
    assert!(matches!(report.outcome, ApplyOutcome::Committed { files: 2 }));
    assert_eq!(progress.last(), Some(&(2, 2)));
    assert_eq!(
        fs::read_to_string(fixture.target.join("a.txt")).expect("read"),
        "alpha v2\n"
    );
    assert_eq!(
        fs::read_to_string(fixture.target.join("config/app.yaml")).expect("read"),
        "mode: prod\n"
    );

    let layout = TargetLayout::new(&fixture.target);
    let leftover = fs::read_dir(layout.backup_root())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
    let log = fs::read_to_string(layout.log_path()).expect("log written");
    assert!(log.contains("installed: config/app.yaml"));
    assert!(log.contains("backups cleaned up successfully"));

    let loaded = crate::apply::load_verified_manifest(&fixture.manifest, false, &trusted_key())
        .expect("load");
    let manifest = InstallManifest::from_loaded(&loaded).expect("parse");
    let drift = manifest.verify_installed(&fixture.target).expect("check");
    assert!(drift.is_empty());
    assert_eq!(
        format_check_lines(OutputStyle::Plain, &manifest, &drift),
        vec!["bastion-demo 1.2.0: all 2 file(s) match".to_string()]
    );

    let _ = fs::remove_dir_all(&fixture.root);
}

#[test]
fn apply_failure_rolls_back_and_removes_new_files() {
    let fixture = fixture(&[
        ("a.txt", b"alpha v2\n"),
        ("new.txt", b"brand new\n"),
        ("plugins/init.lua", b"return {}\n"),
    ]);
    write_file(&fixture.target.join("a.txt"), b"alpha v1\n");
    // A directory where the manifest expects a file aborts the install.
    fs::create_dir_all(fixture.target.join("plugins/init.lua")).expect("must create dir");

    let report =
        apply_manifest(&fixture.request(), &trusted_key(), |_, _| {}).expect("apply must run");

    let ApplyOutcome::RolledBack { failure, rollback } = report.outcome else {
        panic!("install should have been rolled back");
    };
    assert!(rollback.success);
    assert!(rollback.failed_paths.is_empty());
    assert!(!rollback.backup_dir.exists());
    assert_eq!(failure.class, ErrorClass::Recoverable);
    assert!(failure.message.contains("init.lua"), "{}", failure.message);

    assert_eq!(
        fs::read_to_string(fixture.target.join("a.txt")).expect("read"),
        "alpha v1\n"
    );
    assert!(!fixture.target.join("new.txt").exists());
    assert!(fixture.target.join("plugins/init.lua").is_dir());

    let log = fs::read_to_string(TargetLayout::new(&fixture.target).log_path()).expect("log");
    assert!(log.contains("rollback completed successfully"));
    assert!(log.contains("removed: "));

    let _ = fs::remove_dir_all(&fixture.root);
}

#[test]
fn apply_refuses_source_that_does_not_match_manifest() {
    let fixture = fixture(&[("a.txt", b"alpha v2\n")]);
    write_file(&fixture.source.join("a.txt"), b"tampered\n");
    write_file(&fixture.target.join("a.txt"), b"alpha v1\n");

    let err = apply_manifest(&fixture.request(), &trusted_key(), |_, _| {})
        .expect_err("mismatched source must be refused");
    assert!(err.downcast_ref::<ApplyError>().is_some());
    assert_eq!(failure_code(&err), ErrorCode::PackageCorruption);
    assert_eq!(
        fs::read_to_string(fixture.target.join("a.txt")).expect("read"),
        "alpha v1\n"
    );
    assert!(!TargetLayout::new(&fixture.target).log_path().exists());

    let _ = fs::remove_dir_all(&fixture.root);
}

#[test]
fn apply_with_unverifiable_manifest_touches_nothing() {
    let fixture = fixture(&[("a.txt", b"alpha v2\n")]);
    write_file(&fixture.target.join("a.txt"), b"alpha v1\n");

    let err = apply_manifest(&fixture.request(), pinned_root_key(), |_, _| {})
        .expect_err("placeholder key must block apply");
    assert!(format!("{err:#}").contains("placeholder"));
    assert_eq!(
        fs::read_to_string(fixture.target.join("a.txt")).expect("read"),
        "alpha v1\n"
    );
    assert!(!TargetLayout::new(&fixture.target).log_path().exists());

    let _ = fs::remove_dir_all(&fixture.root);
}

#[test]
fn failure_code_follows_io_cause() {
    let err = Err::<(), _>(io::Error::from(io::ErrorKind::StorageFull))
        .context("failed to copy config/c.yaml")
        .expect_err("must fail");
    assert_eq!(failure_code(&err), ErrorCode::DiskFull);
}

#[test]
fn failure_lines_include_recovery_steps() {
    let failure = FailureSummary {
        code: ErrorCode::DiskFull,
        class: ErrorClass::Critical,
        message: "failed to copy config/c.yaml".to_string(),
    };
    let lines = format_failure_lines(OutputStyle::Rich, &failure);
    assert_eq!(lines[0], "[ERR] Disk Space Exhausted (ENOSPC, CRITICAL)");
    assert!(lines.contains(&"  cause: failed to copy config/c.yaml".to_string()));
    assert!(lines
        .iter()
        .any(|line| line == "    1. Free up disk space (at least 500MB recommended)"));
}

#[test]
fn rollback_lines_name_paths_needing_manual_recovery() {
    let outcome = RollbackOutcome {
        success: false,
        failed_paths: vec![PathBuf::from("/srv/app/a.txt")],
        backup_dir: PathBuf::from("/srv/app/.install-backup/2025-01-23_14-30-45-123Z"),
    };
    assert_eq!(
        format_rollback_lines(OutputStyle::Plain, &outcome),
        vec![
            "rollback incomplete: 1 path(s) need manual recovery".to_string(),
            "  - /srv/app/a.txt".to_string(),
            "  backup directory: /srv/app/.install-backup/2025-01-23_14-30-45-123Z".to_string(),
        ]
    );

    let clean = RollbackOutcome {
        success: true,
        failed_paths: Vec::new(),
        backup_dir: outcome.backup_dir.clone(),
    };
    assert_eq!(
        format_rollback_lines(OutputStyle::Rich, &clean),
        vec!["[OK] rollback restored every backed-up path".to_string()]
    );
}

#[test]
fn check_lines_report_each_drifted_file() {
    let manifest = InstallManifest::generate(
        "bastion-demo",
        Version::new(1, 2, 0),
        Path::new("."),
        &[],
    )
    .expect("empty manifest");
    let drift = vec![
        FileDrift::Missing {
            path: "a.txt".to_string(),
        },
        FileDrift::Modified {
            path: "b.txt".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        },
    ];
    assert_eq!(
        format_check_lines(OutputStyle::Rich, &manifest, &drift),
        vec![
            "[ERR] missing: a.txt".to_string(),
            "[ERR] modified: b.txt (expected aa, found bb)".to_string(),
            "[ERR] bastion-demo 1.2.0: 2 of 0 file(s) drifted".to_string(),
        ]
    );
}
