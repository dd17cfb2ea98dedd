use std::fs;
use std::io;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use bastion_core::InstallManifest;
use bastion_security::{file_metadata, hash_file, is_binary_path, TrustedKey};
use semver::Version;
use serde::Serialize;

use crate::apply::{apply_manifest, load_verified_manifest, ApplyOutcome, ApplyReport, ApplyRequest};
use crate::completion::write_completions_script;
use crate::render::{
    format_drift_lines, format_failure_lines, format_rollback_lines, render_status_line,
    OutputStyle, TerminalRenderer,
};
use crate::{Cli, Commands};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct HashReport {
    pub(crate) path: String,
    pub(crate) digest: String,
    pub(crate) size: u64,
    pub(crate) binary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct VerifyReport {
    pub(crate) manifest: String,
    pub(crate) signed: bool,
    pub(crate) verified: bool,
    pub(crate) key_id: Option<String>,
    pub(crate) error: Option<String>,
}

pub(crate) fn run_cli(cli: Cli, trusted_key: &TrustedKey) -> Result<ExitCode> {
    let renderer = TerminalRenderer::current();

    match cli.command {
        Commands::Hash { file, base, json } => {
            let report = hash_report(&file, base.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                renderer.print_lines(&format_hash_lines(&report));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify {
            manifest,
            allow_unsigned,
            json,
        } => {
            let report = verify_report(&manifest, allow_unsigned, trusted_key);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                renderer.print_lines(&format_verify_lines(renderer.style(), &report));
            }
            Ok(exit_code(report.error.is_none()))
        }
        Commands::Manifest {
            base,
            files,
            name,
            version,
        } => {
            let version = Version::parse(&version)
                .with_context(|| format!("invalid manifest version '{version}'"))?;
            let manifest = InstallManifest::generate(&name, version, &base, &files)?;
            print!("{}", manifest.to_toml_string()?);
            eprintln!(
                "{}",
                render_status_line(
                    renderer.style(),
                    "ok",
                    &format!("content digest: {}", manifest.content_digest()?),
                )
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check {
            manifest,
            target,
            allow_unsigned,
        } => {
            let loaded = load_verified_manifest(&manifest, allow_unsigned, trusted_key)?;
            let manifest = InstallManifest::from_loaded(&loaded)?;
            let drift = manifest.verify_installed(&target)?;
            renderer.print_lines(&format_check_lines(renderer.style(), &manifest, &drift));
            Ok(exit_code(drift.is_empty()))
        }
        Commands::Apply {
            manifest,
            source,
            target,
            allow_unsigned,
        } => {
            let request = ApplyRequest {
                manifest: &manifest,
                source: &source,
                target: &target,
                allow_unsigned,
            };
            run_apply(renderer, &request, trusted_key)
        }
        Commands::Completions { shell } => {
            let mut stdout = io::stdout().lock();
            write_completions_script(shell, &mut stdout)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_apply(
    renderer: TerminalRenderer,
    request: &ApplyRequest<'_>,
    trusted_key: &TrustedKey,
) -> Result<ExitCode> {
    renderer.print_section("apply");
    let mut progress = renderer.start_progress("apply", 0);
    let report = match apply_manifest(request, trusted_key, |done, total| {
        progress.set(done, total)
    }) {
        Ok(report) => report,
        Err(err) => {
            progress.finish_abandon();
            return Err(err);
        }
    };

    match &report.outcome {
        ApplyOutcome::Committed { .. } => progress.finish_success(),
        ApplyOutcome::RolledBack { .. } => progress.finish_abandon(),
    }

    let (stdout_lines, stderr_lines) = format_apply_lines(renderer.style(), request, &report);
    renderer.print_lines(&stdout_lines);
    renderer.eprint_lines(&stderr_lines);
    Ok(exit_code(matches!(
        report.outcome,
        ApplyOutcome::Committed { .. }
    )))
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

pub(crate) fn hash_report(file: &Path, base: Option<&Path>) -> Result<HashReport> {
    if let Some(base) = base {
        let metadata = file_metadata(file, base)
            .with_context(|| format!("failed to hash {}", file.display()))?;
        return Ok(HashReport {
            path: metadata.relative_path,
            digest: metadata.digest,
            size: metadata.size,
            binary: metadata.is_binary,
        });
    }

    let digest = hash_file(file).with_context(|| format!("failed to hash {}", file.display()))?;
    let size = fs::metadata(file)
        .with_context(|| format!("failed to stat {}", file.display()))?
        .len();
    Ok(HashReport {
        path: file.display().to_string(),
        digest,
        size,
        binary: is_binary_path(file),
    })
}

pub(crate) fn format_hash_lines(report: &HashReport) -> Vec<String> {
    vec![format!("{}  {}", report.digest, report.path)]
}

pub(crate) fn verify_report(
    manifest: &Path,
    allow_unsigned: bool,
    trusted_key: &TrustedKey,
) -> VerifyReport {
    let signed = bastion_security::signature_exists(manifest);
    match load_verified_manifest(manifest, allow_unsigned, trusted_key) {
        Ok(loaded) => VerifyReport {
            manifest: manifest.display().to_string(),
            signed,
            verified: loaded.verified(),
            key_id: loaded.key_id().map(str::to_string),
            error: None,
        },
        Err(err) => VerifyReport {
            manifest: manifest.display().to_string(),
            signed,
            verified: false,
            key_id: None,
            error: Some(format!("{err:#}")),
        },
    }
}

pub(crate) fn format_verify_lines(style: OutputStyle, report: &VerifyReport) -> Vec<String> {
    let line = match (&report.error, report.verified) {
        (Some(error), _) => render_status_line(style, "err", &format!("verification failed: {error}")),
        (None, true) => render_status_line(
            style,
            "ok",
            &format!(
                "signature verified for {} (key {})",
                report.manifest,
                report.key_id.as_deref().unwrap_or("unknown")
            ),
        ),
        (None, false) => render_status_line(
            style,
            "warn",
            &format!("{} is unsigned; accepted without verification", report.manifest),
        ),
    };
    vec![line]
}

pub(crate) fn format_check_lines(
    style: OutputStyle,
    manifest: &InstallManifest,
    drift: &[bastion_core::FileDrift],
) -> Vec<String> {
    if drift.is_empty() {
        return vec![render_status_line(
            style,
            "ok",
            &format!(
                "{} {}: all {} file(s) match",
                manifest.name,
                manifest.version,
                manifest.files.len()
            ),
        )];
    }

    let mut lines = format_drift_lines(style, drift);
    lines.push(render_status_line(
        style,
        "err",
        &format!(
            "{} {}: {} of {} file(s) drifted",
            manifest.name,
            manifest.version,
            drift.len(),
            manifest.files.len()
        ),
    ));
    lines
}

/// Splits the apply report into stdout and stderr lines.
pub(crate) fn format_apply_lines(
    style: OutputStyle,
    request: &ApplyRequest<'_>,
    report: &ApplyReport,
) -> (Vec<String>, Vec<String>) {
    let signature = if report.verified {
        "verified"
    } else {
        "unsigned"
    };
    match &report.outcome {
        ApplyOutcome::Committed { files } => (
            vec![render_status_line(
                style,
                "ok",
                &format!(
                    "installed {} {} ({files} file(s), {signature}) into {}",
                    report.name,
                    report.version,
                    request.target.display()
                ),
            )],
            Vec::new(),
        ),
        ApplyOutcome::RolledBack { failure, rollback } => {
            let mut lines = format_failure_lines(style, failure);
            lines.extend(format_rollback_lines(style, rollback));
            (Vec::new(), lines)
        }
    }
}
