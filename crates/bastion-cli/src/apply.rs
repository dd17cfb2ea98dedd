use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bastion_core::{validated_relative_path, InstallManifest};
use bastion_installer::{
    error_code, ErrorClass, ErrorCode, InstallTransaction, LogLevel, RollbackOutcome,
    TargetLayout, TransactionOptions,
};
use bastion_security::{
    digests_match, hash_file_as, load_and_verify_manifest_with_key, LoadOptions, LoadedManifest,
    TrustedKey,
};
use semver::Version;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ApplyError {
    #[error("source file '{path}' does not match the manifest")]
    SourceMismatch { path: String },
    #[error("installed file '{path}' does not match its manifest digest")]
    DigestMismatch { path: String },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ApplyRequest<'a> {
    pub(crate) manifest: &'a Path,
    pub(crate) source: &'a Path,
    pub(crate) target: &'a Path,
    pub(crate) allow_unsigned: bool,
}

#[derive(Debug)]
pub(crate) struct ApplyReport {
    pub(crate) name: String,
    pub(crate) version: Version,
    pub(crate) verified: bool,
    pub(crate) outcome: ApplyOutcome,
}

#[derive(Debug)]
pub(crate) enum ApplyOutcome {
    Committed {
        files: usize,
    },
    RolledBack {
        failure: FailureSummary,
        rollback: RollbackOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FailureSummary {
    pub(crate) code: ErrorCode,
    pub(crate) class: ErrorClass,
    pub(crate) message: String,
}

pub(crate) fn load_verified_manifest(
    manifest_path: &Path,
    allow_unsigned: bool,
    trusted_key: &TrustedKey,
) -> Result<LoadedManifest> {
    let options = LoadOptions {
        require_signature: !allow_unsigned,
        ..LoadOptions::default()
    };
    tracing::debug!(
        manifest = %manifest_path.display(),
        key_id = %trusted_key.key_id_hex(),
        allow_unsigned,
        "loading manifest"
    );
    load_and_verify_manifest_with_key(manifest_path, &options, trusted_key)
        .with_context(|| format!("failed to load manifest {}", manifest_path.display()))
}

/// Installs every file the manifest lists from `source` into `target`.
///
/// Failures before the transaction opens (signature, parse, source digest
/// check) are returned as errors and leave the target untouched. Failures
/// after that are rolled back and reported through [`ApplyOutcome`].
pub(crate) fn apply_manifest<Progress>(
    request: &ApplyRequest<'_>,
    trusted_key: &TrustedKey,
    mut on_progress: Progress,
) -> Result<ApplyReport>
where
    Progress: FnMut(u64, u64),
{
    let loaded = load_verified_manifest(request.manifest, request.allow_unsigned, trusted_key)?;
    let manifest = InstallManifest::from_loaded(&loaded)?;

    let source_drift = manifest
        .verify_installed(request.source)
        .with_context(|| format!("failed to inspect source {}", request.source.display()))?;
    if let Some(drift) = source_drift.first() {
        return Err(ApplyError::SourceMismatch {
            path: drift.path().to_string(),
        }
        .into());
    }

    fs::create_dir_all(request.target).with_context(|| {
        format!(
            "failed to create target directory {}",
            request.target.display()
        )
    })?;
    let layout = TargetLayout::new(request.target);
    let mut tx = InstallTransaction::open(&layout, TransactionOptions::default());
    tx.log(
        LogLevel::Info,
        &format!(
            "applying {} {} ({} files, signature {})",
            manifest.name,
            manifest.version,
            manifest.files.len(),
            if loaded.verified() { "verified" } else { "absent" }
        ),
    );

    let total = manifest.files.len() as u64;
    on_progress(0, total);
    let mut created = Vec::new();
    let installed = install_files(
        &mut tx,
        &manifest,
        request,
        &mut created,
        |done| on_progress(done, total),
    );

    let outcome = match installed {
        Ok(()) => {
            tx.commit()?;
            ApplyOutcome::Committed {
                files: manifest.files.len(),
            }
        }
        Err(err) => {
            let cause: &(dyn Error + 'static) = err.as_ref();
            let failure = FailureSummary {
                code: failure_code(&err),
                class: tx.classify_error(cause),
                message: format!("{err:#}"),
            };
            tx.log(
                LogLevel::Error,
                &format!(
                    "{} failure [{}]: {}",
                    failure.class.as_str(),
                    failure.code.as_str(),
                    failure.message
                ),
            );
            let rollback = tx.rollback()?;
            remove_created_files(&mut tx, &created);
            ApplyOutcome::RolledBack { failure, rollback }
        }
    };

    Ok(ApplyReport {
        name: manifest.name,
        version: manifest.version,
        verified: loaded.verified(),
        outcome,
    })
}

fn install_files<Progress>(
    tx: &mut InstallTransaction,
    manifest: &InstallManifest,
    request: &ApplyRequest<'_>,
    created: &mut Vec<PathBuf>,
    mut on_progress: Progress,
) -> Result<()>
where
    Progress: FnMut(u64),
{
    for (index, file) in manifest.files.iter().enumerate() {
        let relative = validated_relative_path(&file.path)?;
        let source = request.source.join(&relative);
        let destination = request.target.join(&relative);

        let existed = fs::symlink_metadata(&destination).is_ok();
        tx.backup(&destination)
            .with_context(|| format!("failed to back up {}", destination.display()))?;
        if !existed {
            created.push(destination.clone());
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(&source, &destination).with_context(|| {
            format!(
                "failed to copy {} to {}",
                source.display(),
                destination.display()
            )
        })?;

        let actual = hash_file_as(&destination, file.binary)
            .with_context(|| format!("failed to hash {}", destination.display()))?;
        if !digests_match(&file.digest, &actual) {
            return Err(ApplyError::DigestMismatch {
                path: file.path.clone(),
            }
            .into());
        }

        tx.log(LogLevel::Info, &format!("installed: {}", file.path));
        on_progress(index as u64 + 1);
    }

    let drift = manifest.verify_installed(request.target)?;
    if let Some(drift) = drift.first() {
        return Err(ApplyError::DigestMismatch {
            path: drift.path().to_string(),
        }
        .into());
    }
    Ok(())
}

/// Files the install created have no backup, so rollback leaves them behind.
fn remove_created_files(tx: &mut InstallTransaction, created: &[PathBuf]) {
    for path in created.iter().rev() {
        match fs::remove_file(path) {
            Ok(()) => tx.log(LogLevel::Info, &format!("removed: {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tx.log(
                LogLevel::Warn,
                &format!("failed to remove {}: {err}", path.display()),
            ),
        }
    }
}

pub(crate) fn failure_code(err: &anyhow::Error) -> ErrorCode {
    if err.downcast_ref::<ApplyError>().is_some() {
        return ErrorCode::PackageCorruption;
    }
    let cause: &(dyn Error + 'static) = err.as_ref();
    error_code(cause)
}
