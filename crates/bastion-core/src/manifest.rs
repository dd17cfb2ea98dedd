use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context};
use bastion_security::{digests_match, file_metadata, hash_file_as, hash_string, LoadedManifest};
use semver::Version;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallManifest {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFile {
    pub path: String,
    pub digest: String,
    pub size: u64,
    /// Hashed as raw bytes when set, otherwise with line endings normalised.
    #[serde(default)]
    pub binary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDrift {
    Missing {
        path: String,
    },
    Modified {
        path: String,
        expected: String,
        actual: String,
    },
}

impl FileDrift {
    pub fn path(&self) -> &str {
        match self {
            Self::Missing { path } | Self::Modified { path, .. } => path,
        }
    }
}

impl InstallManifest {
    /// Parses a manifest that went through the signature gate. There is no
    /// public way to parse raw bytes.
    pub fn from_loaded(loaded: &LoadedManifest) -> anyhow::Result<Self> {
        let input =
            std::str::from_utf8(loaded.bytes()).context("install manifest is not valid UTF-8")?;
        Self::from_toml_str(input)
    }

    pub(crate) fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse install manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn generate(
        name: &str,
        version: Version,
        base: &Path,
        files: &[PathBuf],
    ) -> anyhow::Result<Self> {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let absolute = if file.is_absolute() {
                file.clone()
            } else {
                base.join(file)
            };
            let metadata = file_metadata(&absolute, base)
                .with_context(|| format!("failed to describe {}", absolute.display()))?;
            entries.push(ManifestFile {
                path: metadata.relative_path,
                digest: metadata.digest,
                size: metadata.size,
                binary: metadata.is_binary,
            });
        }

        let manifest = Self {
            name: name.to_string(),
            version,
            files: entries,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to serialize install manifest")
    }

    pub fn content_digest(&self) -> anyhow::Result<String> {
        Ok(hash_string(&self.to_toml_string()?))
    }

    /// Compares every listed file under `target` with its recorded digest.
    pub fn verify_installed(&self, target: &Path) -> anyhow::Result<Vec<FileDrift>> {
        let mut drift = Vec::new();
        for file in &self.files {
            let path = target.join(validated_relative_path(&file.path)?);
            if !path.is_file() {
                drift.push(FileDrift::Missing {
                    path: file.path.clone(),
                });
                continue;
            }

            let actual = hash_file_as(&path, file.binary)
                .with_context(|| format!("failed to hash installed file {}", path.display()))?;
            if !digests_match(&file.digest, &actual) {
                drift.push(FileDrift::Modified {
                    path: file.path.clone(),
                    expected: file.digest.clone(),
                    actual,
                });
            }
        }
        Ok(drift)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("install manifest name must not be empty"));
        }

        let mut seen = HashSet::new();
        for file in &self.files {
            validated_relative_path(&file.path)
                .with_context(|| format!("invalid manifest file path '{}'", file.path))?;
            if !seen.insert(file.path.as_str()) {
                return Err(anyhow!("duplicate manifest file entry '{}'", file.path));
            }
            if file.digest.len() != 64 || !file.digest.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(anyhow!(
                    "manifest file '{}' has malformed digest '{}'",
                    file.path,
                    file.digest
                ));
            }
        }
        Ok(())
    }
}

pub fn validated_relative_path(path: &str) -> anyhow::Result<PathBuf> {
    if path.is_empty() {
        return Err(anyhow!("path must not be empty"));
    }
    if path.contains('\\') {
        return Err(anyhow!("path must use '/' separators: {path}"));
    }

    let mut out = PathBuf::new();
    for part in path.split('/') {
        match Path::new(part).components().next() {
            Some(Component::Normal(_)) if Path::new(part).components().count() == 1 => {
                out.push(part)
            }
            Some(Component::ParentDir) => {
                return Err(anyhow!("path must not include '..': {path}"));
            }
            _ => return Err(anyhow!("path must be relative and normalized: {path}")),
        }
    }
    Ok(out)
}
