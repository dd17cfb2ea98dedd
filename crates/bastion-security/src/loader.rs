use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::minisign::{verify_manifest_signature_with_key, SignatureError};
use crate::pinned_key::{pinned_root_key, TrustedKey};

pub const MAX_MANIFEST_SIZE: u64 = 10 * 1024 * 1024;
pub const MAX_SIGNATURE_SIZE: u64 = 10 * 1024;
pub const SIGNATURE_EXTENSION: &str = "minisig";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// When false a missing `.minisig` yields an unverified load. Only
    /// development installs should turn this off.
    pub require_signature: bool,
    pub max_manifest_bytes: u64,
    pub max_signature_bytes: u64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            require_signature: true,
            max_manifest_bytes: MAX_MANIFEST_SIZE,
            max_signature_bytes: MAX_SIGNATURE_SIZE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestLoadError {
    #[error("manifest file not found: {}", .0.display())]
    ManifestNotFound(PathBuf),
    #[error("not a regular file: {}", .0.display())]
    NotARegularFile(PathBuf),
    #[error("cannot stat {}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("manifest file exceeds maximum size ({limit} bytes): {} is {size} bytes", .path.display())]
    ManifestTooLarge { path: PathBuf, size: u64, limit: u64 },
    #[error("signature file exceeds maximum size ({limit} bytes): {} is {size} bytes", .path.display())]
    SignatureTooLarge { path: PathBuf, size: u64, limit: u64 },
    #[error("manifest signature file not found: {}", .0.display())]
    SignatureNotFound(PathBuf),
    #[error("failed to read {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("signature file is not valid UTF-8: {}", .0.display())]
    SignatureEncoding(PathBuf),
    #[error("manifest signature rejected: {0}")]
    Verification(#[from] SignatureError),
}

/// Manifest bytes that passed the signature gate, or that the caller
/// explicitly accepted unsigned. Only this module can construct one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedManifest {
    bytes: Vec<u8>,
    verified: bool,
    key_id: Option<String>,
}

impl LoadedManifest {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn verified(&self) -> bool {
        self.verified
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }
}

pub fn signature_path_for(manifest_path: &Path) -> PathBuf {
    let mut raw = OsString::from(manifest_path.as_os_str());
    raw.push(".");
    raw.push(SIGNATURE_EXTENSION);
    PathBuf::from(raw)
}

pub fn signature_exists(manifest_path: &Path) -> bool {
    signature_path_for(manifest_path).is_file()
}

pub fn load_and_verify_manifest(
    manifest_path: &Path,
    options: &LoadOptions,
) -> Result<LoadedManifest, ManifestLoadError> {
    load_and_verify_manifest_with_key(manifest_path, options, pinned_root_key())
}

pub fn load_and_verify_manifest_with_key(
    manifest_path: &Path,
    options: &LoadOptions,
    trusted_key: &TrustedKey,
) -> Result<LoadedManifest, ManifestLoadError> {
    load_and_verify_manifest_with_reader(manifest_path, options, trusted_key, read_bounded)
}

pub(crate) fn load_and_verify_manifest_with_reader<ReadFile>(
    manifest_path: &Path,
    options: &LoadOptions,
    trusted_key: &TrustedKey,
    mut read: ReadFile,
) -> Result<LoadedManifest, ManifestLoadError>
where
    ReadFile: FnMut(&Path, u64) -> io::Result<Vec<u8>>,
{
    let manifest_size = match stat_len(manifest_path)? {
        Some(size) => size,
        None => {
            return Err(ManifestLoadError::ManifestNotFound(
                manifest_path.to_path_buf(),
            ))
        }
    };
    if manifest_size > options.max_manifest_bytes {
        return Err(ManifestLoadError::ManifestTooLarge {
            path: manifest_path.to_path_buf(),
            size: manifest_size,
            limit: options.max_manifest_bytes,
        });
    }

    let signature_path = signature_path_for(manifest_path);
    let signature_size = match stat_len(&signature_path)? {
        Some(size) => size,
        None if options.require_signature => {
            return Err(ManifestLoadError::SignatureNotFound(signature_path));
        }
        None => {
            tracing::warn!(
                manifest = %manifest_path.display(),
                "loading manifest without signature; signature enforcement is disabled"
            );
            let bytes = read_manifest(manifest_path, options, &mut read)?;
            return Ok(LoadedManifest {
                bytes,
                verified: false,
                key_id: None,
            });
        }
    };
    if signature_size > options.max_signature_bytes {
        return Err(ManifestLoadError::SignatureTooLarge {
            path: signature_path,
            size: signature_size,
            limit: options.max_signature_bytes,
        });
    }

    let bytes = read_manifest(manifest_path, options, &mut read)?;
    let signature_raw = read_checked(&signature_path, options.max_signature_bytes, &mut read)?;
    if signature_raw.len() as u64 > options.max_signature_bytes {
        return Err(ManifestLoadError::SignatureTooLarge {
            path: signature_path,
            size: signature_raw.len() as u64,
            limit: options.max_signature_bytes,
        });
    }
    let signature_text = String::from_utf8(signature_raw)
        .map_err(|_| ManifestLoadError::SignatureEncoding(signature_path.clone()))?;

    let key_id = verify_manifest_signature_with_key(&bytes, &signature_text, trusted_key)
        .into_result()?;
    tracing::debug!(
        manifest = %manifest_path.display(),
        key_id = key_id.as_deref().unwrap_or_default(),
        "manifest signature verified"
    );

    Ok(LoadedManifest {
        bytes,
        verified: true,
        key_id,
    })
}

/// Size of a regular file, or `None` when it does not exist. Symlinks are
/// followed so a link to a device or FIFO is refused before it is opened.
fn stat_len(path: &Path) -> Result<Option<u64>, ManifestLoadError> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
        Ok(_) => Err(ManifestLoadError::NotARegularFile(path.to_path_buf())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ManifestLoadError::Stat {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Reads at most `limit + 1` bytes from one open handle, so growth after the
/// stat still trips the size check.
fn read_bounded(path: &Path, limit: u64) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    let capacity = usize::try_from(metadata.len().min(limit)).unwrap_or_default();
    let mut bytes = Vec::with_capacity(capacity);
    file.take(limit.saturating_add(1)).read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn read_manifest<ReadFile>(
    path: &Path,
    options: &LoadOptions,
    read: &mut ReadFile,
) -> Result<Vec<u8>, ManifestLoadError>
where
    ReadFile: FnMut(&Path, u64) -> io::Result<Vec<u8>>,
{
    let bytes = read_checked(path, options.max_manifest_bytes, read)?;
    if bytes.len() as u64 > options.max_manifest_bytes {
        return Err(ManifestLoadError::ManifestTooLarge {
            path: path.to_path_buf(),
            size: bytes.len() as u64,
            limit: options.max_manifest_bytes,
        });
    }
    Ok(bytes)
}

fn read_checked<ReadFile>(
    path: &Path,
    limit: u64,
    read: &mut ReadFile,
) -> Result<Vec<u8>, ManifestLoadError>
where
    ReadFile: FnMut(&Path, u64) -> io::Result<Vec<u8>>,
{
    read(path, limit).map_err(|source| ManifestLoadError::Read {
        path: path.to_path_buf(),
        source,
    })
}
