use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

/// Extensions hashed as raw bytes. Everything else is treated as text and
/// normalized before hashing.
const BINARY_EXTENSIONS: &[&str] = &[
    // images
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tif", "tiff", "psd",
    // archives
    "zip", "gz", "tgz", "tar", "bz2", "xz", "zst", "7z", "rar", "jar",
    // fonts
    "woff", "woff2", "ttf", "otf", "eot",
    // audio and video
    "mp3", "wav", "ogg", "flac", "m4a", "aac", "mp4", "mov", "avi", "mkv", "webm",
    // executables and objects
    "exe", "dll", "so", "dylib", "bin", "o", "a", "lib", "class", "pyc", "wasm", "node",
    // documents
    "pdf",
];

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("path not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("cannot hash {}: {reason}", .path.display())]
    InvalidTarget { path: PathBuf, reason: String },
    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Unit written into install manifests for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub relative_path: String,
    pub digest: String,
    pub size: u64,
    pub is_binary: bool,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn is_binary_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            BINARY_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Strips a leading UTF-8 BOM and rewrites `\r\n` and bare `\r` to `\n`.
pub fn normalize_text(bytes: &[u8]) -> Vec<u8> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied().peekable();
    while let Some(byte) = iter.next() {
        if byte == b'\r' {
            if iter.peek() == Some(&b'\n') {
                iter.next();
            }
            out.push(b'\n');
        } else {
            out.push(byte);
        }
    }
    out
}

pub fn hash_bytes(bytes: &[u8], binary: bool) -> String {
    if binary {
        sha256_hex(bytes)
    } else {
        sha256_hex(&normalize_text(bytes))
    }
}

pub fn hash_string(content: &str) -> String {
    hash_bytes(content.as_bytes(), false)
}

pub fn hash_file(path: &Path) -> Result<String, HashError> {
    hash_file_as(path, is_binary_path(path))
}

/// Hashes `path` with an explicit mode, for copies whose name no longer
/// carries the original extension.
pub fn hash_file_as(path: &Path, binary: bool) -> Result<String, HashError> {
    let (bytes, _) = read_hashable(path)?;
    Ok(hash_bytes(&bytes, binary))
}

pub fn digests_match(left: &str, right: &str) -> bool {
    !left.is_empty() && left.eq_ignore_ascii_case(right)
}

pub fn file_metadata(path: &Path, base: &Path) -> Result<FileMetadata, HashError> {
    let relative = path
        .strip_prefix(base)
        .map_err(|_| HashError::InvalidTarget {
            path: path.to_path_buf(),
            reason: format!("not located under {}", base.display()),
        })?;
    let relative_path = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");

    let (bytes, size) = read_hashable(path)?;
    let is_binary = is_binary_path(path);
    Ok(FileMetadata {
        relative_path,
        digest: hash_bytes(&bytes, is_binary),
        size,
        is_binary,
    })
}

fn read_hashable(path: &Path) -> Result<(Vec<u8>, u64), HashError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(HashError::NotFound(path.to_path_buf()));
        }
        Err(source) => {
            return Err(HashError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if metadata.is_dir() {
        return Err(HashError::InvalidTarget {
            path: path.to_path_buf(),
            reason: "path is a directory".to_string(),
        });
    }

    let bytes = fs::read(path).map_err(|source| HashError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((bytes, metadata.len()))
}
