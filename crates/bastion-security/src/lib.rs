mod content_hash;
mod loader;
mod minisign;
mod pinned_key;

pub use content_hash::{
    digests_match, file_metadata, hash_bytes, hash_file, hash_file_as, hash_string,
    is_binary_path, normalize_text, sha256_hex, FileMetadata, HashError,
};
pub use loader::{
    load_and_verify_manifest, load_and_verify_manifest_with_key, signature_exists,
    signature_path_for, LoadOptions, LoadedManifest, ManifestLoadError, MAX_MANIFEST_SIZE,
    MAX_SIGNATURE_SIZE,
};
pub use minisign::{
    parse_signature, verify_manifest_signature, verify_manifest_signature_with_key,
    MinisignSignature, SignatureAlgorithm, SignatureError, SignatureVerification,
};
pub use pinned_key::{pinned_root_key, TrustedKey, PLACEHOLDER_PUBLIC_KEY};
