use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use blake2::{Blake2b512, Digest};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::pinned_key::{pinned_root_key, TrustedKey};

const UNTRUSTED_COMMENT_PREFIX: &str = "untrusted comment:";
const TRUSTED_COMMENT_PREFIX: &str = "trusted comment:";
const SIGNATURE_BLOB_LEN: usize = 2 + 8 + 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error(
        "pinned public key has not been configured: replace the placeholder root key in bastion-security before verifying manifests"
    )]
    PlaceholderKey,
    #[error("invalid signature format: insufficient lines")]
    InsufficientLines,
    #[error("invalid signature format: missing untrusted comment")]
    MissingUntrustedComment,
    #[error("invalid signature format: {line} is not valid base64")]
    InvalidBase64 { line: &'static str },
    #[error("invalid signature format: signature blob is {len} bytes, expected at least 74")]
    SignatureTooShort { len: usize },
    #[error("invalid signature format: trusted comment without global signature")]
    MissingGlobalSignature,
    #[error("unsupported signature algorithm '{0}' (expected 'Ed' or 'ED')")]
    UnsupportedAlgorithm(String),
    #[error("key ID mismatch: expected {expected}, got {actual}")]
    KeyIdMismatch { expected: String, actual: String },
    #[error("invalid Ed25519 public key bytes")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    SignatureMismatch,
    #[error("invalid global signature length: expected 64 bytes, got {0}")]
    InvalidGlobalSignatureLength(usize),
    #[error("trusted comment signature verification failed")]
    TrustedCommentMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// `Ed`: the signature covers the message bytes.
    Pure,
    /// `ED`: the signature covers BLAKE2b-512 of the message bytes.
    Prehashed,
}

impl SignatureAlgorithm {
    fn from_tag(tag: [u8; 2]) -> Result<Self, SignatureError> {
        match &tag {
            b"Ed" => Ok(Self::Pure),
            b"ED" => Ok(Self::Prehashed),
            _ => Err(SignatureError::UnsupportedAlgorithm(
                String::from_utf8_lossy(&tag).into_owned(),
            )),
        }
    }
}

/// Decoded contents of a `.minisig` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinisignSignature {
    pub algorithm_tag: [u8; 2],
    pub key_id: [u8; 8],
    pub signature: [u8; 64],
    pub trusted_comment: Option<String>,
    pub global_signature: Option<Vec<u8>>,
}

/// Outcome of checking a manifest against the root key.
///
/// `key_id` is populated as soon as the signature blob has been decoded, so a
/// key mismatch still reports which key signed the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureVerification {
    pub valid: bool,
    pub error: Option<SignatureError>,
    pub key_id: Option<String>,
}

impl SignatureVerification {
    pub fn into_result(self) -> Result<Option<String>, SignatureError> {
        match self.error {
            Some(err) => Err(err),
            None if self.valid => Ok(self.key_id),
            None => Err(SignatureError::SignatureMismatch),
        }
    }
}

pub fn parse_signature(content: &str) -> Result<MinisignSignature, SignatureError> {
    let lines: Vec<&str> = content.trim().lines().collect();
    if lines.len() < 2 {
        return Err(SignatureError::InsufficientLines);
    }
    if !lines[0].starts_with(UNTRUSTED_COMMENT_PREFIX) {
        return Err(SignatureError::MissingUntrustedComment);
    }

    let blob = STANDARD
        .decode(lines[1].trim())
        .map_err(|_| SignatureError::InvalidBase64 {
            line: "signature line",
        })?;
    if blob.len() < SIGNATURE_BLOB_LEN {
        return Err(SignatureError::SignatureTooShort { len: blob.len() });
    }

    let mut algorithm_tag = [0u8; 2];
    algorithm_tag.copy_from_slice(&blob[0..2]);
    let mut key_id = [0u8; 8];
    key_id.copy_from_slice(&blob[2..10]);
    let mut signature = [0u8; 64];
    signature.copy_from_slice(&blob[10..SIGNATURE_BLOB_LEN]);

    let mut trusted_comment = None;
    let mut global_signature = None;
    if let Some(comment_line) = lines.get(2) {
        if let Some(comment) = comment_line.strip_prefix(TRUSTED_COMMENT_PREFIX) {
            let global_line = lines
                .get(3)
                .ok_or(SignatureError::MissingGlobalSignature)?;
            let decoded = STANDARD.decode(global_line.trim()).map_err(|_| {
                SignatureError::InvalidBase64 {
                    line: "global signature line",
                }
            })?;
            trusted_comment = Some(comment.strip_prefix(' ').unwrap_or(comment).to_string());
            global_signature = Some(decoded);
        }
    }

    Ok(MinisignSignature {
        algorithm_tag,
        key_id,
        signature,
        trusted_comment,
        global_signature,
    })
}

/// Verifies `manifest` against the compiled-in root key. Must complete with
/// `valid == true` before the manifest bytes reach any parser.
pub fn verify_manifest_signature(manifest: &[u8], signature_text: &str) -> SignatureVerification {
    verify_manifest_signature_with_key(manifest, signature_text, pinned_root_key())
}

pub fn verify_manifest_signature_with_key(
    manifest: &[u8],
    signature_text: &str,
    trusted_key: &TrustedKey,
) -> SignatureVerification {
    let mut key_id = None;
    let outcome = check_signature(manifest, signature_text, trusted_key, &mut key_id);
    match outcome {
        Ok(()) => SignatureVerification {
            valid: true,
            error: None,
            key_id,
        },
        Err(err) => {
            tracing::debug!(error = %err, "manifest signature rejected");
            SignatureVerification {
                valid: false,
                error: Some(err),
                key_id,
            }
        }
    }
}

fn check_signature(
    manifest: &[u8],
    signature_text: &str,
    trusted_key: &TrustedKey,
    reported_key_id: &mut Option<String>,
) -> Result<(), SignatureError> {
    if trusted_key.is_placeholder() {
        return Err(SignatureError::PlaceholderKey);
    }

    let parsed = parse_signature(signature_text)?;
    let algorithm = SignatureAlgorithm::from_tag(parsed.algorithm_tag)?;

    *reported_key_id = Some(hex::encode(parsed.key_id));
    if &parsed.key_id != trusted_key.key_id() {
        return Err(SignatureError::KeyIdMismatch {
            expected: trusted_key.key_id_hex(),
            actual: hex::encode(parsed.key_id),
        });
    }

    let verifying_key = VerifyingKey::from_bytes(trusted_key.public_key())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let verified = match algorithm {
        SignatureAlgorithm::Pure => verify_ed25519(manifest, &parsed.signature, &verifying_key),
        SignatureAlgorithm::Prehashed => {
            let digest = Blake2b512::digest(manifest);
            verify_ed25519(&digest, &parsed.signature, &verifying_key)
        }
    };
    if !verified {
        return Err(SignatureError::SignatureMismatch);
    }

    if let (Some(comment), Some(global_signature)) =
        (&parsed.trusted_comment, &parsed.global_signature)
    {
        let global_len = global_signature.len();
        let global_array: [u8; 64] = global_signature
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::InvalidGlobalSignatureLength(global_len))?;

        let mut global_message = Vec::with_capacity(64 + comment.len());
        global_message.extend_from_slice(&parsed.signature);
        global_message.extend_from_slice(comment.as_bytes());
        if !verify_ed25519(&global_message, &global_array, &verifying_key) {
            return Err(SignatureError::TrustedCommentMismatch);
        }
    }

    Ok(())
}

fn verify_ed25519(message: &[u8], signature: &[u8; 64], verifying_key: &VerifyingKey) -> bool {
    let signature = Signature::from_bytes(signature);
    verifying_key.verify(message, &signature).is_ok()
}
