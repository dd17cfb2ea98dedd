//! Root of trust for manifest verification.
//!
//! The pinned key is compiled into the binary. It is never read from a file,
//! an environment variable, or the network, and there is no way to replace it
//! at runtime.

/// Sentinel left in place until a release key is generated with
/// `minisign -G`. Verification against it always fails.
pub const PLACEHOLDER_PUBLIC_KEY: [u8; 32] = [0; 32];

const ROOT_KEY_ID: [u8; 8] = *b"BSTN0001";

static PINNED_ROOT_KEY: TrustedKey = TrustedKey::new(ROOT_KEY_ID, PLACEHOLDER_PUBLIC_KEY);

/// An Ed25519 public key together with its minisign key identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedKey {
    key_id: [u8; 8],
    public_key: [u8; 32],
}

impl TrustedKey {
    pub const fn new(key_id: [u8; 8], public_key: [u8; 32]) -> Self {
        Self { key_id, public_key }
    }

    pub fn key_id(&self) -> &[u8; 8] {
        &self.key_id
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn key_id_hex(&self) -> String {
        hex::encode(self.key_id)
    }

    pub fn is_placeholder(&self) -> bool {
        self.public_key == PLACEHOLDER_PUBLIC_KEY
    }
}

pub fn pinned_root_key() -> &'static TrustedKey {
    &PINNED_ROOT_KEY
}
