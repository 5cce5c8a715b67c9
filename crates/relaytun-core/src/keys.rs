//! Gateway key material.
//!
//! Every gateway owns a single Ed25519 key. The verifying half is the
//! gateway's public key: it is exchanged base64-encoded in connection
//! requests, signs outgoing envelopes and, in Montgomery form, serves as the
//! X25519 agreement key peers encrypt to.
//!
//! On disk the private key is stored as the base64 of its 32-byte seed.

use crate::error::{GatewayError, GatewayResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Length of an encoded public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// The local gateway's private key.
#[derive(Clone)]
pub struct GatewayKeyPair {
    signing: SigningKey,
}

impl GatewayKeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Parse a base64-encoded 32-byte seed.
    pub fn from_base64(encoded: &str) -> GatewayResult<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| GatewayError::Codec(format!("private key is not base64: {e}")))?;
        let seed: [u8; 32] = raw.try_into().map_err(|raw: Vec<u8>| {
            GatewayError::Codec(format!("private key seed must be 32 bytes, got {}", raw.len()))
        })?;
        Ok(Self::from_seed(seed))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.signing.to_bytes())
    }

    pub fn public_key(&self) -> GatewayPublicKey {
        GatewayPublicKey {
            verifying: self.signing.verifying_key(),
        }
    }

    pub(crate) fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// X25519 secret matching [`GatewayPublicKey::agreement_key`].
    pub(crate) fn agreement_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing.to_scalar_bytes())
    }

    /// Load the key stored at `path`, generating and persisting a new one if
    /// the file does not exist yet.
    pub fn load_or_generate(path: &Path) -> GatewayResult<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            return Self::from_base64(&content);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
                }
            }
        }

        let pair = Self::generate();
        fs::write(path, format!("{}\n", pair.to_base64()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(pair)
    }
}

impl std::fmt::Debug for GatewayKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayKeyPair")
            .field("public", &self.public_key().short_fingerprint())
            .finish_non_exhaustive()
    }
}

/// A peer gateway's public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayPublicKey {
    verifying: VerifyingKey,
}

impl GatewayPublicKey {
    pub fn from_bytes(raw: &[u8]) -> GatewayResult<Self> {
        let bytes: [u8; PUBLIC_KEY_LEN] = raw.try_into().map_err(|_| {
            GatewayError::Codec(format!(
                "public key must be {PUBLIC_KEY_LEN} bytes, got {}",
                raw.len()
            ))
        })?;
        let verifying = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| GatewayError::Codec(format!("invalid public key: {e}")))?;
        Ok(Self { verifying })
    }

    pub fn from_base64(encoded: &str) -> GatewayResult<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| GatewayError::Codec(format!("public key is not base64: {e}")))?;
        Self::from_bytes(&raw)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.verifying.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.verifying.as_bytes()
    }

    /// Hex SHA-256 of the raw key.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.verifying.as_bytes()))
    }

    /// First 8 hex characters of [`fingerprint`](Self::fingerprint), for logs.
    pub fn short_fingerprint(&self) -> String {
        self.fingerprint()[..8].to_string()
    }

    pub(crate) fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.verifying.verify(message, signature).is_ok()
    }

    pub(crate) fn agreement_key(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.verifying.to_montgomery().to_bytes())
    }
}
