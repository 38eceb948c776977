//! Manifest signing and verification.
//!
//! Signatures are RSA-PSS with SHA-256 and a fixed salt length, computed over
//! the exact manifest bytes and shipped hex-encoded as a detached document.

use crate::error::{SignerError, SignerResult};
use crate::key::{KeyPair, PublicKey};
use rsa::pss;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use sha2::Sha256;

/// PSS salt length in bytes (the SHA-256 digest size).
pub const SALT_LEN: usize = 32;

/// Signs manifest documents with the control plane key.
pub struct ManifestSigner {
    keypair: KeyPair,
}

impl ManifestSigner {
    /// Create a new signer from a key pair.
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    /// Create from a PKCS#8 PEM private key.
    pub fn from_pkcs8_pem(key_id: impl Into<String>, pem: &str) -> SignerResult<Self> {
        Ok(Self::new(KeyPair::from_pkcs8_pem(key_id, pem)?))
    }

    /// Generate a new signer with a random key.
    pub fn generate(key_id: impl Into<String>, bits: usize) -> SignerResult<Self> {
        Ok(Self::new(KeyPair::generate(key_id, bits)?))
    }

    /// Get the key id.
    pub fn key_id(&self) -> &str {
        &self.keypair.key_id
    }

    /// Get the public key agents pin.
    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    /// Sign `message` and return the hex-encoded signature.
    pub fn sign_hex(&self, message: &[u8]) -> SignerResult<String> {
        let signing_key = pss::SigningKey::<Sha256>::new_with_salt_len(
            self.keypair.secret.rsa_key().clone(),
            SALT_LEN,
        );
        let mut rng = rand::thread_rng();
        let signature = signing_key
            .try_sign_with_rng(&mut rng, message)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        Ok(hex::encode(signature.to_bytes()))
    }
}

/// Something that can produce detached manifest signatures.
pub trait Signer: Send + Sync {
    /// Sign bytes, returning a hex-encoded signature.
    fn sign_hex(&self, message: &[u8]) -> SignerResult<String>;

    /// Get the key id.
    fn key_id(&self) -> &str;
}

impl Signer for ManifestSigner {
    fn sign_hex(&self, message: &[u8]) -> SignerResult<String> {
        self.sign_hex(message)
    }

    fn key_id(&self) -> &str {
        self.key_id()
    }
}

/// Verify a hex-encoded detached signature over `message`.
///
/// Surrounding whitespace in the signature document is ignored.
pub fn verify_manifest(
    message: &[u8],
    signature_hex: &str,
    public_key: &PublicKey,
) -> SignerResult<()> {
    let sig_bytes = hex::decode(signature_hex.trim())
        .map_err(|e| SignerError::InvalidSignature(format!("invalid hex: {e}")))?;

    let expected = public_key.rsa_key().size();
    if sig_bytes.len() != expected {
        return Err(SignerError::InvalidSignature(format!(
            "expected {expected} bytes, got {}",
            sig_bytes.len()
        )));
    }

    let signature = pss::Signature::try_from(sig_bytes.as_slice())
        .map_err(|e| SignerError::InvalidSignature(e.to_string()))?;

    let verifying_key =
        pss::VerifyingKey::<Sha256>::new_with_salt_len(public_key.rsa_key().clone(), SALT_LEN);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| SignerError::VerificationFailed)
}

/// Boolean form of [`verify_manifest`].
pub fn is_authentic(message: &[u8], signature_hex: &str, public_key: &PublicKey) -> bool {
    verify_manifest(message, signature_hex, public_key).is_ok()
}
