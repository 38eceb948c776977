//! Manifest signing for the otter fleet update system.
//!
//! This crate provides:
//! - RSA key generation and PKCS#8 PEM handling
//! - RSA-PSS/SHA-256 detached signatures over manifest bytes
//! - Signature verification against a pinned public key

pub mod error;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use key::{KeyPair, PublicKey, SecretKey};
pub use signer::{ManifestSigner, SALT_LEN, Signer, is_authentic, verify_manifest};
