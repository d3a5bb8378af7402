//! Signing keys, signatures, and signed payloads.
//!
//! The engine only sees the [`Signer`] and [`Verifier`] traits. Both are
//! implemented for `ed25519_dalek` keys.
//!
//! Payloads are the canonical JSON encoding of the operation's fields:
//! `[key, value, id]` for an insertion and `[key, id]` for a deletion. Any
//! change to a field, or to their order, invalidates the signature.

use core::fmt;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{canonical_bytes, ValueHasher};

/// An opaque signature.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0))
    }
}

/// Produces signatures. The private material never leaves the signer.
pub trait Signer {
    /// Sign a message.
    fn sign(&self, message: &[u8]) -> Signature;
}

/// Checks signatures against a public key.
pub trait Verifier {
    /// Whether `signature` is valid for `message`.
    fn verify(&self, signature: &Signature, message: &[u8]) -> bool;
}

impl Signer for SigningKey {
    fn sign(&self, message: &[u8]) -> Signature {
        let signature: ed25519_dalek::Signature = ed25519_dalek::Signer::sign(self, message);
        Signature(signature.to_bytes().to_vec())
    }
}

impl Verifier for VerifyingKey {
    fn verify(&self, signature: &Signature, message: &[u8]) -> bool {
        let Ok(signature) = ed25519_dalek::Signature::from_slice(&signature.0) else {
            return false;
        };
        ed25519_dalek::Verifier::verify(self, message, &signature).is_ok()
    }
}

/// Encoding of a verification key handed to a signed replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    /// The 32 raw key bytes.
    #[default]
    Raw,
    /// 64 hexadecimal characters.
    Hex,
}

/// Decode an ed25519 verification key.
pub fn verifying_key_from(encoded: &[u8], format: KeyFormat) -> Result<VerifyingKey> {
    let decoded;
    let raw = match format {
        KeyFormat::Raw => encoded,
        KeyFormat::Hex => {
            decoded = hex::decode(encoded).map_err(|e| Error::InvalidKey(e.to_string()))?;
            decoded.as_slice()
        }
    };
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| Error::InvalidKey(format!("expected 32 bytes, got {}", raw.len())))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::InvalidKey(e.to_string()))
}

/// The signed payload of an insertion.
pub fn insertion_payload<K, V, I>(key: &K, value: &V, id: &I) -> Result<Vec<u8>>
where
    K: Serialize + ?Sized,
    V: Serialize + ?Sized,
    I: Serialize + ?Sized,
{
    canonical_bytes(&(key, value, id))
}

/// The signed payload of a deletion.
pub fn deletion_payload<K, I>(key: &K, id: &I) -> Result<Vec<u8>>
where
    K: Serialize + ?Sized,
    I: Serialize + ?Sized,
{
    canonical_bytes(&(key, id))
}

/// Signs operations for signed replicas.
///
/// # Example
///
/// ```
/// use ed25519_dalek::SigningKey;
/// use observed_remove::signed::OperationSigner;
///
/// let key = SigningKey::from_bytes(&[7; 32]);
/// let signer = OperationSigner::new(key);
/// let signature = signer.sign_insertion(&"k", &42, &1u64).unwrap();
/// assert_eq!(signature.0.len(), 64);
/// ```
#[derive(Debug, Clone)]
pub struct OperationSigner<S> {
    signer: S,
}

impl<S: Signer> OperationSigner<S> {
    /// Wrap a signer.
    pub fn new(signer: S) -> Self {
        Self { signer }
    }

    /// Sign `(key, value, id)` for a map insertion.
    pub fn sign_insertion<K, V, I>(&self, key: &K, value: &V, id: &I) -> Result<Signature>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
        I: Serialize + ?Sized,
    {
        Ok(self.signer.sign(&insertion_payload(key, value, id)?))
    }

    /// Sign `(key, id)` for a map deletion.
    pub fn sign_deletion<K, I>(&self, key: &K, id: &I) -> Result<Signature>
    where
        K: Serialize + ?Sized,
        I: Serialize + ?Sized,
    {
        Ok(self.signer.sign(&deletion_payload(key, id)?))
    }

    /// Sign a set addition: an insertion keyed by the value's digest.
    pub fn sign_addition<V, I, H>(&self, hasher: &H, value: &V, id: &I) -> Result<Signature>
    where
        V: Serialize + ?Sized,
        I: Serialize + ?Sized,
        H: ValueHasher,
    {
        self.sign_insertion(&hasher.hash(value)?, value, id)
    }

    /// Sign a set removal: a deletion keyed by the value's digest.
    pub fn sign_removal<V, I, H>(&self, hasher: &H, value: &V, id: &I) -> Result<Signature>
    where
        V: Serialize + ?Sized,
        I: Serialize + ?Sized,
        H: ValueHasher,
    {
        self.sign_deletion(&hasher.hash(value)?, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(seed: u8) -> (SigningKey, VerifyingKey) {
        let signing = SigningKey::from_bytes(&[seed; 32]);
        let verifying = signing.verifying_key();
        (signing, verifying)
    }

    #[test]
    fn sign_and_verify() {
        let (signing, verifying) = keypair(1);
        let signature = Signer::sign(&signing, b"message");
        assert!(Verifier::verify(&verifying, &signature, b"message"));
        assert!(!Verifier::verify(&verifying, &signature, b"other"));
    }

    #[test]
    fn other_key_fails() {
        let (alice, _) = keypair(1);
        let (_, bob) = keypair(2);
        let signature = Signer::sign(&alice, b"message");
        assert!(!Verifier::verify(&bob, &signature, b"message"));
    }

    #[test]
    fn malformed_signature_fails() {
        let (_, verifying) = keypair(1);
        assert!(!Verifier::verify(&verifying, &Signature(b"***".to_vec()), b"m"));
    }

    #[test]
    fn payload_is_order_sensitive() {
        let a = insertion_payload(&"k", &"v", &1u64).unwrap();
        let b = insertion_payload(&"v", &"k", &1u64).unwrap();
        assert_ne!(a, b);
        assert_eq!(deletion_payload(&"k", &1u64).unwrap(), br#"["k",1]"#);
    }

    #[test]
    fn decode_key_formats() {
        let (_, verifying) = keypair(3);
        let raw = verifying.to_bytes();
        assert_eq!(verifying_key_from(&raw, KeyFormat::Raw).unwrap(), verifying);
        let encoded = hex::encode(raw);
        assert_eq!(
            verifying_key_from(encoded.as_bytes(), KeyFormat::Hex).unwrap(),
            verifying
        );
        assert!(matches!(
            verifying_key_from(b"short", KeyFormat::Raw),
            Err(Error::InvalidKey(_))
        ));
        assert!(verifying_key_from(b"zz", KeyFormat::Hex).is_err());
    }
}
