//! Pairwise message encryption
//!
//! Both directions of a conversation derive the same key: X25519 between our
//! secret and their public key, expanded with HKDF-SHA256, then used with
//! ChaCha20-Poly1305 under a random nonce. Ciphertext text form is
//! `<hex ciphertext>?iv=<hex nonce>`.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// HKDF info string for pairwise message keys
const MESSAGE_KEY_INFO: &[u8] = b"scp-message-key-v1";

/// Nonce length for ChaCha20-Poly1305
const NONCE_LEN: usize = 12;

/// Cryptographic errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Malformed ciphertext")]
    MalformedCiphertext,
    #[error("Non-contributory key exchange")]
    NonContributory,
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

// =============================================================================
// KEYS
// =============================================================================

/// Long-lived X25519 secret key
#[derive(Clone)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    /// Create from raw bytes (for deterministic testing)
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        Ok(Self::from_bytes(decode_32(hex_str)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519Public::from(&self.0))
    }

    fn shared_key(&self, their: &PublicKey) -> Result<[u8; 32], CryptoError> {
        let shared = self.0.diffie_hellman(&their.0);
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = [0u8; 32];
        hkdf.expand(MESSAGE_KEY_INFO, &mut key)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(key)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// X25519 public key; its hex form is the account identifier in events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PublicKey(X25519Public);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(X25519Public::from(bytes))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        Ok(Self::from_bytes(decode_32(hex_str)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Secret key with its public half
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }
}

fn decode_32(hex_str: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", v.len())))
}

// =============================================================================
// MESSAGE ENCRYPTION
// =============================================================================

/// Encrypt `plaintext` so that the holder of `their`'s secret (paired with
/// our public key) can read it.
pub fn encrypt_message(
    ours: &SecretKey,
    their: &PublicKey,
    plaintext: &str,
) -> Result<String, CryptoError> {
    let key = ours.shared_key(their)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| CryptoError::InvalidKey("bad symmetric key length".into()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(format!("{}?iv={}", hex::encode(ciphertext), hex::encode(nonce_bytes)))
}

/// Decrypt a payload produced by [`encrypt_message`] with the mirrored key
/// pair.
pub fn decrypt_message(
    ours: &SecretKey,
    their: &PublicKey,
    payload: &str,
) -> Result<String, CryptoError> {
    let (ct_hex, iv_hex) = payload
        .split_once("?iv=")
        .ok_or(CryptoError::MalformedCiphertext)?;
    let ciphertext = hex::decode(ct_hex).map_err(|_| CryptoError::MalformedCiphertext)?;
    let nonce_bytes = hex::decode(iv_hex).map_err(|_| CryptoError::MalformedCiphertext)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CryptoError::MalformedCiphertext);
    }

    let key = ours.shared_key(their)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| CryptoError::InvalidKey("bad symmetric key length".into()))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairwise_roundtrip() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let ct = encrypt_message(&alice.secret, &bob.public, "secret message").unwrap();
        assert!(ct.contains("?iv="));

        // Both sides derive the same key
        assert_eq!(
            decrypt_message(&bob.secret, &alice.public, &ct).unwrap(),
            "secret message"
        );
        assert_eq!(
            decrypt_message(&alice.secret, &bob.public, &ct).unwrap(),
            "secret message"
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let eve = KeyPair::generate();

        let ct = encrypt_message(&alice.secret, &bob.public, "secret").unwrap();
        assert_eq!(
            decrypt_message(&eve.secret, &alice.public, &ct),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_malformed_ciphertext() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        assert_eq!(
            decrypt_message(&bob.secret, &alice.public, "not-a-ciphertext"),
            Err(CryptoError::MalformedCiphertext)
        );
        assert_eq!(
            decrypt_message(&bob.secret, &alice.public, "abcd?iv=00"),
            Err(CryptoError::MalformedCiphertext)
        );
    }

    #[test]
    fn test_hex_key_roundtrip() {
        let kp = KeyPair::generate();
        let secret = SecretKey::from_hex(&kp.secret.to_hex()).unwrap();
        assert_eq!(secret.public_key(), kp.public);
        assert_eq!(PublicKey::from_hex(&kp.public.to_hex()).unwrap(), kp.public);
        assert!(matches!(
            PublicKey::from_hex("abcd"),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = KeyPair::generate();
        let zero = PublicKey::from_bytes([0u8; 32]);
        assert_eq!(
            encrypt_message(&alice.secret, &zero, "x"),
            Err(CryptoError::NonContributory)
        );
    }
}
