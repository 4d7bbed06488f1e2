//! Per-call identity: account keys plus the signing collaborators
//!
//! Account ids are X25519 public keys. Signing goes through the
//! [`MessageSigner`] and [`EventSigner`] traits; the bundled
//! implementations use an Ed25519 key derived from the account secret.

use crate::error::{AccessError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use scp_core::{unix_now, KeyPair, ProtocolEvent, PublicKey, SecretKey, UnsignedEvent};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

const SIGNING_SEED_DOMAIN: &[u8] = b"scp-signing-seed-v1";

/// Signs free-form messages (gatekeeper requests, auth headers)
pub trait MessageSigner: Send + Sync {
    /// Hex public key that verifies this signer's signatures
    fn public_key_hex(&self) -> String;

    /// Hex signature over `message`
    fn sign_message(&self, message: &str) -> Result<String>;
}

/// Turns an unsigned event into a published one
pub trait EventSigner: Send + Sync {
    fn sign_event(&self, event: UnsignedEvent) -> Result<ProtocolEvent>;
}

/// Ed25519 signer
#[derive(Clone)]
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Signer for an account. The seed is derived from the account secret
    /// under its own HKDF domain, so the X25519 key bytes never sign.
    pub fn from_secret(secret: &SecretKey) -> Self {
        let (prk, _) = Hkdf::<Sha256>::extract(Some(SIGNING_SEED_DOMAIN), &secret.to_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&prk);
        Self::from_seed(&seed)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Check a hex signature produced by [`MessageSigner::sign_message`]
    pub fn verify(public_key_hex: &str, message: &str, signature_hex: &str) -> Result<()> {
        let public: [u8; 32] = decode_fixed(public_key_hex)?;
        let signature: [u8; 64] = decode_fixed(signature_hex)?;
        let verifying_key =
            VerifyingKey::from_bytes(&public).map_err(|e| AccessError::Signing(format!("bad public key: {e}")))?;
        verifying_key
            .verify(message.as_bytes(), &Signature::from_bytes(&signature))
            .map_err(|_| AccessError::Signing("signature verification failed".into()))
    }
}

fn decode_fixed<const N: usize>(hex_str: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_str).map_err(|e| AccessError::Signing(format!("invalid hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| AccessError::Signing(format!("expected {N} bytes")))
}

impl MessageSigner for Ed25519Signer {
    fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    fn sign_message(&self, message: &str) -> Result<String> {
        Ok(hex::encode(self.signing_key.sign(message.as_bytes()).to_bytes()))
    }
}

/// Event id: SHA-256 over `[0, pubkey, created_at, kind, tags, content]`
pub fn event_id(event: &UnsignedEvent) -> Result<String> {
    let serialized = serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))?;
    Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
}

/// Computes the event id and signs it with an Ed25519 key
pub struct LocalEventSigner {
    signer: Ed25519Signer,
}

impl LocalEventSigner {
    pub fn new(signer: Ed25519Signer) -> Self {
        Self { signer }
    }
}

impl EventSigner for LocalEventSigner {
    fn sign_event(&self, event: UnsignedEvent) -> Result<ProtocolEvent> {
        let id = event_id(&event)?;
        let sig = self.signer.sign_message(&id)?;
        Ok(ProtocolEvent {
            id,
            pubkey: event.pubkey,
            created_at: event.created_at,
            kind: event.kind,
            tags: event.tags,
            content: event.content,
            sig,
        })
    }
}

/// Who is asking. Passed explicitly to every access operation.
#[derive(Clone)]
pub struct Session {
    keys: KeyPair,
    signer: Arc<dyn MessageSigner>,
}

impl Session {
    /// Session signing with an Ed25519 key derived from `secret`
    pub fn new(secret: SecretKey) -> Self {
        let signer = Arc::new(Ed25519Signer::from_secret(&secret));
        Self::with_signer(secret, signer)
    }

    pub fn generate() -> Self {
        Self::new(SecretKey::generate())
    }

    pub fn with_signer(secret: SecretKey, signer: Arc<dyn MessageSigner>) -> Self {
        Self {
            keys: KeyPair::from_secret(secret),
            signer,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keys.public
    }

    pub fn pubkey_hex(&self) -> String {
        self.keys.public.to_hex()
    }

    pub fn secret(&self) -> &SecretKey {
        &self.keys.secret
    }

    pub fn is(&self, pubkey_hex: &str) -> bool {
        self.pubkey_hex() == pubkey_hex
    }

    pub fn sign_message(&self, message: &str) -> Result<String> {
        self.signer.sign_message(message)
    }

    /// `Bearer <signer pubkey>:<unix ts>:<signature over "<pubkey>:<ts>">`
    pub fn auth_header(&self) -> Result<String> {
        self.auth_header_at(unix_now())
    }

    pub fn auth_header_at(&self, timestamp: u64) -> Result<String> {
        let payload = format!("{}:{}", self.signer.public_key_hex(), timestamp);
        let signature = self.signer.sign_message(&payload)?;
        Ok(format!("Bearer {payload}:{signature}"))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("pubkey", &self.pubkey_hex())
            .field("secret", &"[redacted]")
            .finish()
    }
}
