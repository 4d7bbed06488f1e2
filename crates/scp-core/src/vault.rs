//! Group key generation and content-key wrapping
//!
//! A community or channel owns one X25519 group key pair. The group secret is
//! distributed by wrapping it once per member (or once for the gatekeeper).
//! Protected content is sealed under a fresh single-use key pair whose secret
//! is itself wrapped to the group public key.

use crate::crypto::{decrypt_message, encrypt_message, CryptoError, KeyPair, PublicKey, SecretKey};
use crate::error::{Error, Result};
use crate::types::{kinds, ProtocolEvent, Tag};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Published group key material. Never contains the group secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKeyBundle {
    /// Group public key (hex)
    pub group_public_key: String,
    /// member public key (hex) -> wrapped group secret
    pub member_keys: BTreeMap<String, String>,
}

/// Output of [`generate_group_keys`]: the publishable bundle plus the group
/// secret, which stays with the caller.
#[derive(Debug, Clone)]
pub struct GeneratedGroupKeys {
    pub bundle: GroupKeyBundle,
    pub group_secret: SecretKey,
}

/// Content sealed under a single-use key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedContent {
    /// Content encrypted between the author and the single-use public key
    pub encrypted_content: String,
    /// Single-use secret wrapped between the author and the group public key
    pub encrypted_key: String,
}

/// Wrap `plaintext` (usually a hex key) for `recipient`.
pub fn wrap(
    sender: &SecretKey,
    recipient: &PublicKey,
    plaintext: &str,
) -> std::result::Result<String, CryptoError> {
    encrypt_message(sender, recipient, plaintext)
}

/// Inverse of [`wrap`], run by the recipient against the sender's public key.
pub fn unwrap(
    recipient: &SecretKey,
    sender: &PublicKey,
    ciphertext: &str,
) -> std::result::Result<String, CryptoError> {
    decrypt_message(recipient, sender, ciphertext)
}

/// Unwrap a hex-encoded secret key.
pub fn unwrap_secret(
    recipient: &SecretKey,
    sender: &PublicKey,
    ciphertext: &str,
) -> std::result::Result<SecretKey, CryptoError> {
    let hex_key = unwrap(recipient, sender, ciphertext)?;
    SecretKey::from_hex(&hex_key)
}

/// Create a fresh group key pair and wrap its secret for every member.
///
/// One key exchange per member; membership changes are rare compared to
/// content volume.
pub fn generate_group_keys(
    owner: &SecretKey,
    members: &[PublicKey],
) -> std::result::Result<GeneratedGroupKeys, CryptoError> {
    let group = KeyPair::generate();
    let group_secret_hex = group.secret.to_hex();

    let mut member_keys = BTreeMap::new();
    for member in members {
        let wrapped = wrap(owner, member, &group_secret_hex)?;
        member_keys.insert(member.to_hex(), wrapped);
    }

    Ok(GeneratedGroupKeys {
        bundle: GroupKeyBundle {
            group_public_key: group.public.to_hex(),
            member_keys,
        },
        group_secret: group.secret,
    })
}

/// Seal `plaintext` for a group under a freshly generated single-use key.
pub fn seal_with_generated_key(
    author: &SecretKey,
    group_public: &PublicKey,
    plaintext: &str,
) -> std::result::Result<SealedContent, CryptoError> {
    let content_key = KeyPair::generate();
    let encrypted_key = wrap(author, group_public, &content_key.secret.to_hex())?;
    let encrypted_content = encrypt_message(author, &content_key.public, plaintext)?;
    Ok(SealedContent {
        encrypted_content,
        encrypted_key,
    })
}

/// Decrypt sealed content with an already recovered single-use key.
pub fn open_with_content_key(
    content_key: &SecretKey,
    author: &PublicKey,
    encrypted_content: &str,
) -> std::result::Result<String, CryptoError> {
    decrypt_message(content_key, author, encrypted_content)
}

/// Recover the single-use key with the group secret and open the content.
/// Returns `(content_key, plaintext)`.
pub fn open_sealed(
    group_secret: &SecretKey,
    author: &PublicKey,
    sealed: &SealedContent,
) -> std::result::Result<(SecretKey, String), CryptoError> {
    let content_key = unwrap_secret(group_secret, author, &sealed.encrypted_key)?;
    let plaintext = open_with_content_key(&content_key, author, &sealed.encrypted_content)?;
    Ok((content_key, plaintext))
}

// =============================================================================
// KEY BUNDLE EVENTS
// =============================================================================

/// `d` identifier of the key bundle event for a group URI
pub fn key_bundle_identifier(group_uri: &str) -> String {
    format!("{group_uri}:keys")
}

impl GroupKeyBundle {
    /// Event content: JSON map of member public key to wrapped secret
    pub fn to_event_content(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.member_keys)?)
    }

    /// Tags for the key bundle event: `d` identifier plus one `p` per member
    pub fn event_tags(&self, group_uri: &str) -> Vec<Tag> {
        let mut tags = vec![Tag::new(["d".to_string(), key_bundle_identifier(group_uri)])];
        tags.extend(self.member_keys.keys().map(|m| Tag::new(["p", m.as_str()])));
        tags
    }

    /// Member key map from a published key bundle event
    pub fn member_keys_from_event(event: &ProtocolEvent) -> Result<BTreeMap<String, String>> {
        if event.kind != kinds::GROUP_KEYS {
            return Err(Error::UnexpectedKind {
                expected: kinds::GROUP_KEYS,
                actual: event.kind,
            });
        }
        Ok(serde_json::from_str(&event.content)?)
    }
}
