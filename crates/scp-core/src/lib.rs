//! SCP Core Library
//!
//! Protocol types and key material for a client of an event relay network
//! with access-controlled communities and channels.
//!
//! # Modules
//!
//! - [`types`]: Events, tags, filters, fetch requests
//! - [`community`]: Community/channel descriptors and `scp` tag payloads
//! - [`crypto`]: Pairwise X25519 + ChaCha20-Poly1305 message encryption
//! - [`vault`]: Group key generation, key wrapping, single-use content keys
//! - [`error`]: Error types

pub mod community;
pub mod crypto;
pub mod error;
pub mod types;
pub mod vault;

pub use crypto::{CryptoError, KeyPair, PublicKey, SecretKey};
pub use error::{Error, Result};
pub use types::*;
