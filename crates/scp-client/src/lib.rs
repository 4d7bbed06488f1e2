//! scp-client - access control for SCP-protected communities and channels
//!
//! This crate provides:
//! - Content key recovery for protected posts and channel messages
//!   ([`AccessResolver`])
//! - The gatekeeper service client
//! - Per-call identity and signing ([`Session`])
//! - Versioned event readers and protected content writers
//! - Configuration for the `scpctl` binary

pub mod access;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod reader;
pub mod session;
pub mod writer;

#[cfg(test)]
mod testing;

pub use access::{AccessResolver, GroupDescriptor, KeyRecovery, PostKeysWindow};
pub use config::Config;
pub use error::{AccessError, Result};
pub use gatekeeper::{GatekeeperClient, KeyMap};
pub use reader::{reader_for, EventReader, ReaderVersion};
pub use session::{Ed25519Signer, EventSigner, LocalEventSigner, MessageSigner, Session};
pub use writer::Publisher;
