//! Envelope encryption for credential token blobs.
//!
//! Every sealed blob gets a fresh 256-bit data key: the data key encrypts
//! the payload, and the master key encrypts the data key. The data key is
//! never persisted in plaintext, so rotating or revoking the master key
//! invalidates every stored record at once.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       EnvelopeCipher                     │
//! │  - seal / open                           │
//! │  - fresh data key per seal               │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (wrap data key)     (unwrap data key)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       MasterKey (trait)                  │
//! │  - LocalMasterKey: AES-256-GCM, env key  │
//! │  - swappable for a networked KMS         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - Both layers are AES-256-GCM with unique random nonces
//! - Authenticated encryption: any tampering fails `open`, which never
//!   falls back to empty or default plaintext
//! - No plaintext is cached across calls

mod envelope;

pub use envelope::{EnvelopeCipher, LocalMasterKey, MasterKey, WrappedKey};
