//! SSH agent emulation
//!
//! - `protocol`: agent wire format (identities, sign requests, failure)
//! - `keys`: signer variants (RSA, ECDSA, Ed25519, certificate, platform)
//! - `constraints`: per-key usage policy
//! - `emulator`: the keyring and request state machine
//! - `forward`: the socket/channel serving loop

pub mod constraints;
mod emulator;
mod forward;
pub mod keys;
pub mod protocol;

pub use constraints::{AgentConstraint, ConfirmUse, Confirmation, RequestOrigin, TrustedConnectionOnly};
pub use emulator::{AgentKeyEntry, SshAgent};
pub use keys::{AgentKey, PlatformSigner};
pub use protocol::{AgentRequest, AgentResponse, Identity};
