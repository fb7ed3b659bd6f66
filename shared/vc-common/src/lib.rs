//! `VoiceChat` Common Library
//!
//! Wire types of the signaling relay, shared by the voice client and the
//! relay server.

pub mod protocol;
pub mod types;

pub use protocol::*;
pub use types::*;
