//! Wire protocol for the kernel session.
//!
//! Provides:
//! - `Message` - the protocol message model and builders for the
//!   standard outgoing kinds
//! - `codec` - frame assembly plus message encoding/decoding
//! - `MessageSigner` - pluggable signing of message payloads
//! - `RouterSocket` / `PubSocket` - the channel socket pair the
//!   session multiplexes

pub mod codec;
pub mod message;
pub mod signer;
pub mod socket;

pub use codec::{FrameAssembler, ProtocolError, decode_message, encode_message, write_frames};
pub use message::{Channel, Message, Payload};
pub use signer::{HmacSha256Signer, MessageSigner, NullSigner, create_signer};
pub use socket::{PubSocket, RouterSocket};
