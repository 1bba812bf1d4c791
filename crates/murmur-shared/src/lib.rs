//! # murmur-shared
//!
//! Types shared between the relay server and the persistence layer: user and
//! room identifiers, the JSON wire protocol spoken over the chat socket, and
//! protocol-wide constants.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{ErrorCode, InboundEvent, OutboundEvent};
pub use types::{RoomId, UserId};
