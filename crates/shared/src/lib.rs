//! Wire protocol shared between the Helion host daemon and the guest agent.
//!
//! A frame on the serial channel is a 4-byte big-endian length followed by
//! exactly that many payload bytes. The payload is the postcard encoding of
//! one [`message::Message`].

pub mod error;
pub mod message;
pub mod ops;
pub mod wire;

pub use error::ErrorKind;
pub use message::{Kind, Message, Status, PROTOCOL_VERSION};
