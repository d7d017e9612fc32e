//! Portal/driver session protocol
//!
//! Every packet is a one-byte identifier followed by its payload, and packets travel over the
//! byte stream prefixed with their 4-byte big-endian length.

mod codec;
pub use codec::*;

pub mod message;
pub use message::Message;

mod packet;
pub use packet::*;
