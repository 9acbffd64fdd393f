//! Wire protocol for tether host↔guest communication.
//!
//! The guest's command wrapper answers every accepted line with payload bytes
//! followed by a fixed 8-byte [`TERMINATOR`]. There is no length prefix and no
//! escaping: a frame is whatever precedes the next terminator on a raw byte
//! stream (serial console, Unix socket, TCP).

mod codec;
mod message;

pub use codec::{CHUNK, FrameReader, POLL, TimedRead, split_frame};
pub use message::{
    ACK, EXCEPT_PREFIX, GuestFault, READY, Reply, TERMINATOR, decode, decode_word,
};
