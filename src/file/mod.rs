//! Low-level binary access used by the OAT codec.
//!
//! The only public type here is [`Parser`], a bounds-checked little-endian
//! cursor over a byte slice. The codec never reads through raw pointers;
//! every multi-byte field goes through this layer so truncated or corrupt
//! containers surface as [`crate::Error::OutOfBounds`] instead of panics.

mod parser;

pub use parser::Parser;
