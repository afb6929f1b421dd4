//! Typed, append-only Block sequences with serialization (C2).
//!
//! A [`File`] is produced by exactly one [`Writer`] and consumed by zero
//! or more [`Reader`]s (§3.2). Items are serialized with `bincode` and
//! length-delimited with the varint scheme of §6.2 so that items larger
//! than one block split across consecutive blocks transparently.

mod file;
mod varint;

pub use file::{File, ReadMode, Reader, Writer};
pub use varint::{read_varint, varint_len, write_varint};
