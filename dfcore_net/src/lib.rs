//! The all-to-all Stream Multiplexer between workers (C3).
//!
//! Workers exchange typed item streams over a [`Transport`] group. Every
//! stream is either a `CatStream` (delivery concatenated in sender-rank
//! order) or a `MixStream` (delivery in arrival order, interleaved across
//! senders), allocated collectively through a [`StreamMultiplexer`] and
//! written/read through [`StreamWriter`]/[`StreamReader`] pairs built on
//! the same [`dfcore_block::Block`] storage as `dfcore_data`'s files.

mod header;
mod stream;
mod transport;

pub use header::{StreamBlockHeader, StreamKind, HEADER_LEN};
pub use stream::{StreamId, StreamMultiplexer, StreamReader, StreamWriter};
pub use transport::{MockTransport, TcpTransport, Transport};
