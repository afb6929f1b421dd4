//! dfcore: the core of a distributed bulk-synchronous batch dataflow
//! engine — block storage and pool (C1), file/writer/reader (C2), the
//! stream multiplexer (C3), pre/post-reduce hash tables (C4), the DAG
//! and stage scheduler (C5), the pipelined local-operator chain (C6),
//! and the out-of-heap memory pool (C7).
//!
//! This crate is a thin facade: each component lives in its own crate
//! (`dfcore_block`, `dfcore_data`, `dfcore_net`, `dfcore_reduce`,
//! `dfcore_dag`, `dfcore_mem`), and this one re-exports their public
//! surface plus hosts the end-to-end integration tests under `tests/`.
//! Operator surfaces, the collective library, and source/sink adapters
//! are external collaborators and out of scope here (§1).

pub use dfcore_config::{Configuration, Transport};
pub use dfcore_error::{DiagId, Error, JobError, Result};

pub use dfcore_mem::{MemoryPool, SlabPtr};

pub use dfcore_block::{Block, BlockId, BlockPool, PinnedBlock};

pub use dfcore_data::{read_varint, varint_len, write_varint, File, ReadMode, Reader, Writer};

pub use dfcore_net::{
    MockTransport, StreamBlockHeader, StreamId, StreamKind, StreamMultiplexer, StreamReader, StreamWriter,
    TcpTransport, Transport as NetTransport, HEADER_LEN,
};

pub use dfcore_reduce::{
    hash_with_seed, run_location_detection, HashCount, PostReduceTable, PreReduceTable, ReduceFn, ReduceSink,
    Route, RoutingTable, VecSink,
};

pub use dfcore_dag::{
    emit_fn, filter, flat_map, flat_window, map, window, zip_with_index, Emit, Graph, NodeId, NodeKind,
    NodeState, Scheduler, StageOp,
};
