//! The DAG, its stage scheduler (C5, §4.5), and the pipelined local-
//! operator chain (C6, §4.6).

mod chain;
mod node;
mod scheduler;

pub use chain::{emit_fn, filter, flat_map, flat_window, map, window, zip_with_index, Emit};
pub use node::{Graph, NodeId, NodeKind, NodeState};
pub use scheduler::{Scheduler, StageOp};
