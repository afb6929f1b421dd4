//! Bucket-chained pre/post-reduce hash tables (C4): the central shuffle
//! primitive. §4.4.1 gives the shared bucket-chain structure and insert
//! contract; §4.4.2/§4.4.3 specialize it into the sender-side
//! (pre-reduce) and receiver-side (post-reduce) halves of a shuffle;
//! §4.4.4 adds an optional sketch-based location-detection pre-pass for
//! binary operators.

mod location;
mod post_reduce;
mod pre_reduce;
mod table;

pub use location::{run_location_detection, HashCount, Route, RoutingTable};
pub use post_reduce::{PostReduceTable, ReduceSink, VecSink};
pub use pre_reduce::PreReduceTable;
pub use table::{hash_with_seed, ReduceFn};
