pub mod archiver;
pub mod block;
pub mod chain;
pub mod deferred;
pub mod header;
pub mod header_index;
pub mod reassembly;
pub mod transaction;

pub use block::Block;
pub use chain::{run_blocking, try_lock, Blockchain, ChainGuard, ChainHandle};
pub use header::{Header, HeaderId};
