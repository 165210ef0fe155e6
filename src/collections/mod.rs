//! Collections Module
//!
//! In-memory index structures used by every store.
//!
//! ## Responsibilities
//! - `LongIndex`: chunked long-to-long map with lock-free growth, pruning of
//!   a leading range and file snapshots
//! - `HashList`: path-addressed internal node hashes, memory only

mod hash_list;
mod long_index;

pub use hash_list::HashList;
pub use long_index::{LongIndex, CURRENT_FORMAT_VERSION, MAX_LONGS_PER_CHUNK, MAX_NUM_CHUNKS, SENTINEL};
