//! Leaf storage
//!
//! Leaves live on disk in data files addressed through a path index.
//! Internal node hashes never reach this module; see `collections::HashList`.

mod path_store;
mod record;

pub use path_store::{PathStore, LEAF_FILES_NAME, PATH_INDEX_FILE};
pub use record::{encode_leaf, Field, RawLeaf};
