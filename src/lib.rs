//! # vmstore
//!
//! Storage engine for a virtual Merkle tree whose leaves far outnumber RAM:
//! - Growable, lock-free long indexes mapping paths and keys to locations
//! - Append-only data files with CRC-checked items
//! - Background merging of live items into fewer, larger files
//! - Whole-generation commits fanned out across three stores
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Tree Layer (caller)                        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ save_records / load_*
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                      DataSource                             │
//! │        (one commit at a time, concurrent readers)           │
//! └──────┬──────────────────────┬───────────────────────┬───────┘
//!        │                      │                       │
//!        ▼                      ▼                       ▼
//! ┌─────────────┐      ┌─────────────────┐     ┌─────────────────┐
//! │  HashList   │      │    KeyToPath    │     │    PathStore    │
//! │ (internal   │      │ (LongIndex or   │     │ (LongIndex +    │
//! │  hashes)    │      │  BucketIndex)   │     │  data files)    │
//! └─────────────┘      └────────┬────────┘     └────────┬────────┘
//!                               │                       │
//!                               ▼                       ▼
//!                      ┌─────────────────────────────────────────┐
//!                      │  DataFileCollection  ◄── MergeScheduler │
//!                      └─────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod types;

pub mod collections;
pub mod datafile;
pub mod keyindex;
pub mod store;
pub mod workers;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StoreError};
pub use config::{Config, KeyIndexMode, MergeConfig};
pub use types::{
    BytesKey, BytesValue, DigestType, Hash, InternalRecord, LeafRecord, LongKey, VirtualKey,
    VirtualValue, INVALID_PATH,
};
pub use collections::{HashList, LongIndex};
pub use datafile::{MergeFilter, MergePolicy};
pub use engine::{DataSource, State, StoreStats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of vmstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
