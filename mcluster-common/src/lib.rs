// mcluster-common - Shared types and protocol definitions for MemCluster
//
// This crate defines the key/item model, the error taxonomy, and the
// memcached wire-protocol constants shared by the client and the bench.

pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;
