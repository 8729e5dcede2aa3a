//! Client-side fan-out/fan-in engine for the storage node cluster.
//!
//! This crate is the distributed core of the select tier:
//!
//! - **write path**: [`InsertCtx`] routes each row to exactly one shard
//!   via a consistent hash of its labels and batches rows per shard
//! - **read path**: [`StorageCluster`] scatters every query verb across
//!   all shards over a framed RPC protocol, degrades to partial results
//!   when some shards fail, spills returned blocks to a per-query temp
//!   file and k-way merges them into chronological series
//!
//! The shard list is fixed at startup. The only cancellation primitive
//! is the per-query deadline, which every RPC carries and enforces at
//! the socket.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

use data_types::{BlockError, MetricNameError, SearchQueryError};
use std::time::Duration;
use thiserror::Error as ThisError;

mod cluster;
mod codec;
mod handshake;
mod insert;
mod merge;
mod node;
mod pool;
mod spill;
pub mod test_util;

pub use cluster::StorageCluster;
pub use codec::RpcError;
pub use insert::InsertCtx;
pub use merge::{SearchResults, Series};
pub use node::{StorageNode, MAX_CONCURRENT_QUERIES_PER_STORAGE_NODE};
pub use spill::BlockAddr;

/// Errors returned by the netstorage layer.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The configuration contained no storage nodes.
    #[error("the storage node list cannot be empty")]
    NoStorageNodes,

    /// The per-shard concurrency gate is full; the request fails fast
    /// instead of queueing.
    #[error("too many concurrent queries (more than {limit}) to storage node {addr}")]
    TooManyConcurrentQueries { addr: String, limit: usize },

    /// A verb failed against one storage node, after the retry.
    #[error("cannot execute {verb:?} on storage node {addr} with timeout {timeout:?}: {source}")]
    Rpc {
        verb: &'static str,
        addr: String,
        timeout: Duration,
        source: RpcError,
    },

    /// An insert-path packet could not be delivered.
    #[error("cannot send {bytes} bytes to storage node {addr}: {source}")]
    Push {
        addr: String,
        bytes: usize,
        source: RpcError,
    },

    /// A block could not be appended to the temporary blocks file.
    #[error("cannot write data to temporary blocks file: {source}")]
    SpillWrite { source: std::io::Error },

    /// The temporary blocks file could not be finalized; the whole
    /// query fails non-partially.
    #[error("cannot finalize temporary blocks file: {source}")]
    SpillFinalize { source: std::io::Error },

    /// A block could not be read back from the temporary blocks file.
    #[error("cannot read block from temporary blocks file: {source}")]
    SpillRead { source: std::io::Error },

    /// The query deadline expired while merging results.
    #[error("timeout exceeded during query execution: {timeout:?}")]
    QueryTimeout { timeout: Duration },

    /// A metric name failed to marshal or unmarshal.
    #[error("cannot process metric name: {source}")]
    MetricName { source: MetricNameError },

    /// A spilled block failed to decode during merge.
    #[error("cannot unmarshal block: {source}")]
    Block { source: BlockError },

    /// The search query could not be marshalled.
    #[error("cannot marshal search query: {0}")]
    SearchQuery(#[from] SearchQueryError),
}
