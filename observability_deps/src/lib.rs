//! This crate exists to coordinate versions of `tracing` so that the
//! rest of the workspace can use a single, consistent version.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]

// Export tracing publicly so internal crates can depend on a single version.
pub use tracing;
