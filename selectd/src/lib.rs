//! The select tier daemon: HTTP surface, admission gate and wiring
//! around the netstorage fan-out engine.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

pub mod config;
pub mod http;
pub mod logging;
mod prometheus;
pub mod rollup_cache;
pub mod server;
