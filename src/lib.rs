//! An RDMA echo benchmark. A client streams fixed-size messages to a server over reliable
//! connected queue pairs, the server echoes every one back, and both sides report throughput
//! after a warm-up.
//!
//! Two data paths are available: two-sided send / receive, and one-sided RDMA writes whose
//! arrival is detected by polling the slot contents.

/// The wrapper over [libibverbs](https://github.com/linux-rdma/rdma-core/tree/master/libibverbs),
/// limited to the resources and operations the benchmark uses.
pub mod ibverbs;

pub mod bench;
pub mod config;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod resources;
pub mod ring;

pub use error::Error;
