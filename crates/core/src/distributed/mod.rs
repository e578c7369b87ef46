//! Distributed computing abstractions for tensor parallelism.
//!
//! This module provides the distribution context the tensor-parallel
//! engines consume:
//! - [`ProcessGroup`] - rank and world-size queries
//! - [`DeviceCommunicator`] - collective operations (broadcast, all_gather,
//!   all_reduce) and rank-to-device placement
//!
//! # Architecture
//!
//! - Single rank: all operations are identity/no-op ([`LocalCommunicator`])
//! - Multiple ranks in one process: [`ThreadGroup::mesh`] wires one
//!   [`ThreadCommunicator`] per thread; each thread runs the code path a
//!   separate process would run
//!
//! # Usage
//!
//! ```ignore
//! use tp_core::distributed::{LocalCommunicator, DeviceCommunicator};
//!
//! let comm = LocalCommunicator::new();
//! assert_eq!(comm.process_group().world_size(), 1);
//! ```

mod communicator;
mod error;
mod process_group;
mod thread_group;

pub use communicator::{DeviceCommunicator, LocalCommunicator, ReduceOp};
pub use error::{DistributedError, Result};
pub use process_group::{LocalProcessGroup, ParallelConfig, ProcessGroup};
pub use thread_group::{ThreadCommunicator, ThreadGroup};
