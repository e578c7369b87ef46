//! 1-D tensor parallelism over an explicit module graph.
//!
//! - [`TensorParallelMapping`] decides which modules are column-parallel,
//!   row-parallel or left alone.
//! - [`TensorParallelEngine::parallelize`] shards a model for one rank.
//! - [`TensorDeparallelEngine::deparallelize`] gathers the shards back.
//! - [`placement`] moves parameters to the device of their rank.
//!
//! Every rank runs the same calls with its own communicator:
//!
//! ```ignore
//! use std::sync::Arc;
//! use tp_core::distributed::ThreadGroup;
//! use tp_core::tensor_parallel::{parallelize, deparallelize, TensorParallelMapping};
//!
//! let mapping = TensorParallelMapping::builtin()?;
//! for comm in ThreadGroup::shared_mesh(2, &candle_core::Device::Cpu) {
//!     // on the rank's own thread:
//!     parallelize(&mut model, comm.clone(), &mapping)?;
//!     let logits = model.module("lm_head").unwrap().forward(&hidden)?;
//!     deparallelize(&mut model, comm, &mapping)?;
//! }
//! ```

mod deparallel;
mod engine;
mod error;
mod layers;
mod mapping;
pub mod placement;
pub mod slicing;

use std::sync::Arc;

pub use deparallel::TensorDeparallelEngine;
pub use engine::TensorParallelEngine;
pub use error::{MappingError, Result, TensorParallelError};
pub use layers::{ColumnParallel, LayerVariant, RowParallel, VocabParallel};
pub use mapping::{
    FusionDegree, MappingRule, MappingTable, MatchMode, ParallelKind, TensorParallelMapping,
};
pub use slicing::VocabPartition;

use crate::distributed::DeviceCommunicator;
use crate::model::Model;

/// Shard `model` for the rank of `comm`.
pub fn parallelize(
    model: &mut Model,
    comm: Arc<dyn DeviceCommunicator>,
    mapping: &TensorParallelMapping,
) -> Result<()> {
    TensorParallelEngine::with_defaults(comm, mapping.clone()).parallelize(model)
}

/// Gather the shards of `model` back into full tensors.
pub fn deparallelize(
    model: &mut Model,
    comm: Arc<dyn DeviceCommunicator>,
    mapping: &TensorParallelMapping,
) -> Result<()> {
    TensorDeparallelEngine::new(comm, mapping.clone()).deparallelize(model)
}
