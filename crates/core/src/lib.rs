//! Tensor-parallel partitioning of transformer model graphs.
//!
//! - [`distributed`]: process groups and collective communicators
//! - [`config`]: parallelism configuration document
//! - [`model`]: explicit module graph
//! - [`tensor_parallel`]: mapping tables, sharded layers, the parallelize
//!   and deparallelize engines and device placement

pub mod config;
pub mod distributed;
pub mod model;
pub mod tensor_parallel;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
