//! Device communicator for collective operations.
//!
//! The communicator is the distribution context the tensor-parallel engines
//! and the sharded layers are built on: rank queries go through its
//! [`ProcessGroup`], data movement through `broadcast`, `all_gather` and
//! `all_reduce`.

use candle_core::{Device, Tensor};

use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

/// Reduction operations for collective primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise product.
    Product,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
    /// Average (sum / world_size).
    Average,
}

/// Trait for device-to-device communication.
///
/// Every rank of a group must issue the same collectives in the same order;
/// implementations block until all peers have contributed.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// Device the collectives operate on. Tensors handed to a collective
    /// must be contiguous and resident here.
    fn device(&self) -> &Device;

    /// All-reduce: apply reduction across all ranks, result on all ranks.
    ///
    /// For a single rank, this is identity (returns input unchanged).
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// All-gather: concatenate the tensors of all ranks, in rank order,
    /// along `gather_dim`.
    ///
    /// Input shape: [dim0, dim1, ...]
    /// Output shape: [dim0 * world_size, dim1, ...] (if gather_dim=0)
    ///
    /// For a single rank, this is identity.
    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor>;

    /// Broadcast: send tensor from source rank to all other ranks.
    ///
    /// For a single rank, this is identity.
    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor>;

    /// Barrier: synchronize all ranks.
    fn barrier(&self) -> Result<()>;

    /// Device that holds the parameters of the given parallel coordinate.
    ///
    /// CPU communicators place everything on the host; accelerator
    /// communicators map the global rank onto a device ordinal.
    fn rank_to_device(&self, tp_rank: usize, pp_rank: usize, dp_rank: usize) -> Result<Device> {
        let config = self.process_group().parallel_config();
        if tp_rank >= config.tensor_parallel_size {
            return Err(DistributedError::InvalidRank {
                rank: tp_rank,
                world_size: config.tensor_parallel_size,
            });
        }
        let ordinal = config.global_rank(tp_rank, pp_rank, dp_rank);
        let device = self.device();
        if device.is_cuda() {
            Ok(Device::new_cuda(ordinal)?)
        } else if device.is_metal() {
            Ok(Device::new_metal(ordinal)?)
        } else {
            Ok(Device::Cpu)
        }
    }
}

/// Communicator for single-rank execution.
///
/// All collective operations are identity/no-ops since there's only one rank.
pub struct LocalCommunicator {
    process_group: LocalProcessGroup,
    device: Device,
}

impl LocalCommunicator {
    /// Create a single-rank communicator on the CPU.
    pub fn new() -> Self {
        Self::with_device(Device::Cpu)
    }

    /// Create a single-rank communicator on the given device.
    pub fn with_device(device: Device) -> Self {
        Self {
            process_group: LocalProcessGroup::new(),
            device,
        }
    }
}

impl Default for LocalCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCommunicator for LocalCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        // Still validate the dimension so callers see the same errors as
        // with a real group.
        tensor.dim(gather_dim)?;
        Ok(tensor.clone())
    }

    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor> {
        if src_rank != 0 {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size: 1,
            });
        }
        Ok(tensor.clone())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
