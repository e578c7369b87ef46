//! In-process collectives over a full mesh of channels.
//!
//! [`ThreadGroup::mesh`] creates one [`ThreadCommunicator`] per rank. Each
//! communicator is meant to be moved onto its own thread, which then runs
//! the same code path as a real multi-process job. Every ordered pair of
//! ranks shares a FIFO channel, so as long as all ranks issue the same
//! sequence of collectives the n-th message a rank receives from a peer is
//! that peer's contribution to the n-th collective.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use crossbeam::channel::{unbounded, Receiver, Sender};

use super::communicator::{DeviceCommunicator, ReduceOp};
use super::error::{DistributedError, Result};
use super::process_group::{ParallelConfig, ProcessGroup};

/// Rank bookkeeping for one member of a [`ThreadGroup`].
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
}

impl ThreadGroup {
    /// Build a fully connected group of `world_size` communicators on `device`.
    ///
    /// The returned vector is indexed by rank.
    ///
    /// # Panics
    /// Panics if `world_size` is 0.
    pub fn mesh(world_size: usize, device: &Device) -> Vec<ThreadCommunicator> {
        assert!(world_size > 0, "world_size must be > 0");

        // channels[src][dst]
        let mut senders: Vec<Vec<Sender<Tensor>>> = Vec::with_capacity(world_size);
        let mut receivers: Vec<Vec<Receiver<Tensor>>> =
            (0..world_size).map(|_| Vec::with_capacity(world_size)).collect();
        for _src in 0..world_size {
            let mut row = Vec::with_capacity(world_size);
            for dst_inbox in receivers.iter_mut() {
                let (tx, rx) = unbounded();
                row.push(tx);
                dst_inbox.push(rx);
            }
            senders.push(row);
        }

        let mut comms = Vec::with_capacity(world_size);
        for (rank, (outbox, inbox)) in senders.into_iter().zip(receivers).enumerate() {
            comms.push(ThreadCommunicator {
                group: ThreadGroup { rank, world_size },
                device: device.clone(),
                outbox,
                inbox,
            });
        }
        comms
    }

    /// Same as [`ThreadGroup::mesh`], with each communicator behind an `Arc`
    /// so it can be shared by the layers of one rank.
    pub fn shared_mesh(world_size: usize, device: &Device) -> Vec<Arc<dyn DeviceCommunicator>> {
        Self::mesh(world_size, device)
            .into_iter()
            .map(|comm| Arc::new(comm) as Arc<dyn DeviceCommunicator>)
            .collect()
    }
}

impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn local_rank(&self) -> usize {
        self.rank
    }

    fn parallel_config(&self) -> ParallelConfig {
        ParallelConfig::tensor_parallel(self.world_size)
    }
}

/// One rank's endpoint of a [`ThreadGroup`] mesh.
pub struct ThreadCommunicator {
    group: ThreadGroup,
    device: Device,
    /// outbox[dst]: channel to rank `dst`.
    outbox: Vec<Sender<Tensor>>,
    /// inbox[src]: channel from rank `src`.
    inbox: Vec<Receiver<Tensor>>,
}

impl ThreadCommunicator {
    fn send_to(&self, dst: usize, tensor: &Tensor) -> Result<()> {
        self.outbox[dst]
            .send(tensor.clone())
            .map_err(|e| DistributedError::Communication {
                peer: dst,
                reason: e.to_string(),
            })
    }

    fn recv_from(&self, src: usize) -> Result<Tensor> {
        self.inbox[src]
            .recv()
            .map_err(|e| DistributedError::Communication {
                peer: src,
                reason: e.to_string(),
            })
    }

    fn check_device(&self, tensor: &Tensor) -> Result<()> {
        if !tensor.device().same_device(&self.device) {
            return Err(DistributedError::DeviceMismatch {
                expected: format!("{:?}", self.device.location()),
                actual: format!("{:?}", tensor.device().location()),
            });
        }
        Ok(())
    }

    /// Every rank sends its tensor to every peer; returns all contributions
    /// in rank order.
    fn exchange(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        self.check_device(tensor)?;
        let rank = self.group.rank;
        for dst in 0..self.group.world_size {
            if dst != rank {
                self.send_to(dst, tensor)?;
            }
        }
        let mut parts = Vec::with_capacity(self.group.world_size);
        for src in 0..self.group.world_size {
            if src == rank {
                parts.push(tensor.clone());
            } else {
                parts.push(self.recv_from(src)?);
            }
        }
        Ok(parts)
    }
}

/// Fold the contributions of all ranks, always in rank order so that every
/// rank computes bit-identical results.
fn reduce_parts(parts: &[Tensor], op: ReduceOp) -> Result<Tensor> {
    let (first, rest) = parts.split_first().ok_or(DistributedError::ShapeMismatch {
        expected: vec![1],
        actual: vec![0],
    })?;
    let mut acc = first.clone();
    for part in rest {
        if part.dims() != acc.dims() {
            return Err(DistributedError::ShapeMismatch {
                expected: acc.dims().to_vec(),
                actual: part.dims().to_vec(),
            });
        }
        acc = match op {
            ReduceOp::Sum | ReduceOp::Average => (&acc + part)?,
            ReduceOp::Product => (&acc * part)?,
            ReduceOp::Min => acc.minimum(part)?,
            ReduceOp::Max => acc.maximum(part)?,
        };
    }
    if op == ReduceOp::Average {
        acc = (acc / parts.len() as f64)?;
    }
    Ok(acc)
}

impl DeviceCommunicator for ThreadCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.group
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        if self.group.is_single() {
            return Ok(tensor.clone());
        }
        let parts = self.exchange(tensor)?;
        reduce_parts(&parts, op)
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        tensor.dim(gather_dim)?;
        if self.group.is_single() {
            return Ok(tensor.clone());
        }
        let parts = self.exchange(tensor)?;
        Ok(Tensor::cat(&parts, gather_dim)?)
    }

    fn broadcast(&self, tensor: &Tensor, src_rank: usize) -> Result<Tensor> {
        let world_size = self.group.world_size;
        if src_rank >= world_size {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size,
            });
        }
        if self.group.is_single() {
            return Ok(tensor.clone());
        }
        if self.group.rank == src_rank {
            self.check_device(tensor)?;
            for dst in (0..world_size).filter(|&dst| dst != src_rank) {
                self.send_to(dst, tensor)?;
            }
            Ok(tensor.clone())
        } else {
            self.recv_from(src_rank)
        }
    }

    fn barrier(&self) -> Result<()> {
        if self.group.is_single() {
            return Ok(());
        }
        let token = Tensor::zeros(1, candle_core::DType::U8, &self.device)?;
        self.exchange(&token)?;
        Ok(())
    }
}
