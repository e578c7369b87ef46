//! Rank-aware tensor partitioning and its inverse.
//!
//! Linear weights are cut into `fusion_degree * world_size` equal chunks
//! along the slicing dimension. With fusion the chunk sequence is read as
//! `fusion_degree` groups of `world_size` (e.g. Q, K, V), and rank `r`
//! keeps chunk `r` of every group, concatenated in group order. Embedding
//! tables use contiguous ceil-sized row ranges instead, see
//! [`VocabPartition`].

use std::ops::Range;

use candle_core::Tensor;

use super::error::{Result, TensorParallelError};
use super::mapping::ParallelKind;
use crate::distributed::DeviceCommunicator;

/// Dimension a weight is sliced along: 0 for column, 1 for row, flipped
/// when the weight is stored transposed.
pub fn slice_dim(kind: ParallelKind, reversed: bool) -> usize {
    let dim = match kind {
        ParallelKind::Row => 1,
        ParallelKind::Column | ParallelKind::None => 0,
    };
    if reversed {
        1 - dim
    } else {
        dim
    }
}

/// Split `tensor` into `chunks` equal contiguous pieces along `dim`.
pub fn split_even(tensor: &Tensor, dim: usize, chunks: usize) -> candle_core::Result<Vec<Tensor>> {
    let size = tensor.dim(dim)?;
    if chunks == 0 || size % chunks != 0 {
        return Err(candle_core::Error::Msg(format!(
            "dim {dim} of size {size} is not divisible into {chunks} chunks"
        )));
    }
    let chunk = size / chunks;
    (0..chunks)
        .map(|i| tensor.narrow(dim, i * chunk, chunk))
        .collect()
}

/// This rank's shard of `tensor`.
pub fn shard_tensor(
    tensor: &Tensor,
    dim: usize,
    fusion_degree: usize,
    world_size: usize,
    rank: usize,
) -> candle_core::Result<Tensor> {
    if rank >= world_size {
        return Err(candle_core::Error::Msg(format!(
            "rank {rank} out of range for world_size {world_size}"
        )));
    }
    let chunks = split_even(tensor, dim, fusion_degree * world_size)?;
    let shard = if fusion_degree == 1 {
        chunks[rank].clone()
    } else {
        let mine: Vec<Tensor> = (0..fusion_degree)
            .map(|group| chunks[group * world_size + rank].clone())
            .collect();
        Tensor::cat(&mine, dim)?
    };
    shard.contiguous()
}

/// Reassemble the full tensor from every rank's shard, in rank order.
pub fn reconstruct(shards: &[Tensor], fusion_degree: usize, dim: usize) -> candle_core::Result<Tensor> {
    if fusion_degree == 1 {
        return Tensor::cat(shards, dim);
    }
    let mut slots: Vec<Vec<Tensor>> = vec![Vec::with_capacity(shards.len()); fusion_degree];
    for shard in shards {
        for (slot, piece) in slots.iter_mut().zip(split_even(shard, dim, fusion_degree)?) {
            slot.push(piece);
        }
    }
    let slots = slots
        .iter()
        .map(|pieces| Tensor::cat(pieces, dim))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Tensor::cat(&slots, dim)
}

/// Contiguous row ranges of an embedding table split over `world_size`
/// ranks: `ceil(num_embeddings / world_size)` rows each, the last range
/// holding the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabPartition {
    num_embeddings: usize,
    world_size: usize,
}

impl VocabPartition {
    pub fn new(num_embeddings: usize, world_size: usize) -> Result<Self> {
        let empty_shard = || TensorParallelError::EmptyShard {
            num_embeddings,
            world_size,
        };
        if world_size == 0 || num_embeddings == 0 {
            return Err(empty_shard());
        }
        let per_rank = num_embeddings.div_ceil(world_size);
        if per_rank * (world_size - 1) >= num_embeddings {
            return Err(empty_shard());
        }
        Ok(Self {
            num_embeddings,
            world_size,
        })
    }

    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Rows held by every rank but the last.
    pub fn per_rank(&self) -> usize {
        self.num_embeddings.div_ceil(self.world_size)
    }

    pub fn range(&self, rank: usize) -> Range<usize> {
        let per_rank = self.per_rank();
        let start = (rank * per_rank).min(self.num_embeddings);
        let end = ((rank + 1) * per_rank).min(self.num_embeddings);
        start..end
    }

    pub fn ranges(&self) -> Vec<Range<usize>> {
        (0..self.world_size).map(|rank| self.range(rank)).collect()
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.ranges().into_iter().map(|r| r.len()).collect()
    }
}

/// All-gather shards that may differ in size along `dim`.
///
/// Every rank pads its shard with zeros to the largest size so the
/// collective always exchanges equal shapes, then the padding is dropped.
/// `sizes[r]` is the size of rank `r`'s shard along `dim`.
pub fn gather_uneven(
    comm: &dyn DeviceCommunicator,
    tensor: &Tensor,
    dim: usize,
    sizes: &[usize],
) -> Result<Tensor> {
    let max = sizes.iter().copied().max().unwrap_or(0);
    let local = tensor.dim(dim)?;
    let padded = if local < max {
        let mut pad_shape = tensor.dims().to_vec();
        pad_shape[dim] = max - local;
        let pad = Tensor::zeros(pad_shape, tensor.dtype(), tensor.device())?;
        Tensor::cat(&[tensor, &pad], dim)?
    } else {
        tensor.clone()
    };
    let gathered = comm.all_gather(&padded.contiguous()?, dim)?;
    if sizes.iter().all(|&s| s == max) {
        return Ok(gathered);
    }
    let pieces = sizes
        .iter()
        .enumerate()
        .map(|(rank, &size)| gathered.narrow(dim, rank * max, size))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&pieces, dim)?)
}

/// All-gather equal-sized shards and return them split per rank.
pub fn gather_shards(
    comm: &dyn DeviceCommunicator,
    tensor: &Tensor,
    dim: usize,
) -> Result<Vec<Tensor>> {
    let world_size = comm.process_group().world_size();
    let gathered = comm.all_gather(&tensor.contiguous()?, dim)?;
    Ok(split_even(&gathered, dim, world_size)?)
}
