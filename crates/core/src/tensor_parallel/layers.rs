//! Behaviour variants of sharded modules.
//!
//! A module keeps its node in the model tree when it is sharded; only its
//! tensors and its [`LayerVariant`] change. The variant decides which
//! collective the forward pass runs:
//!
//! # Column Parallel
//! Weight sliced along the output features. Broadcasts the input from rank
//! 0, computes the local output slice and optionally all-gathers it. A
//! gathered module holds its full bias and adds it after the gather; an
//! ungathered one adds its bias slice locally.
//!
//! # Row Parallel
//! Weight sliced along the input features. Consumes the local input slice
//! (typically a column-parallel output) and all-reduces the partial sums;
//! the unsliced bias is added once after the reduction.
//!
//! # Vocab Parallel
//! Embedding rows `[start, end)` of the vocabulary. Ids outside the range
//! look up row 0 and are zeroed, and an all-reduce sums the shards.

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Tensor};
use candle_nn::Module;

use super::error::{Result, TensorParallelError};
use super::slicing::{gather_uneven, VocabPartition};
use crate::distributed::{DeviceCommunicator, ReduceOp};
use crate::model::{ModuleKind, ModuleNode};

/// Column-parallel state.
#[derive(Clone)]
pub struct ColumnParallel {
    pub comm: Arc<dyn DeviceCommunicator>,
    /// Weight stored as `[in, out]`.
    pub reversed: bool,
    pub fusion_degree: usize,
    pub orig_kind: ModuleKind,
    /// All-gather the output slices into the full output width.
    pub gather_output: bool,
    /// Output width held by each rank, in rank order.
    pub out_sizes: Vec<usize>,
}

/// Row-parallel state.
#[derive(Clone)]
pub struct RowParallel {
    pub comm: Arc<dyn DeviceCommunicator>,
    pub reversed: bool,
    pub fusion_degree: usize,
    pub orig_kind: ModuleKind,
}

/// Vocab-parallel embedding state.
#[derive(Clone)]
pub struct VocabParallel {
    pub comm: Arc<dyn DeviceCommunicator>,
    pub orig_kind: ModuleKind,
    pub partition: VocabPartition,
}

impl VocabParallel {
    /// Vocabulary rows held by this rank.
    pub fn vocab_range(&self) -> std::ops::Range<usize> {
        self.partition.range(self.comm.process_group().rank())
    }
}

/// Forward behaviour of a module.
#[derive(Clone, Default)]
pub enum LayerVariant {
    /// Unsharded behaviour of the module's kind.
    #[default]
    Plain,
    ColumnParallel(ColumnParallel),
    RowParallel(RowParallel),
    VocabParallel(VocabParallel),
}

impl fmt::Debug for LayerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerVariant::Plain => f.write_str("Plain"),
            LayerVariant::ColumnParallel(c) => f
                .debug_struct("ColumnParallel")
                .field("rank", &c.comm.process_group().rank())
                .field("reversed", &c.reversed)
                .field("fusion_degree", &c.fusion_degree)
                .field("gather_output", &c.gather_output)
                .finish_non_exhaustive(),
            LayerVariant::RowParallel(r) => f
                .debug_struct("RowParallel")
                .field("rank", &r.comm.process_group().rank())
                .field("reversed", &r.reversed)
                .finish_non_exhaustive(),
            LayerVariant::VocabParallel(v) => f
                .debug_struct("VocabParallel")
                .field("range", &v.vocab_range())
                .finish_non_exhaustive(),
        }
    }
}

impl LayerVariant {
    pub fn is_parallel(&self) -> bool {
        !matches!(self, LayerVariant::Plain)
    }

    /// Module kind to restore when the shard is undone.
    pub fn orig_kind(&self) -> Option<ModuleKind> {
        match self {
            LayerVariant::Plain => None,
            LayerVariant::ColumnParallel(c) => Some(c.orig_kind),
            LayerVariant::RowParallel(r) => Some(r.orig_kind),
            LayerVariant::VocabParallel(v) => Some(v.orig_kind),
        }
    }

    pub fn forward(&self, node: &ModuleNode, input: &Tensor) -> Result<Tensor> {
        match self {
            LayerVariant::Plain => plain_forward(node, input),
            LayerVariant::ColumnParallel(column) => column.forward(node, input),
            LayerVariant::RowParallel(row) => row.forward(node, input),
            LayerVariant::VocabParallel(vocab) => vocab.forward(node, input),
        }
    }
}

fn weight(node: &ModuleNode) -> Result<&Tensor> {
    node.weight
        .as_ref()
        .map(|p| &p.tensor)
        .ok_or(TensorParallelError::NoForward { kind: node.kind })
}

fn bias(node: &ModuleNode) -> Option<&Tensor> {
    node.bias.as_ref().map(|p| &p.tensor)
}

/// `input @ W^T`, or `input @ W` for a transposed layout, over the last
/// input dimension.
fn linear_matmul(input: &Tensor, weight: &Tensor, transposed: bool) -> Result<Tensor> {
    let dims = input.dims();
    let in_features = *dims.last().ok_or_else(|| {
        TensorParallelError::Tensor(candle_core::Error::Msg(
            "Tensor must have at least 1 dimension".to_string(),
        ))
    })?;
    let batch: usize = dims[..dims.len() - 1].iter().product();
    let flat = input.reshape((batch, in_features))?;
    let out = if transposed {
        flat.matmul(weight)?
    } else {
        flat.matmul(&weight.t()?)?
    };
    Ok(out)
}

/// Restore the leading input dimensions on a `[batch, out]` output.
fn unflatten(output: Tensor, input: &Tensor) -> Result<Tensor> {
    let dims = input.dims();
    let mut shape = dims[..dims.len().saturating_sub(1)].to_vec();
    shape.push(output.dim(1)?);
    Ok(output.reshape(shape)?)
}

fn plain_forward(node: &ModuleNode, input: &Tensor) -> Result<Tensor> {
    match node.kind {
        ModuleKind::Linear => {
            let linear = candle_nn::Linear::new(weight(node)?.clone(), bias(node).cloned());
            Ok(linear.forward(input)?)
        }
        ModuleKind::Conv1D => {
            let mut out = linear_matmul(input, weight(node)?, true)?;
            if let Some(b) = bias(node) {
                out = out.broadcast_add(b)?;
            }
            unflatten(out, input)
        }
        ModuleKind::Embedding => {
            let w = weight(node)?;
            let hidden = w.dim(1)?;
            Ok(candle_nn::Embedding::new(w.clone(), hidden).forward(input)?)
        }
        ModuleKind::Other => Err(TensorParallelError::NoForward { kind: node.kind }),
    }
}

impl ColumnParallel {
    fn forward(&self, node: &ModuleNode, input: &Tensor) -> Result<Tensor> {
        let input = self.comm.broadcast(input, 0)?;
        let mut out = linear_matmul(&input, weight(node)?, self.reversed)?;
        // A gathered module keeps its bias at full output width.
        if self.gather_output {
            out = gather_uneven(self.comm.as_ref(), &out, 1, &self.out_sizes)?;
        }
        if let Some(b) = bias(node) {
            out = out.broadcast_add(b)?;
        }
        unflatten(out, &input)
    }
}

impl RowParallel {
    fn forward(&self, node: &ModuleNode, input: &Tensor) -> Result<Tensor> {
        let out = linear_matmul(input, weight(node)?, self.reversed)?;
        let mut out = self.comm.all_reduce(&out, ReduceOp::Sum)?;
        if let Some(b) = bias(node) {
            out = out.broadcast_add(b)?;
        }
        unflatten(out, input)
    }
}

impl VocabParallel {
    fn forward(&self, node: &ModuleNode, input_ids: &Tensor) -> Result<Tensor> {
        let table = weight(node)?;
        let device = table.device();
        let hidden_size = table.dim(1)?;

        let mut out_shape = input_ids.dims().to_vec();
        out_shape.push(hidden_size);
        let flat_ids = input_ids.flatten_all()?;

        if self.partition.world_size() == 1 {
            let output = table.embedding(&flat_ids)?;
            return Ok(output.reshape(out_shape)?);
        }

        let range = self.vocab_range();
        let ids = flat_ids.to_dtype(DType::I64)?;
        let start = Tensor::new(&[range.start as i64], device)?.broadcast_as(ids.shape())?;
        let end = Tensor::new(&[range.end as i64], device)?.broadcast_as(ids.shape())?;

        // 1 where the id falls in [start, end)
        let mask = ids.ge(&start)?.mul(&ids.lt(&end)?)?;

        // out-of-range ids look up local row 0
        let local_ids = ids
            .sub(&start)?
            .mul(&mask.to_dtype(DType::I64)?)?
            .to_dtype(DType::U32)?;
        let rows = table.embedding(&local_ids)?;
        let rows = rows.broadcast_mul(&mask.to_dtype(table.dtype())?.unsqueeze(1)?)?;

        let output = self.comm.all_reduce(&rows, ReduceOp::Sum)?;
        Ok(output.reshape(out_shape)?)
    }
}
