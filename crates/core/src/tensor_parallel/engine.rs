//! Parallelize: shard a model in place for one tensor-parallel rank.
//!
//! Runs in two passes. The planning pass performs every lookup, check and
//! tensor slice without touching the model; only if it succeeds does the
//! commit pass install the shards, shrink the rescaled attributes, swap
//! layer variants and tag every parameter and buffer with its rank.

use std::sync::Arc;

use candle_core::Tensor;
use tracing::{debug, info};

use super::error::{Result, TensorParallelError};
use super::layers::{ColumnParallel, LayerVariant, RowParallel, VocabParallel};
use super::mapping::{ParallelKind, TensorParallelMapping};
use super::slicing::{shard_tensor, slice_dim, VocabPartition};
use crate::config::ParallelismConfig;
use crate::distributed::DeviceCommunicator;
use crate::model::{Attr, Model, ModuleKind, ModuleNode, Param, ShardDescriptor, TensorParallelState};

/// Shards models for the rank of its communicator.
pub struct TensorParallelEngine {
    comm: Arc<dyn DeviceCommunicator>,
    mapping: TensorParallelMapping,
    config: ParallelismConfig,
}

/// Everything the commit pass needs, computed up front.
struct Plan {
    rescale: Vec<Attr>,
    embedding: EmbeddingShard,
    modules: Vec<ModuleShard>,
}

struct EmbeddingShard {
    path: String,
    partition: VocabPartition,
    weight: Tensor,
    tied: Vec<TiedModule>,
}

struct TiedModule {
    name: String,
    reversed: bool,
}

struct ModuleShard {
    name: String,
    parallel: ParallelKind,
    reversed: bool,
    fusion_degree: usize,
    weight: Tensor,
    /// Replacement bias; `None` keeps the current one.
    bias: Option<Tensor>,
    out_sizes: Vec<usize>,
}

impl TensorParallelEngine {
    pub fn new(
        comm: Arc<dyn DeviceCommunicator>,
        mapping: TensorParallelMapping,
        config: ParallelismConfig,
    ) -> Self {
        Self {
            comm,
            mapping,
            config,
        }
    }

    /// Engine whose config enables tensor parallelism over the
    /// communicator's world size and nothing else.
    pub fn with_defaults(comm: Arc<dyn DeviceCommunicator>, mapping: TensorParallelMapping) -> Self {
        let world_size = comm.process_group().world_size();
        Self::new(comm, mapping, ParallelismConfig::tensor_parallel(world_size))
    }

    fn world_size(&self) -> usize {
        self.comm.process_group().world_size()
    }

    fn rank(&self) -> usize {
        self.comm.process_group().rank()
    }

    /// Shard `model` in place. On error the model is left untouched.
    pub fn parallelize(&self, model: &mut Model) -> Result<()> {
        let world_size = self.world_size();
        let rank = self.rank();
        info!(
            architecture = %model.architecture,
            world_size,
            rank,
            "Parallelizing model"
        );

        let plan = self.plan(model)?;
        self.commit(model, plan);

        info!(architecture = %model.architecture, rank, "Model parallelized");
        Ok(())
    }

    fn plan(&self, model: &Model) -> Result<Plan> {
        let world_size = self.world_size();
        let rank = self.rank();

        self.config.validate_for_world_size(world_size)?;
        if let Some(state) = model.tensor_parallel {
            return Err(TensorParallelError::AlreadyParallelized {
                world_size: state.world_size,
            });
        }

        let rescale = self.mapping.attrs_to_rescale(model)?.to_vec();
        for (name, node) in model.named_modules() {
            for &attr in &rescale {
                if let Some(value) = node.config.get(attr) {
                    check_divisible(&name, attr.as_str(), value, world_size)?;
                }
            }
        }

        let embedding = self.plan_embedding(model, world_size, rank)?;

        let mut modules = Vec::new();
        for (name, node) in model.named_modules() {
            if name == embedding.path || embedding.tied.iter().any(|t| t.name == name) {
                continue;
            }
            let parallel = self.mapping.classify(model, &name)?;
            if parallel == ParallelKind::None {
                continue;
            }
            modules.push(self.plan_module(model, &name, node, parallel, world_size, rank)?);
        }

        Ok(Plan {
            rescale,
            embedding,
            modules,
        })
    }

    fn plan_embedding(&self, model: &Model, world_size: usize, rank: usize) -> Result<EmbeddingShard> {
        let missing = || TensorParallelError::MissingInputEmbeddings {
            architecture: model.architecture.clone(),
        };
        let path = model.input_embeddings_path().ok_or_else(missing)?;
        let node = model.input_embeddings().ok_or_else(missing)?;
        if node.kind != ModuleKind::Embedding {
            return Err(TensorParallelError::NotAnEmbedding {
                module: path.to_string(),
                kind: node.kind,
            });
        }
        let table = &node
            .weight
            .as_ref()
            .ok_or_else(|| TensorParallelError::MissingWeight {
                module: path.to_string(),
            })?
            .tensor;
        let (num_embeddings, _) = table.dims2()?;
        let partition = VocabPartition::new(num_embeddings, world_size)?;
        let range = partition.range(rank);
        let weight = table.narrow(0, range.start, range.len())?.contiguous()?;

        let mut tied = Vec::new();
        for name in model.tied_modules(path) {
            tied.push(TiedModule {
                reversed: self.mapping.is_reversed(model, &name)?,
                name,
            });
        }

        Ok(EmbeddingShard {
            path: path.to_string(),
            partition,
            weight,
            tied,
        })
    }

    fn plan_module(
        &self,
        model: &Model,
        name: &str,
        node: &ModuleNode,
        parallel: ParallelKind,
        world_size: usize,
        rank: usize,
    ) -> Result<ModuleShard> {
        if !node.kind.is_linear() {
            return Err(TensorParallelError::NotShardable {
                module: name.to_string(),
                kind: node.kind,
            });
        }
        let weight = &node
            .weight
            .as_ref()
            .ok_or_else(|| TensorParallelError::MissingWeight {
                module: name.to_string(),
            })?
            .tensor;
        weight.dims2()?;

        let reversed = self.mapping.is_reversed(model, name)?;
        let fusion_degree = match parallel {
            ParallelKind::Column => self.mapping.fusion_degree(model, name, node)?,
            _ => 1,
        };
        let chunks = fusion_degree * world_size;
        let dim = slice_dim(parallel, reversed);
        check_divisible(name, "weight", weight.dim(dim)?, chunks)?;
        let sharded_weight = shard_tensor(weight, dim, fusion_degree, world_size, rank)?;

        let bias = match (parallel, &node.bias) {
            (ParallelKind::Column, Some(bias)) => {
                check_divisible(name, "bias", bias.tensor.dim(0)?, chunks)?;
                Some(shard_tensor(&bias.tensor, 0, fusion_degree, world_size, rank)?)
            }
            _ => None,
        };

        let out_width = sharded_weight.dim(usize::from(reversed))?;
        debug!(
            module = name,
            ?parallel,
            reversed,
            fusion_degree,
            dim,
            "Planned module shard"
        );
        Ok(ModuleShard {
            name: name.to_string(),
            parallel,
            reversed,
            fusion_degree,
            weight: sharded_weight,
            bias,
            out_sizes: vec![out_width; world_size],
        })
    }

    fn commit(&self, model: &mut Model, plan: Plan) {
        let world_size = self.world_size();
        let rank = self.rank();
        let descriptor = ShardDescriptor::tensor_parallel(rank);

        model.root.visit_mut(&mut |_, node| {
            for &attr in &plan.rescale {
                if let Some(value) = node.config.get(attr) {
                    node.config.set(attr, value / world_size);
                }
            }
        });

        let EmbeddingShard {
            path,
            partition,
            weight,
            tied,
        } = plan.embedding;
        if let Some(node) = model.module_mut(&path) {
            node.weight = Some(Param {
                tensor: weight.clone(),
                shard: Some(descriptor),
            });
            node.variant = LayerVariant::VocabParallel(VocabParallel {
                comm: self.comm.clone(),
                orig_kind: node.kind,
                partition,
            });
            refresh_features(node);
            debug!(module = %path, range = ?partition.range(rank), "Sharded input embedding");
        }
        // Tied heads keep their bias whole; it is added after the gather.
        for TiedModule { name, reversed } in tied {
            if let Some(node) = model.module_mut(&name) {
                node.weight = Some(Param {
                    tensor: weight.clone(),
                    shard: Some(descriptor),
                });
                node.variant = LayerVariant::ColumnParallel(ColumnParallel {
                    comm: self.comm.clone(),
                    reversed,
                    fusion_degree: 1,
                    orig_kind: node.kind,
                    gather_output: true,
                    out_sizes: partition.sizes(),
                });
                refresh_features(node);
                debug!(module = %name, "Tied output projection to sharded embedding");
            }
        }

        for shard in plan.modules {
            let Some(node) = model.module_mut(&shard.name) else {
                continue;
            };
            node.weight = Some(Param {
                tensor: shard.weight,
                shard: Some(descriptor),
            });
            if let Some(bias) = shard.bias {
                node.bias = Some(Param {
                    tensor: bias,
                    shard: Some(descriptor),
                });
            }
            node.variant = match shard.parallel {
                ParallelKind::Row => LayerVariant::RowParallel(RowParallel {
                    comm: self.comm.clone(),
                    reversed: shard.reversed,
                    fusion_degree: shard.fusion_degree,
                    orig_kind: node.kind,
                }),
                _ => LayerVariant::ColumnParallel(ColumnParallel {
                    comm: self.comm.clone(),
                    reversed: shard.reversed,
                    fusion_degree: shard.fusion_degree,
                    orig_kind: node.kind,
                    gather_output: false,
                    out_sizes: shard.out_sizes,
                }),
            };
            refresh_features(node);
        }

        model.root.visit_mut(&mut |_, node| {
            for param in node.params_mut() {
                if param.shard.is_none() {
                    param.shard = Some(descriptor);
                }
            }
        });
        model.tensor_parallel = Some(TensorParallelState { world_size, rank });
    }
}

fn check_divisible(module: &str, what: &str, size: usize, chunks: usize) -> Result<()> {
    if size % chunks != 0 {
        return Err(TensorParallelError::Indivisible {
            module: module.to_string(),
            what: what.to_string(),
            size,
            chunks,
        });
    }
    Ok(())
}

/// Recompute the feature attributes a module already carries from the
/// shape of its current weight.
pub(crate) fn refresh_features(node: &mut ModuleNode) {
    let Some(&[rows, cols]) = node.weight.as_ref().map(Param::dims) else {
        return;
    };
    let updates: &[(Attr, usize)] = match node.kind {
        ModuleKind::Linear => &[(Attr::OutFeatures, rows), (Attr::InFeatures, cols)],
        ModuleKind::Conv1D => &[
            (Attr::Nx, rows),
            (Attr::Nf, cols),
            (Attr::InFeatures, rows),
            (Attr::OutFeatures, cols),
        ],
        ModuleKind::Embedding => &[(Attr::NumEmbeddings, rows), (Attr::EmbeddingDim, cols)],
        ModuleKind::Other => &[],
    };
    node.config.update(updates);
}
