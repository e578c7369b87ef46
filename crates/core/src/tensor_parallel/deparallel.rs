//! Deparallelize: gather every shard back into the full tensors.
//!
//! All collectives run first, in module pre-order, so every rank issues the
//! same sequence; the model is only mutated once every gather succeeded.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use super::engine::refresh_features;
use super::error::{MappingError, Result, TensorParallelError};
use super::layers::LayerVariant;
use super::mapping::{ParallelKind, TensorParallelMapping};
use super::slicing::{gather_shards, gather_uneven, reconstruct, slice_dim, VocabPartition};
use crate::distributed::DeviceCommunicator;
use crate::model::{Attr, Model, ModuleKind, Param};

/// Reassembles models sharded by [`TensorParallelEngine`](super::TensorParallelEngine).
pub struct TensorDeparallelEngine {
    comm: Arc<dyn DeviceCommunicator>,
    mapping: TensorParallelMapping,
}

struct GatheredEmbedding {
    path: String,
    num_embeddings: usize,
    weight: Tensor,
    tied: Vec<String>,
}

struct GatheredModule {
    name: String,
    orig_kind: ModuleKind,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl TensorDeparallelEngine {
    pub fn new(comm: Arc<dyn DeviceCommunicator>, mapping: TensorParallelMapping) -> Self {
        Self { comm, mapping }
    }

    /// Restore the unsharded model in place. On error the model is left
    /// untouched.
    pub fn deparallelize(&self, model: &mut Model) -> Result<()> {
        let world_size = self.comm.process_group().world_size();
        let state = model
            .tensor_parallel
            .ok_or(TensorParallelError::NotParallelized)?;
        if state.world_size != world_size {
            return Err(TensorParallelError::WorldSizeMismatch {
                sharded: state.world_size,
                world_size,
            });
        }
        info!(
            architecture = %model.architecture,
            world_size,
            rank = state.rank,
            "Deparallelizing model"
        );

        let rescale = self.mapping.attrs_to_rescale(model)?.to_vec();
        let embedding = self.gather_embedding(model)?;
        let modules = self.gather_modules(model, &embedding)?;

        model.root.visit_mut(&mut |_, node| {
            for &attr in &rescale {
                if let Some(value) = node.config.get(attr) {
                    node.config.set(attr, value * world_size);
                }
            }
        });

        if let Some(node) = model.module_mut(&embedding.path) {
            node.weight = Some(Param::new(embedding.weight.clone()));
            restore(node);
            node.config.set(Attr::NumEmbeddings, embedding.num_embeddings);
        }
        for name in &embedding.tied {
            if let Some(node) = model.module_mut(name) {
                node.weight = Some(Param::new(embedding.weight.clone()));
                restore(node);
            }
        }
        for gathered in modules {
            let Some(node) = model.module_mut(&gathered.name) else {
                continue;
            };
            node.weight = Some(Param::new(gathered.weight));
            if let Some(bias) = gathered.bias {
                node.bias = Some(Param::new(bias));
            }
            node.kind = gathered.orig_kind;
            restore(node);
        }

        model.root.visit_mut(&mut |_, node| {
            for param in node.params_mut() {
                param.shard = None;
            }
        });
        model.tensor_parallel = None;

        info!(architecture = %model.architecture, "Model deparallelized");
        Ok(())
    }

    fn gather_embedding(&self, model: &Model) -> Result<GatheredEmbedding> {
        let path = model
            .input_embeddings_path()
            .ok_or_else(|| TensorParallelError::MissingInputEmbeddings {
                architecture: model.architecture.clone(),
            })?;
        let node = model
            .input_embeddings()
            .ok_or_else(|| TensorParallelError::MissingInputEmbeddings {
                architecture: model.architecture.clone(),
            })?;
        let LayerVariant::VocabParallel(vocab) = &node.variant else {
            return Err(TensorParallelError::NotAnEmbedding {
                module: path.to_string(),
                kind: node.kind,
            });
        };
        let partition: VocabPartition = vocab.partition;
        let shard = weight_of(path, node.weight.as_ref())?;

        let weight = self.on_comm_device(shard, |t| {
            gather_uneven(self.comm.as_ref(), t, 0, &partition.sizes())
        })?;
        debug!(module = path, rows = partition.num_embeddings(), "Gathered input embedding");

        Ok(GatheredEmbedding {
            path: path.to_string(),
            num_embeddings: partition.num_embeddings(),
            weight,
            tied: model.tied_modules(path),
        })
    }

    fn gather_modules(
        &self,
        model: &Model,
        embedding: &GatheredEmbedding,
    ) -> Result<Vec<GatheredModule>> {
        let mut gathered = Vec::new();
        for (name, node) in model.named_modules() {
            if name == embedding.path || embedding.tied.contains(&name) {
                continue;
            }
            let (parallel, reversed, fusion_degree, orig_kind) = match &node.variant {
                LayerVariant::ColumnParallel(c) => {
                    (ParallelKind::Column, c.reversed, c.fusion_degree, c.orig_kind)
                }
                LayerVariant::RowParallel(r) => {
                    (ParallelKind::Row, r.reversed, r.fusion_degree, r.orig_kind)
                }
                _ => continue,
            };
            let mapped = self.mapping.classify(model, &name)?;
            if mapped != parallel {
                return Err(MappingError::Inconsistent {
                    module: name,
                    sharded: parallel,
                    mapped,
                }
                .into());
            }

            let dim = slice_dim(parallel, reversed);
            let shard = weight_of(&name, node.weight.as_ref())?;
            let weight = self.on_comm_device(shard, |t| {
                let shards = gather_shards(self.comm.as_ref(), t, dim)?;
                Ok(reconstruct(&shards, fusion_degree, dim)?)
            })?;

            let bias = match (&node.bias, parallel) {
                (Some(bias), ParallelKind::Column) => Some(self.on_comm_device(&bias.tensor, |t| {
                    let shards = gather_shards(self.comm.as_ref(), t, 0)?;
                    Ok(reconstruct(&shards, fusion_degree, 0)?)
                })?),
                _ => None,
            };

            debug!(
                module = %name,
                ?parallel,
                fusion_degree,
                dims = ?weight.dims(),
                "Gathered module"
            );
            gathered.push(GatheredModule {
                name,
                orig_kind,
                weight,
                bias,
            });
        }
        Ok(gathered)
    }

    /// Make `tensor` contiguous and resident on the communicator's device,
    /// run the collective `f`, and return the result to the original device.
    fn on_comm_device<F>(&self, tensor: &Tensor, f: F) -> Result<Tensor>
    where
        F: FnOnce(&Tensor) -> Result<Tensor>,
    {
        let home: Device = tensor.device().clone();
        let staged = tensor.contiguous()?.to_device(self.comm.device())?;
        let out = f(&staged)?;
        Ok(out.to_device(&home)?)
    }
}

fn weight_of<'a>(name: &str, param: Option<&'a Param>) -> Result<&'a Tensor> {
    param
        .map(|p| &p.tensor)
        .ok_or_else(|| TensorParallelError::MissingWeight {
            module: name.to_string(),
        })
}

/// Drop the sharded behaviour and recompute the feature attributes.
fn restore(node: &mut crate::model::ModuleNode) {
    if let Some(kind) = node.variant.orig_kind() {
        node.kind = kind;
    }
    node.variant = LayerVariant::Plain;
    refresh_features(node);
}
