//! Error types for the tensor-parallel engines.

use thiserror::Error;

use super::mapping::ParallelKind;
use crate::config::ConfigError;
use crate::distributed::DistributedError;
use crate::model::ModuleKind;

/// Problems with a mapping document or table lookup.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("no tensor parallel mapping for architecture `{0}`")]
    UnknownArchitecture(String),
    #[error("mapping for `{architecture}` has no rules")]
    EmptyTable { architecture: String },
    #[error("mapping for `{architecture}`: rule {index} has an empty pattern")]
    EmptyPattern { architecture: String, index: usize },
    #[error("mapping for `{architecture}`: rule `{pattern}` has fusion degree 0")]
    ZeroFusion {
        architecture: String,
        pattern: String,
    },
    #[error("mapping for `{architecture}`: row-parallel rule `{pattern}` cannot be fused")]
    FusedRowRule {
        architecture: String,
        pattern: String,
    },
    #[error("`{module}` is sharded as {sharded:?} but mapped as {mapped:?}")]
    Inconsistent {
        module: String,
        sharded: ParallelKind,
        mapped: ParallelKind,
    },
    #[error("fusion degree of `{module}`: {reason}")]
    FusionDegree { module: String, reason: String },
    #[error("failed to parse mapping document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by parallelize, deparallelize, placement and the sharded
/// layer forwards.
#[derive(Debug, Error)]
pub enum TensorParallelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("model `{architecture}` has no input embedding accessor")]
    MissingInputEmbeddings { architecture: String },

    #[error("`{module}` is {kind:?}, expected an embedding")]
    NotAnEmbedding { module: String, kind: ModuleKind },

    #[error("`{module}` is {kind:?} and cannot be sharded as a linear layer")]
    NotShardable { module: String, kind: ModuleKind },

    #[error("`{module}` has no weight")]
    MissingWeight { module: String },

    #[error("model is already tensor parallel (world_size {world_size})")]
    AlreadyParallelized { world_size: usize },

    #[error("model is not tensor parallel")]
    NotParallelized,

    #[error("model was sharded over {sharded} ranks but the communicator has {world_size}")]
    WorldSizeMismatch { sharded: usize, world_size: usize },

    #[error("`{module}`: {what} of size {size} is not divisible into {chunks} chunks")]
    Indivisible {
        module: String,
        what: String,
        size: usize,
        chunks: usize,
    },

    #[error("cannot split {num_embeddings} embeddings over {world_size} ranks without an empty shard")]
    EmptyShard {
        num_embeddings: usize,
        world_size: usize,
    },

    #[error("{kind:?} module has no forward computation")]
    NoForward { kind: ModuleKind },

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, TensorParallelError>;
