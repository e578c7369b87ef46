//! Parallelism configuration document.
//!
//! The document mirrors the sections a training script hands to the
//! parallelism layer:
//!
//! ```json
//! {
//!   "model_parallelism": { "enable": true, "tensor_parallel_size": 2 },
//!   "kernel_fusion": { "enable": false, "memory_efficient_fusion": false },
//!   "activation_checkpointing": { "enable": false }
//! }
//! ```
//!
//! Every section is optional. Only the feature combinations matter to the
//! tensor-parallel engines, which call [`ParallelismConfig::validate`]
//! before touching a model.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating a [`ParallelismConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`memory_efficient_fusion` is not compatible with model parallelism")]
    MemoryEfficientFusionWithModelParallelism,
    #[error("`memory_efficient_fusion` is not compatible with activation checkpointing")]
    MemoryEfficientFusionWithActivationCheckpointing,
    #[error("{name} must be > 0")]
    ZeroParallelSize { name: &'static str },
    #[error("model parallelism is disabled in the configuration")]
    ModelParallelismDisabled,
    #[error("tensor_parallel_size is {configured} but the process group has world_size {world_size}")]
    WorldSizeMismatch {
        configured: usize,
        world_size: usize,
    },
    #[error("failed to parse parallelism config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_size() -> usize {
    1
}

/// `model_parallelism` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParallelismConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_size")]
    pub tensor_parallel_size: usize,
    #[serde(default = "default_size")]
    pub pipeline_parallel_size: usize,
}

impl Default for ModelParallelismConfig {
    fn default() -> Self {
        Self {
            enable: false,
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
        }
    }
}

/// `kernel_fusion` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelFusionConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub memory_efficient_fusion: bool,
}

/// `activation_checkpointing` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationCheckpointingConfig {
    #[serde(default)]
    pub enable: bool,
}

/// Feature switches of the parallelism layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelismConfig {
    #[serde(default)]
    pub model_parallelism: ModelParallelismConfig,
    #[serde(default)]
    pub kernel_fusion: KernelFusionConfig,
    #[serde(default)]
    pub activation_checkpointing: ActivationCheckpointingConfig,
}

impl ParallelismConfig {
    /// Config with tensor parallelism of the given size and nothing else.
    pub fn tensor_parallel(size: usize) -> Self {
        Self {
            model_parallelism: ModelParallelismConfig {
                enable: true,
                tensor_parallel_size: size,
                pipeline_parallel_size: 1,
            },
            ..Self::default()
        }
    }

    /// Parse a config document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a config document from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Whether memory-efficient kernel fusion is requested.
    pub fn memory_efficient_fusion(&self) -> bool {
        self.kernel_fusion.enable && self.kernel_fusion.memory_efficient_fusion
    }

    /// Reject incompatible feature combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mp = &self.model_parallelism;
        if mp.tensor_parallel_size == 0 {
            return Err(ConfigError::ZeroParallelSize {
                name: "tensor_parallel_size",
            });
        }
        if mp.pipeline_parallel_size == 0 {
            return Err(ConfigError::ZeroParallelSize {
                name: "pipeline_parallel_size",
            });
        }
        if self.memory_efficient_fusion() {
            if mp.enable {
                return Err(ConfigError::MemoryEfficientFusionWithModelParallelism);
            }
            if self.activation_checkpointing.enable {
                return Err(ConfigError::MemoryEfficientFusionWithActivationCheckpointing);
            }
        }
        Ok(())
    }

    /// Validate and check that the document describes a tensor-parallel
    /// group of `world_size` ranks.
    pub fn validate_for_world_size(&self, world_size: usize) -> Result<(), ConfigError> {
        self.validate()?;
        let mp = &self.model_parallelism;
        if !mp.enable {
            return Err(ConfigError::ModelParallelismDisabled);
        }
        if mp.tensor_parallel_size != world_size {
            return Err(ConfigError::WorldSizeMismatch {
                configured: mp.tensor_parallel_size,
                world_size,
            });
        }
        Ok(())
    }
}
