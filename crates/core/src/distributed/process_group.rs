//! Process group abstractions for tensor-parallel execution.
//!
//! A process group represents the set of ranks that share one
//! tensor-parallel dimension. Each rank owns exactly one shard of every
//! partitioned parameter.

/// Sizes of the parallel dimensions a rank participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Number of ranks sharing each tensor-parallel layer.
    pub tensor_parallel_size: usize,
    /// Number of pipeline stages.
    pub pipeline_parallel_size: usize,
    /// Number of data-parallel replicas.
    pub data_parallel_size: usize,
}

impl ParallelConfig {
    /// Create a new parallel configuration.
    ///
    /// # Panics
    /// Panics if any size is 0.
    pub fn new(
        tensor_parallel_size: usize,
        pipeline_parallel_size: usize,
        data_parallel_size: usize,
    ) -> Self {
        assert!(tensor_parallel_size > 0, "tensor_parallel_size must be > 0");
        assert!(
            pipeline_parallel_size > 0,
            "pipeline_parallel_size must be > 0"
        );
        assert!(data_parallel_size > 0, "data_parallel_size must be > 0");
        Self {
            tensor_parallel_size,
            pipeline_parallel_size,
            data_parallel_size,
        }
    }

    /// No parallelism (single device).
    pub fn no_parallelism() -> Self {
        Self::new(1, 1, 1)
    }

    /// Tensor parallelism only.
    pub fn tensor_parallel(size: usize) -> Self {
        Self::new(size, 1, 1)
    }

    /// Total number of ranks across all dimensions.
    pub fn world_size(&self) -> usize {
        self.tensor_parallel_size * self.pipeline_parallel_size * self.data_parallel_size
    }

    /// Whether this is effectively single-device execution.
    pub fn is_single_gpu(&self) -> bool {
        self.world_size() == 1
    }

    /// Global rank for a (tensor, pipeline, data) coordinate.
    ///
    /// The tensor-parallel rank varies fastest so that the ranks of one
    /// tensor-parallel group sit on neighbouring devices.
    pub fn global_rank(&self, tp_rank: usize, pp_rank: usize, dp_rank: usize) -> usize {
        dp_rank * self.tensor_parallel_size * self.pipeline_parallel_size
            + pp_rank * self.tensor_parallel_size
            + tp_rank
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self::no_parallelism()
    }
}

/// Trait for process group operations.
///
/// A process group manages rank assignment and provides the foundation
/// for collective communications.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this process within the tensor-parallel group (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of processes in the tensor-parallel group.
    fn world_size(&self) -> usize;

    /// Local rank on this node (for multi-node setups).
    fn local_rank(&self) -> usize;

    /// Sizes of every parallel dimension this group is embedded in.
    fn parallel_config(&self) -> ParallelConfig {
        ParallelConfig::tensor_parallel(self.world_size())
    }

    /// Whether this is the coordinator (rank 0).
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Whether this is a single-process group.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Process group with a fixed rank and world size.
///
/// `new()` is the single-device group; `with_rank` describes one member of a
/// larger group, for example when the collectives are provided elsewhere.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    /// Create a new local process group (single device).
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Create a process group with specific rank/size.
    pub fn with_rank(rank: usize, world_size: usize) -> Self {
        assert!(rank < world_size, "rank must be < world_size");
        Self { rank, world_size }
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn local_rank(&self) -> usize {
        self.rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_config_defaults() {
        let cfg = ParallelConfig::default();
        assert_eq!(cfg.tensor_parallel_size, 1);
        assert_eq!(cfg.pipeline_parallel_size, 1);
        assert_eq!(cfg.data_parallel_size, 1);
        assert!(cfg.is_single_gpu());
    }

    #[test]
    #[should_panic(expected = "tensor_parallel_size must be > 0")]
    fn parallel_config_zero_tp_panics() {
        ParallelConfig::new(0, 1, 1);
    }

    #[test]
    #[should_panic(expected = "data_parallel_size must be > 0")]
    fn parallel_config_zero_dp_panics() {
        ParallelConfig::new(1, 1, 0);
    }

    #[test]
    fn global_rank_tensor_parallel_fastest() {
        let cfg = ParallelConfig::new(2, 3, 2);
        assert_eq!(cfg.world_size(), 12);
        assert_eq!(cfg.global_rank(0, 0, 0), 0);
        assert_eq!(cfg.global_rank(1, 0, 0), 1);
        assert_eq!(cfg.global_rank(0, 1, 0), 2);
        assert_eq!(cfg.global_rank(1, 2, 0), 5);
        assert_eq!(cfg.global_rank(0, 0, 1), 6);
        assert_eq!(cfg.global_rank(1, 2, 1), 11);
    }

    #[test]
    fn local_pg_is_coordinator() {
        let pg = LocalProcessGroup::new();
        assert!(pg.is_coordinator());
        assert!(pg.is_single());
        assert_eq!(pg.parallel_config(), ParallelConfig::no_parallelism());
    }

    #[test]
    fn local_pg_with_rank() {
        let pg = LocalProcessGroup::with_rank(2, 4);
        assert_eq!(pg.rank(), 2);
        assert_eq!(pg.world_size(), 4);
        assert!(!pg.is_coordinator());
        assert!(!pg.is_single());
    }

    #[test]
    #[should_panic(expected = "rank must be < world_size")]
    fn local_pg_invalid_rank_panics() {
        LocalProcessGroup::with_rank(5, 4);
    }
}
