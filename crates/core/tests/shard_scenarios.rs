//! Engine behaviour on hand-built models with custom mapping tables.

mod common;

use std::io::Write;
use std::sync::Arc;

use candle_core::{DType, Device, IndexOp, Tensor};
use tp_core::{
    config::ParallelismConfig,
    distributed::LocalCommunicator,
    model::{Attr, Model, ModuleNode},
    tensor_parallel::{
        deparallelize, parallelize, FusionDegree, LayerVariant, MappingRule, MappingTable,
        TensorDeparallelEngine, TensorParallelEngine, TensorParallelError, TensorParallelMapping,
    },
    testing::{max_abs_diff, run_ranks, tiny_gpt2},
};

use common::{init_tracing, snapshot};

const TOY: &str = "ToyModel";

fn counting(rows: usize, cols: usize) -> Tensor {
    Tensor::arange(0u32, (rows * cols) as u32, &Device::Cpu)
        .unwrap()
        .to_dtype(DType::F32)
        .unwrap()
        .reshape((rows, cols))
        .unwrap()
}

/// `embed` [4, 4], `block` (num_heads = heads) holding `proj` [rows, 4].
fn toy_model(rows: usize, heads: usize) -> Model {
    let block = ModuleNode::container()
        .with_attr(Attr::NumHeads, heads)
        .with_child("proj", ModuleNode::linear(counting(rows, 4), None).unwrap());
    let root = ModuleNode::container()
        .with_child("embed", ModuleNode::embedding(counting(4, 4)).unwrap())
        .with_child("block", block);
    Model::new(TOY, root).with_input_embeddings("embed")
}

fn toy_mapping(rule: MappingRule) -> TensorParallelMapping {
    let mut mapping = TensorParallelMapping::default();
    mapping
        .insert(
            TOY,
            MappingTable {
                rules: vec![rule],
                update_attrs: vec![Attr::NumHeads],
            },
        )
        .unwrap();
    mapping
}

fn rows_of(t: &Tensor) -> Vec<Vec<f32>> {
    t.to_vec2::<f32>().unwrap()
}

fn weight(model: &Model, name: &str) -> Tensor {
    model
        .module(name)
        .unwrap()
        .weight
        .as_ref()
        .unwrap()
        .tensor
        .clone()
}

/// `embed` [4, 4] with a `head` linear sharing its weight and carrying a
/// `[4]` bias.
fn toy_tied_biased_head() -> Model {
    let table = counting(4, 4);
    let bias = Tensor::new(&[0.5f32, -1.0, 2.0, 0.25], &Device::Cpu).unwrap();
    let root = ModuleNode::container()
        .with_child("embed", ModuleNode::embedding(table.clone()).unwrap())
        .with_child("head", ModuleNode::linear(table, Some(bias)).unwrap());
    Model::new(TOY, root).with_input_embeddings("embed")
}

// ─── Column Slicing ──────────────────────────────────────────────────────────

#[test]
fn column_linear_rank_slices() {
    init_tracing();
    let mapping = toy_mapping(MappingRule::column("proj"));
    let full = counting(8, 4);

    let models = run_ranks(2, |comm| {
        let mut model = toy_model(8, 2);
        parallelize(&mut model, comm, &mapping).unwrap();
        model
    });

    for (rank, model) in models.iter().enumerate() {
        let local = weight(model, "block.proj");
        assert_eq!(local.dims(), &[4, 4]);
        assert_eq!(
            rows_of(&local),
            rows_of(&full.i(rank * 4..rank * 4 + 4).unwrap())
        );
        let proj = model.module("block.proj").unwrap();
        assert_eq!(proj.config.out_features, Some(4));
        assert_eq!(proj.config.in_features, Some(4));
        assert!(matches!(proj.variant, LayerVariant::ColumnParallel(_)));
        assert_eq!(model.module("block").unwrap().config.num_heads, Some(1));
    }
}

#[test]
fn fused_column_regroups_chunks_per_rank() {
    let mapping = toy_mapping(MappingRule::column("proj").fused(FusionDegree::Fixed(3)));
    let full = counting(12, 4);

    let models = run_ranks(2, |comm| {
        let mut model = toy_model(12, 2);
        parallelize(&mut model, comm, &mapping).unwrap();
        model
    });

    // Six chunks of two rows; rank 0 owns {0, 2, 4}, rank 1 owns {1, 3, 5}.
    let chunk = |c: usize| rows_of(&full.i(c * 2..c * 2 + 2).unwrap());
    for (rank, model) in models.iter().enumerate() {
        let expected: Vec<Vec<f32>> = [rank, rank + 2, rank + 4]
            .into_iter()
            .flat_map(chunk)
            .collect();
        assert_eq!(rows_of(&weight(model, "block.proj")), expected, "rank {rank}");
    }
}

#[test]
fn fused_column_round_trips() {
    let mapping = toy_mapping(MappingRule::column("proj").fused(FusionDegree::Fixed(3)));
    let expected = snapshot(&toy_model(12, 2));

    let snapshots = run_ranks(2, |comm| {
        let mut model = toy_model(12, 2);
        parallelize(&mut model, comm.clone(), &mapping).unwrap();
        deparallelize(&mut model, comm, &mapping).unwrap();
        snapshot(&model)
    });
    for snap in snapshots {
        assert_eq!(snap, expected);
    }
}

#[test]
fn fusion_from_attribute() {
    // 12 output features over num_heads = 4 gives 3 fused projections.
    let mapping = toy_mapping(MappingRule::column("proj").fused(
        FusionDegree::OutFeaturesOver {
            out_features_over: Attr::NumHeads,
        },
    ));
    let full = counting(12, 4);

    let models = run_ranks(2, |comm| {
        let mut model = toy_model(12, 4);
        parallelize(&mut model, comm, &mapping).unwrap();
        model
    });
    let rank0 = rows_of(&weight(&models[0], "block.proj"));
    let expected: Vec<Vec<f32>> = [0, 2, 4]
        .into_iter()
        .flat_map(|c| rows_of(&full.i(c * 2..c * 2 + 2).unwrap()))
        .collect();
    assert_eq!(rank0, expected);
}

// ─── Failure Leaves Model Untouched ──────────────────────────────────────────

#[test]
fn indivisible_attribute_fails_before_mutation() {
    let mapping = toy_mapping(MappingRule::column("proj"));
    let results = run_ranks(2, |comm| {
        let mut model = toy_model(8, 3);
        let before = snapshot(&model);
        let err = parallelize(&mut model, comm, &mapping).unwrap_err();
        (err.to_string(), before == snapshot(&model), model)
    });
    for (err, unchanged, model) in results {
        assert!(err.contains("num_heads"), "got: {err}");
        assert!(unchanged);
        assert!(model.tensor_parallel.is_none());
        assert!(model.named_parameters().iter().all(|(_, p)| p.shard.is_none()));
        assert!(!model.module("block.proj").unwrap().variant.is_parallel());
    }
}

#[test]
fn indivisible_weight_is_reported() {
    // Two fused projections over two ranks make four chunks of six rows.
    let mapping = toy_mapping(MappingRule::column("proj").fused(FusionDegree::Fixed(2)));
    let errors = run_ranks(2, |comm| {
        let mut model = toy_model(6, 2);
        parallelize(&mut model, comm, &mapping).unwrap_err()
    });
    for err in errors {
        assert!(
            matches!(
                err,
                TensorParallelError::Indivisible {
                    size: 6,
                    chunks: 4,
                    ..
                }
            ),
            "{err}"
        );
    }
}

#[test]
fn vocab_too_small_for_world_size() {
    let mapping = toy_mapping(MappingRule::column("proj"));
    // Ceil(4 / 3) = 2 rows per rank leaves the third rank empty.
    let errors = run_ranks(3, |comm| {
        let mut model = toy_model(6, 3);
        parallelize(&mut model, comm, &mapping).unwrap_err()
    });
    for err in errors {
        assert!(
            matches!(
                err,
                TensorParallelError::EmptyShard {
                    num_embeddings: 4,
                    world_size: 3
                }
            ),
            "{err}"
        );
    }
}

#[test]
fn unknown_architecture_is_rejected() {
    let mapping = TensorParallelMapping::builtin().unwrap();
    let mut model = toy_model(8, 2);
    let err = parallelize(&mut model, Arc::new(LocalCommunicator::new()), &mapping).unwrap_err();
    assert!(matches!(err, TensorParallelError::Mapping(_)), "{err}");
    assert!(err.to_string().contains(TOY));
}

// ─── Deparallelize Preconditions ─────────────────────────────────────────────

#[test]
fn deparallelize_requires_parallel_model() {
    let mapping = TensorParallelMapping::builtin().unwrap();
    let mut model = tiny_gpt2().unwrap();
    let err = deparallelize(&mut model, Arc::new(LocalCommunicator::new()), &mapping).unwrap_err();
    assert!(matches!(err, TensorParallelError::NotParallelized));
}

#[test]
fn deparallelize_rejects_other_world_size() {
    let mapping = TensorParallelMapping::builtin().unwrap();
    let mut sharded = run_ranks(2, |comm| {
        let mut model = tiny_gpt2().unwrap();
        parallelize(&mut model, comm, &mapping).unwrap();
        model
    });
    let mut model = sharded.remove(0);
    let engine = TensorDeparallelEngine::new(Arc::new(LocalCommunicator::new()), mapping);
    assert!(matches!(
        engine.deparallelize(&mut model),
        Err(TensorParallelError::WorldSizeMismatch {
            sharded: 2,
            world_size: 1
        })
    ));
    assert!(model.is_parallelized());
}

// ─── Documents on Disk ───────────────────────────────────────────────────────

const TOY_MAPPING: &str = r#"{
    "ToyModel": {
        "rules": [
            { "pattern": "proj", "parallel": "column", "fusion": 3 }
        ],
        "update_attrs": ["num_heads"]
    }
}"#;

fn write_temp(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn engine_from_files() {
    let mapping_file = write_temp(TOY_MAPPING);
    let config_file = write_temp(
        r#"{ "model_parallelism": { "enable": true, "tensor_parallel_size": 2 } }"#,
    );
    let mapping = TensorParallelMapping::from_file(mapping_file.path()).unwrap();
    let config = ParallelismConfig::from_file(config_file.path()).unwrap();

    let heads = run_ranks(2, |comm| {
        let mut model = toy_model(12, 2);
        TensorParallelEngine::new(comm, mapping.clone(), config.clone())
            .parallelize(&mut model)
            .unwrap();
        assert_eq!(weight(&model, "block.proj").dims(), &[6, 4]);
        model.module("block").unwrap().config.num_heads
    });
    assert_eq!(heads, vec![Some(1), Some(1)]);
}

#[test]
fn memory_efficient_fusion_config_is_rejected() {
    let config_file = write_temp(
        r#"{
            "model_parallelism": { "enable": true, "tensor_parallel_size": 1 },
            "kernel_fusion": { "enable": true, "memory_efficient_fusion": true }
        }"#,
    );
    let config = ParallelismConfig::from_file(config_file.path()).unwrap();
    let mapping = TensorParallelMapping::from_json_str(TOY_MAPPING).unwrap();
    let mut model = toy_model(12, 2);
    let engine = TensorParallelEngine::new(Arc::new(LocalCommunicator::new()), mapping, config);
    let err = engine.parallelize(&mut model).unwrap_err();
    assert!(matches!(err, TensorParallelError::Config(_)), "{err}");
    assert!(model.tensor_parallel.is_none());
}

#[test]
fn fused_row_rule_is_rejected_on_load() {
    let json = r#"{
        "ToyModel": { "rules": [ { "pattern": "proj", "parallel": "row", "fusion": 2 } ] }
    }"#;
    assert!(TensorParallelMapping::from_json_str(json).is_err());
}

// ─── Tied Head With Bias ─────────────────────────────────────────────────────

#[test]
fn tied_head_with_bias_matches_unsharded_output() {
    init_tracing();
    let mapping = toy_mapping(MappingRule::column("proj"));
    let x = counting(3, 4).affine(0.1, -0.4).unwrap();
    let expected = toy_tied_biased_head()
        .module("head")
        .unwrap()
        .forward(&x)
        .unwrap();

    let outputs = run_ranks(2, |comm| {
        let mut model = toy_tied_biased_head();
        parallelize(&mut model, comm, &mapping).unwrap();
        let head = model.module("head").unwrap();
        assert!(matches!(head.variant, LayerVariant::ColumnParallel(_)));
        assert_eq!(head.bias.as_ref().unwrap().tensor.dims(), &[4]);
        head.forward(&x).unwrap()
    });

    for (rank, out) in outputs.iter().enumerate() {
        assert_eq!(out.dims(), &[3, 4], "rank {rank}");
        let diff = max_abs_diff(out, &expected).unwrap();
        assert!(diff < 1e-5, "rank {rank}: max diff {diff}");
    }
}

#[test]
fn tied_head_with_bias_round_trips() {
    let mapping = toy_mapping(MappingRule::column("proj"));
    let expected = snapshot(&toy_tied_biased_head());

    let snaps = run_ranks(2, |comm| {
        let mut model = toy_tied_biased_head();
        parallelize(&mut model, comm.clone(), &mapping).unwrap();
        deparallelize(&mut model, comm, &mapping).unwrap();
        assert_eq!(model.tied_modules("embed"), vec!["head"]);
        snapshot(&model)
    });
    for snap in snaps {
        assert_eq!(snap, expected);
    }
}
