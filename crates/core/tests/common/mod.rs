//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Once;

use candle_core::DType;
use tp_core::model::{Attr, Model};

static TRACING: Once = Once::new();

/// Install a fmt subscriber honouring `RUST_LOG` (once per test binary).
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

/// Shape and exact values of one tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSnapshot {
    pub dims: Vec<usize>,
    pub values: Vec<f64>,
}

/// Every parameter, buffer and integer attribute of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSnapshot {
    pub params: BTreeMap<String, TensorSnapshot>,
    pub attrs: BTreeMap<String, Vec<(Attr, usize)>>,
}

pub fn snapshot(model: &Model) -> ModelSnapshot {
    let params = model
        .named_parameters()
        .into_iter()
        .map(|(name, param)| {
            let values = param
                .tensor
                .to_dtype(DType::F64)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f64>()
                .unwrap();
            let snap = TensorSnapshot {
                dims: param.dims().to_vec(),
                values,
            };
            (name, snap)
        })
        .collect();
    let attrs = model
        .named_modules()
        .into_iter()
        .map(|(name, node)| (name, node.config.present()))
        .collect();
    ModelSnapshot { params, attrs }
}
