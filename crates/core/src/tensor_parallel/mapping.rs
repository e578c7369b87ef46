//! Mapping tables: which modules of an architecture are column-parallel,
//! row-parallel or left alone.
//!
//! A mapping document is a JSON object keyed by architecture name:
//!
//! ```json
//! {
//!   "GPT2": {
//!     "rules": [
//!       { "pattern": "attn.c_attn", "parallel": "column", "reversed": true, "fusion": 3 },
//!       { "pattern": "attn.c_proj", "parallel": "row", "reversed": true }
//!     ],
//!     "update_attrs": ["embed_dim", "split_size", "num_heads"]
//!   }
//! }
//! ```
//!
//! A model uses the table whose key equals its architecture, or else the
//! longest key its architecture starts with (`GPT2` serves
//! `GPT2LMHeadModel`). Within a table the first matching rule wins.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::MappingError;
use crate::model::{Attr, Model, ModuleKind, ModuleNode};

const BUILTIN_MAPPINGS: &str = include_str!("mappings/builtin.json");

/// How a module is sharded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelKind {
    #[default]
    None,
    /// Output features split across ranks.
    Column,
    /// Input features split across ranks.
    Row,
}

/// How a rule pattern is compared with a qualified module name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Whole name, or a trailing run of dot-separated components.
    #[default]
    Suffix,
    /// Anywhere in the name.
    Contains,
}

/// Number of logical projections packed in one weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FusionDegree {
    Fixed(usize),
    /// Output-feature count of the module divided by the named attribute
    /// (looked up on the first module of the model that carries it).
    OutFeaturesOver { out_features_over: Attr },
}

impl Default for FusionDegree {
    fn default() -> Self {
        FusionDegree::Fixed(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    pub pattern: String,
    #[serde(rename = "match", default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub parallel: ParallelKind,
    #[serde(default)]
    pub reversed: bool,
    #[serde(default)]
    pub fusion: FusionDegree,
}

impl MappingRule {
    pub fn column(pattern: impl Into<String>) -> Self {
        Self::new(pattern, ParallelKind::Column)
    }

    pub fn row(pattern: impl Into<String>) -> Self {
        Self::new(pattern, ParallelKind::Row)
    }

    fn new(pattern: impl Into<String>, parallel: ParallelKind) -> Self {
        Self {
            pattern: pattern.into(),
            match_mode: MatchMode::Suffix,
            parallel,
            reversed: false,
            fusion: FusionDegree::default(),
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reversed = true;
        self
    }

    pub fn fused(mut self, fusion: FusionDegree) -> Self {
        self.fusion = fusion;
        self
    }

    pub fn matches(&self, name: &str) -> bool {
        match self.match_mode {
            MatchMode::Contains => name.contains(&self.pattern),
            MatchMode::Suffix => {
                name == self.pattern
                    || name
                        .strip_suffix(self.pattern.as_str())
                        .is_some_and(|head| head.ends_with('.'))
            }
        }
    }
}

/// Rules and rescaled attributes of one architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingTable {
    pub rules: Vec<MappingRule>,
    #[serde(default)]
    pub update_attrs: Vec<Attr>,
}

impl MappingTable {
    fn validate(&self, architecture: &str) -> Result<(), MappingError> {
        if self.rules.is_empty() {
            return Err(MappingError::EmptyTable {
                architecture: architecture.to_string(),
            });
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.pattern.is_empty() {
                return Err(MappingError::EmptyPattern {
                    architecture: architecture.to_string(),
                    index,
                });
            }
            match rule.fusion {
                FusionDegree::Fixed(0) => {
                    return Err(MappingError::ZeroFusion {
                        architecture: architecture.to_string(),
                        pattern: rule.pattern.clone(),
                    })
                }
                FusionDegree::Fixed(1) => {}
                _ if rule.parallel == ParallelKind::Row => {
                    return Err(MappingError::FusedRowRule {
                        architecture: architecture.to_string(),
                        pattern: rule.pattern.clone(),
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// First rule matching `name`.
    pub fn rule_for(&self, name: &str) -> Option<&MappingRule> {
        self.rules.iter().find(|rule| rule.matches(name))
    }
}

/// Per-architecture mapping tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorParallelMapping {
    tables: BTreeMap<String, MappingTable>,
}

impl TensorParallelMapping {
    /// Tables shipped with the crate (GPT-2, GPT-Neo, BERT, Llama).
    pub fn builtin() -> Result<Self, MappingError> {
        Self::from_json_str(BUILTIN_MAPPINGS)
    }

    /// Parse and validate a mapping document.
    pub fn from_json_str(json: &str) -> Result<Self, MappingError> {
        let mapping: Self = serde_json::from_str(json)?;
        for (architecture, table) in &mapping.tables {
            table.validate(architecture)?;
        }
        Ok(mapping)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MappingError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Add or replace the table of `architecture`.
    pub fn insert(
        &mut self,
        architecture: impl Into<String>,
        table: MappingTable,
    ) -> Result<(), MappingError> {
        let architecture = architecture.into();
        table.validate(&architecture)?;
        self.tables.insert(architecture, table);
        Ok(())
    }

    pub fn architectures(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Table serving `architecture`.
    pub fn table(&self, architecture: &str) -> Result<&MappingTable, MappingError> {
        if let Some(table) = self.tables.get(architecture) {
            return Ok(table);
        }
        self.tables
            .iter()
            .filter(|(key, _)| architecture.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, table)| table)
            .ok_or_else(|| MappingError::UnknownArchitecture(architecture.to_string()))
    }

    pub fn table_for(&self, model: &Model) -> Result<&MappingTable, MappingError> {
        self.table(&model.architecture)
    }

    fn rule(&self, model: &Model, name: &str) -> Result<Option<&MappingRule>, MappingError> {
        Ok(self.table_for(model)?.rule_for(name))
    }

    /// Parallelism of the module `name`.
    pub fn classify(&self, model: &Model, name: &str) -> Result<ParallelKind, MappingError> {
        Ok(self
            .rule(model, name)?
            .map_or(ParallelKind::None, |rule| rule.parallel))
    }

    pub fn is_column_parallel(&self, model: &Model, name: &str) -> Result<bool, MappingError> {
        Ok(self.classify(model, name)? == ParallelKind::Column)
    }

    pub fn is_row_parallel(&self, model: &Model, name: &str) -> Result<bool, MappingError> {
        Ok(self.classify(model, name)? == ParallelKind::Row)
    }

    /// Whether the module stores its weight as `[in, out]`.
    pub fn is_reversed(&self, model: &Model, name: &str) -> Result<bool, MappingError> {
        Ok(self.rule(model, name)?.is_some_and(|rule| rule.reversed))
    }

    /// Fusion degree of `module`, 1 when no rule matches.
    pub fn fusion_degree(
        &self,
        model: &Model,
        name: &str,
        module: &ModuleNode,
    ) -> Result<usize, MappingError> {
        let Some(rule) = self.rule(model, name)? else {
            return Ok(1);
        };
        match rule.fusion {
            FusionDegree::Fixed(degree) => Ok(degree),
            FusionDegree::OutFeaturesOver { out_features_over } => {
                let reason = |reason: String| MappingError::FusionDegree {
                    module: name.to_string(),
                    reason,
                };
                let out_features = output_features(module, rule.reversed)
                    .ok_or_else(|| reason("module has no 2-d weight".to_string()))?;
                let per_projection = model
                    .named_modules()
                    .into_iter()
                    .find_map(|(_, node)| node.config.get(out_features_over))
                    .filter(|&v| v > 0)
                    .ok_or_else(|| reason(format!("no module carries `{out_features_over}`")))?;
                if out_features % per_projection != 0 {
                    return Err(reason(format!(
                        "{out_features} output features are not a multiple of {out_features_over} ({per_projection})"
                    )));
                }
                Ok(out_features / per_projection)
            }
        }
    }

    /// Attributes that scale with the number of shards.
    pub fn attrs_to_rescale(&self, model: &Model) -> Result<&[Attr], MappingError> {
        Ok(&self.table_for(model)?.update_attrs)
    }
}

/// Output-feature count of a linear weight, honouring its layout.
fn output_features(module: &ModuleNode, reversed: bool) -> Option<usize> {
    let weight = module.weight.as_ref()?;
    let &[rows, cols] = weight.dims() else {
        return None;
    };
    let transposed = module.kind == ModuleKind::Conv1D || reversed;
    Some(if transposed { cols } else { rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    fn gpt2_like() -> Model {
        let block = ModuleNode::container()
            .with_child(
                "attn",
                ModuleNode::container()
                    .with_attr(Attr::EmbedDim, 8)
                    .with_child("c_attn", ModuleNode::conv1d(zeros(&[8, 24]), None).unwrap())
                    .with_child("c_proj", ModuleNode::conv1d(zeros(&[8, 8]), None).unwrap()),
            )
            .with_child(
                "mlp",
                ModuleNode::container()
                    .with_child("c_fc", ModuleNode::conv1d(zeros(&[8, 32]), None).unwrap())
                    .with_child("c_proj", ModuleNode::conv1d(zeros(&[32, 8]), None).unwrap()),
            );
        let root = ModuleNode::container().with_child(
            "transformer",
            ModuleNode::container().with_child("h", ModuleNode::container().with_child("0", block)),
        );
        Model::new("GPT2LMHeadModel", root)
    }

    #[test]
    fn builtin_tables_parse() {
        let mapping = TensorParallelMapping::builtin().unwrap();
        let archs: Vec<&str> = mapping.architectures().collect();
        assert_eq!(archs, vec!["Bert", "GPT2", "GPTNeo", "Llama"]);
    }

    #[test]
    fn classify_gpt2_modules() {
        let mapping = TensorParallelMapping::builtin().unwrap();
        let model = gpt2_like();
        let cases = [
            ("transformer.h.0.attn.c_attn", ParallelKind::Column),
            ("transformer.h.0.attn.c_proj", ParallelKind::Row),
            ("transformer.h.0.mlp.c_fc", ParallelKind::Column),
            ("transformer.h.0.mlp.c_proj", ParallelKind::Row),
            ("transformer.h.0.attn", ParallelKind::None),
            ("transformer.wte", ParallelKind::None),
        ];
        for (name, expected) in cases {
            assert_eq!(mapping.classify(&model, name).unwrap(), expected, "{name}");
        }
        assert!(mapping.is_reversed(&model, "transformer.h.0.mlp.c_fc").unwrap());
        assert!(!mapping.is_reversed(&model, "transformer.wte").unwrap());
        assert!(mapping.is_column_parallel(&model, "transformer.h.0.attn.c_attn").unwrap());
        assert!(mapping.is_row_parallel(&model, "transformer.h.0.mlp.c_proj").unwrap());
    }

    #[test]
    fn suffix_match_respects_component_boundaries() {
        let rule = MappingRule::column("attn.c_attn");
        assert!(rule.matches("attn.c_attn"));
        assert!(rule.matches("h.0.attn.c_attn"));
        assert!(!rule.matches("h.0.xattn.c_attn"));
        assert!(!rule.matches("h.0.attn.c_attn.inner"));

        let mut contains = MappingRule::column("c_attn");
        contains.match_mode = MatchMode::Contains;
        assert!(contains.matches("h.0.attn.c_attn_fused"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let json = r#"{
            "Toy": {
                "rules": [
                    { "pattern": "attention.output.dense", "parallel": "row" },
                    { "pattern": "dense", "parallel": "column" }
                ]
            }
        }"#;
        let mapping = TensorParallelMapping::from_json_str(json).unwrap();
        let model = Model::new("Toy", ModuleNode::container());
        assert_eq!(
            mapping.classify(&model, "layer.0.attention.output.dense").unwrap(),
            ParallelKind::Row
        );
        assert_eq!(
            mapping.classify(&model, "layer.0.intermediate.dense").unwrap(),
            ParallelKind::Column
        );
    }

    #[test]
    fn architecture_lookup_prefers_longest_prefix() {
        let mapping = TensorParallelMapping::builtin().unwrap();
        assert!(mapping.table("GPTNeoForCausalLM").unwrap().rules[0]
            .pattern
            .contains("q_proj"));
        assert!(mapping.table("GPT2LMHeadModel").unwrap().rules[0]
            .pattern
            .contains("c_attn"));
        assert!(matches!(
            mapping.table("T5ForConditionalGeneration"),
            Err(MappingError::UnknownArchitecture(_))
        ));
    }

    #[test]
    fn fixed_and_computed_fusion_degree() {
        let mapping = TensorParallelMapping::builtin().unwrap();
        let model = gpt2_like();
        let c_attn = model.module("transformer.h.0.attn.c_attn").unwrap();
        assert_eq!(
            mapping
                .fusion_degree(&model, "transformer.h.0.attn.c_attn", c_attn)
                .unwrap(),
            3
        );
        let c_fc = model.module("transformer.h.0.mlp.c_fc").unwrap();
        assert_eq!(
            mapping
                .fusion_degree(&model, "transformer.h.0.mlp.c_fc", c_fc)
                .unwrap(),
            1
        );

        let mut computed = TensorParallelMapping::default();
        computed
            .insert(
                "GPT2",
                MappingTable {
                    rules: vec![MappingRule::column("attn.c_attn").fused(
                        FusionDegree::OutFeaturesOver {
                            out_features_over: Attr::EmbedDim,
                        },
                    )],
                    update_attrs: vec![],
                },
            )
            .unwrap();
        assert_eq!(
            computed
                .fusion_degree(&model, "transformer.h.0.attn.c_attn", c_attn)
                .unwrap(),
            3
        );
    }

    #[test]
    fn computed_fusion_requires_the_attribute() {
        let json = r#"{"GPT2": {"rules": [
            {"pattern": "c_attn", "parallel": "column", "fusion": {"out_features_over": "head_dim"}}
        ]}}"#;
        let mapping = TensorParallelMapping::from_json_str(json).unwrap();
        let model = gpt2_like();
        let c_attn = model.module("transformer.h.0.attn.c_attn").unwrap();
        let err = mapping
            .fusion_degree(&model, "transformer.h.0.attn.c_attn", c_attn)
            .unwrap_err();
        assert!(err.to_string().contains("head_dim"), "got: {err}");
    }

    #[test]
    fn attrs_to_rescale_from_table() {
        let mapping = TensorParallelMapping::builtin().unwrap();
        let model = gpt2_like();
        assert_eq!(
            mapping.attrs_to_rescale(&model).unwrap(),
            &[Attr::EmbedDim, Attr::SplitSize, Attr::NumHeads]
        );
    }

    #[test]
    fn malformed_tables_are_rejected() {
        let cases = [
            (r#"{"A": {"rules": []}}"#, "no rules"),
            (r#"{"A": {"rules": [{"pattern": "", "parallel": "column"}]}}"#, "empty pattern"),
            (
                r#"{"A": {"rules": [{"pattern": "x", "parallel": "column", "fusion": 0}]}}"#,
                "fusion degree 0",
            ),
            (
                r#"{"A": {"rules": [{"pattern": "x", "parallel": "row", "fusion": 3}]}}"#,
                "cannot be fused",
            ),
            (r#"{"A": {"rules": [{"pattern": "x", "parallel": "diagonal"}]}}"#, "parse"),
        ];
        for (json, needle) in cases {
            let err = TensorParallelMapping::from_json_str(json).unwrap_err();
            assert!(err.to_string().contains(needle), "{json}: {err}");
        }
    }

    #[test]
    fn load_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(BUILTIN_MAPPINGS.as_bytes()).unwrap();
        let mapping = TensorParallelMapping::from_file(file.path()).unwrap();
        assert_eq!(mapping, TensorParallelMapping::builtin().unwrap());
    }
}
