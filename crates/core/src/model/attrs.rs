//! Typed integer attributes carried by model modules.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of an integer attribute a module may carry.
///
/// Mapping tables refer to attributes by these names (snake_case in JSON)
/// when listing the values that scale with the number of shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attr {
    InFeatures,
    OutFeatures,
    Nx,
    Nf,
    NumEmbeddings,
    EmbeddingDim,
    HiddenSize,
    EmbedDim,
    NumHeads,
    NumAttentionHeads,
    NumKeyValueHeads,
    HeadDim,
    SplitSize,
    AllHeadSize,
    IntermediateSize,
}

impl Attr {
    pub const ALL: [Attr; 15] = [
        Attr::InFeatures,
        Attr::OutFeatures,
        Attr::Nx,
        Attr::Nf,
        Attr::NumEmbeddings,
        Attr::EmbeddingDim,
        Attr::HiddenSize,
        Attr::EmbedDim,
        Attr::NumHeads,
        Attr::NumAttentionHeads,
        Attr::NumKeyValueHeads,
        Attr::HeadDim,
        Attr::SplitSize,
        Attr::AllHeadSize,
        Attr::IntermediateSize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Attr::InFeatures => "in_features",
            Attr::OutFeatures => "out_features",
            Attr::Nx => "nx",
            Attr::Nf => "nf",
            Attr::NumEmbeddings => "num_embeddings",
            Attr::EmbeddingDim => "embedding_dim",
            Attr::HiddenSize => "hidden_size",
            Attr::EmbedDim => "embed_dim",
            Attr::NumHeads => "num_heads",
            Attr::NumAttentionHeads => "num_attention_heads",
            Attr::NumKeyValueHeads => "num_key_value_heads",
            Attr::HeadDim => "head_dim",
            Attr::SplitSize => "split_size",
            Attr::AllHeadSize => "all_head_size",
            Attr::IntermediateSize => "intermediate_size",
        }
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer configuration of a single module.
///
/// Every field is optional: a module only carries the attributes its
/// architecture defines. Fields are read and written through [`Attr`] so
/// callers never touch them by string name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleConfig {
    pub in_features: Option<usize>,
    pub out_features: Option<usize>,
    /// Input width of a transposed-layout linear.
    pub nx: Option<usize>,
    /// Output width of a transposed-layout linear.
    pub nf: Option<usize>,
    pub num_embeddings: Option<usize>,
    pub embedding_dim: Option<usize>,
    pub hidden_size: Option<usize>,
    pub embed_dim: Option<usize>,
    pub num_heads: Option<usize>,
    pub num_attention_heads: Option<usize>,
    pub num_key_value_heads: Option<usize>,
    pub head_dim: Option<usize>,
    pub split_size: Option<usize>,
    pub all_head_size: Option<usize>,
    pub intermediate_size: Option<usize>,
}

impl ModuleConfig {
    fn slot(&self, attr: Attr) -> &Option<usize> {
        match attr {
            Attr::InFeatures => &self.in_features,
            Attr::OutFeatures => &self.out_features,
            Attr::Nx => &self.nx,
            Attr::Nf => &self.nf,
            Attr::NumEmbeddings => &self.num_embeddings,
            Attr::EmbeddingDim => &self.embedding_dim,
            Attr::HiddenSize => &self.hidden_size,
            Attr::EmbedDim => &self.embed_dim,
            Attr::NumHeads => &self.num_heads,
            Attr::NumAttentionHeads => &self.num_attention_heads,
            Attr::NumKeyValueHeads => &self.num_key_value_heads,
            Attr::HeadDim => &self.head_dim,
            Attr::SplitSize => &self.split_size,
            Attr::AllHeadSize => &self.all_head_size,
            Attr::IntermediateSize => &self.intermediate_size,
        }
    }

    fn slot_mut(&mut self, attr: Attr) -> &mut Option<usize> {
        match attr {
            Attr::InFeatures => &mut self.in_features,
            Attr::OutFeatures => &mut self.out_features,
            Attr::Nx => &mut self.nx,
            Attr::Nf => &mut self.nf,
            Attr::NumEmbeddings => &mut self.num_embeddings,
            Attr::EmbeddingDim => &mut self.embedding_dim,
            Attr::HiddenSize => &mut self.hidden_size,
            Attr::EmbedDim => &mut self.embed_dim,
            Attr::NumHeads => &mut self.num_heads,
            Attr::NumAttentionHeads => &mut self.num_attention_heads,
            Attr::NumKeyValueHeads => &mut self.num_key_value_heads,
            Attr::HeadDim => &mut self.head_dim,
            Attr::SplitSize => &mut self.split_size,
            Attr::AllHeadSize => &mut self.all_head_size,
            Attr::IntermediateSize => &mut self.intermediate_size,
        }
    }

    /// Value of `attr`, if this module carries it.
    pub fn get(&self, attr: Attr) -> Option<usize> {
        *self.slot(attr)
    }

    /// Whether this module carries `attr`.
    pub fn has(&self, attr: Attr) -> bool {
        self.slot(attr).is_some()
    }

    /// Set `attr`, adding it if the module did not carry it yet.
    pub fn set(&mut self, attr: Attr, value: usize) {
        *self.slot_mut(attr) = Some(value);
    }

    /// Builder-style [`ModuleConfig::set`].
    pub fn with(mut self, attr: Attr, value: usize) -> Self {
        self.set(attr, value);
        self
    }

    /// Merge `updates` into the attributes this module already carries.
    ///
    /// Attributes the module does not define are left absent. Returns the
    /// number of attributes that changed.
    pub fn update(&mut self, updates: &[(Attr, usize)]) -> usize {
        let mut changed = 0;
        for &(attr, value) in updates {
            let slot = self.slot_mut(attr);
            if let Some(current) = slot {
                if *current != value {
                    *current = value;
                    changed += 1;
                }
            }
        }
        changed
    }

    /// All attributes this module carries, in [`Attr::ALL`] order.
    pub fn present(&self) -> Vec<(Attr, usize)> {
        Attr::ALL
            .iter()
            .filter_map(|&attr| self.get(attr).map(|v| (attr, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_set_roundtrip_every_attr() {
        let mut cfg = ModuleConfig::default();
        for (i, attr) in Attr::ALL.iter().enumerate() {
            assert_eq!(cfg.get(*attr), None);
            cfg.set(*attr, i + 1);
        }
        for (i, attr) in Attr::ALL.iter().enumerate() {
            assert_eq!(cfg.get(*attr), Some(i + 1), "{attr}");
        }
        assert_eq!(cfg.present().len(), Attr::ALL.len());
    }

    #[test]
    fn update_only_touches_present_attrs() {
        let mut cfg = ModuleConfig::default()
            .with(Attr::NumHeads, 12)
            .with(Attr::EmbedDim, 768);
        let changed = cfg.update(&[
            (Attr::NumHeads, 6),
            (Attr::EmbedDim, 768),
            (Attr::SplitSize, 384),
        ]);
        assert_eq!(changed, 1);
        assert_eq!(cfg.num_heads, Some(6));
        assert_eq!(cfg.embed_dim, Some(768));
        assert!(!cfg.has(Attr::SplitSize));
    }

    #[test]
    fn attr_serde_names_match_as_str() {
        for attr in Attr::ALL {
            let json = serde_json::to_string(&attr).unwrap();
            assert_eq!(json, format!("\"{}\"", attr.as_str()));
            let back: Attr = serde_json::from_str(&json).unwrap();
            assert_eq!(back, attr);
        }
    }
}
