//! Explicit module graph the tensor-parallel engines operate on.
//!
//! A [`Model`] is a tree of named [`ModuleNode`]s. Nodes are mutated in
//! place (tensors, integer attributes, behaviour variant) but the tree
//! itself never gains or loses nodes. Qualified names are the dot-joined
//! child names from the root, e.g. `transformer.h.0.attn.c_attn`; the root
//! itself is named `""`.

mod attrs;

pub use attrs::{Attr, ModuleConfig};

use candle_core::{Device, Tensor, TensorId};

use crate::tensor_parallel::{LayerVariant, Result};

/// Parallel coordinates of the tensor instance a [`Param`] holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ShardDescriptor {
    pub tp_rank: usize,
    pub pp_rank: usize,
    pub dp_rank: usize,
}

impl ShardDescriptor {
    pub fn tensor_parallel(tp_rank: usize) -> Self {
        Self {
            tp_rank,
            ..Self::default()
        }
    }
}

/// A parameter or buffer tensor plus its placement metadata.
#[derive(Debug, Clone)]
pub struct Param {
    pub tensor: Tensor,
    /// Set by parallelize; only consulted for device placement.
    pub shard: Option<ShardDescriptor>,
}

impl Param {
    pub fn new(tensor: Tensor) -> Self {
        Self {
            tensor,
            shard: None,
        }
    }

    pub fn id(&self) -> TensorId {
        self.tensor.id()
    }

    pub fn dims(&self) -> &[usize] {
        self.tensor.dims()
    }

    pub fn device(&self) -> &Device {
        self.tensor.device()
    }
}

impl From<Tensor> for Param {
    fn from(tensor: Tensor) -> Self {
        Self::new(tensor)
    }
}

/// Semantic kind of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// Weight layout `[out_features, in_features]`.
    Linear,
    /// Linear with transposed weight layout `[nx, nf]` (input, output).
    Conv1D,
    /// Lookup table `[num_embeddings, embedding_dim]`.
    Embedding,
    /// Container or parameter-free module.
    Other,
}

impl ModuleKind {
    pub fn is_linear(&self) -> bool {
        matches!(self, ModuleKind::Linear | ModuleKind::Conv1D)
    }
}

/// Recorded on a [`Model`] while it is sharded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorParallelState {
    pub world_size: usize,
    pub rank: usize,
}

/// One node of the module tree.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub kind: ModuleKind,
    pub weight: Option<Param>,
    pub bias: Option<Param>,
    pub buffers: Vec<(String, Param)>,
    pub config: ModuleConfig,
    pub variant: LayerVariant,
    children: Vec<(String, ModuleNode)>,
}

impl ModuleNode {
    fn with_kind(kind: ModuleKind) -> Self {
        Self {
            kind,
            weight: None,
            bias: None,
            buffers: Vec::new(),
            config: ModuleConfig::default(),
            variant: LayerVariant::Plain,
            children: Vec::new(),
        }
    }

    /// Parameter-free container.
    pub fn container() -> Self {
        Self::with_kind(ModuleKind::Other)
    }

    /// Linear layer with weight `[out_features, in_features]`.
    pub fn linear(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        let mut node = Self::with_kind(ModuleKind::Linear);
        node.config = ModuleConfig::default()
            .with(Attr::InFeatures, in_features)
            .with(Attr::OutFeatures, out_features);
        node.weight = Some(Param::new(weight));
        node.bias = bias.map(Param::new);
        Ok(node)
    }

    /// Transposed-layout linear with weight `[nx, nf]`.
    pub fn conv1d(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (nx, nf) = weight.dims2()?;
        let mut node = Self::with_kind(ModuleKind::Conv1D);
        node.config = ModuleConfig::default()
            .with(Attr::Nx, nx)
            .with(Attr::Nf, nf);
        node.weight = Some(Param::new(weight));
        node.bias = bias.map(Param::new);
        Ok(node)
    }

    /// Embedding table `[num_embeddings, embedding_dim]`.
    pub fn embedding(weight: Tensor) -> Result<Self> {
        let (num_embeddings, embedding_dim) = weight.dims2()?;
        let mut node = Self::with_kind(ModuleKind::Embedding);
        node.config = ModuleConfig::default()
            .with(Attr::NumEmbeddings, num_embeddings)
            .with(Attr::EmbeddingDim, embedding_dim);
        node.weight = Some(Param::new(weight));
        Ok(node)
    }

    pub fn with_attr(mut self, attr: Attr, value: usize) -> Self {
        self.config.set(attr, value);
        self
    }

    pub fn with_buffer(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.buffers.push((name.into(), Param::new(tensor)));
        self
    }

    pub fn with_child(mut self, name: impl Into<String>, child: ModuleNode) -> Self {
        self.add_child(name, child);
        self
    }

    /// Append a child, replacing any existing child of the same name.
    pub fn add_child(&mut self, name: impl Into<String>, child: ModuleNode) {
        let name = name.into();
        if let Some(slot) = self.children.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = child;
        } else {
            self.children.push((name, child));
        }
    }

    pub fn child(&self, name: &str) -> Option<&ModuleNode> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, child)| child)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut ModuleNode> {
        self.children
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, child)| child)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &ModuleNode)> {
        self.children.iter().map(|(n, c)| (n.as_str(), c))
    }

    /// Descendant at a dot-separated relative path; `""` is `self`.
    pub fn get(&self, path: &str) -> Option<&ModuleNode> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |node, name| node.child(name))
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut ModuleNode> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |node, name| node.child_mut(name))
    }

    /// All nodes in pre-order with their qualified names.
    pub fn named_modules(&self) -> Vec<(String, &ModuleNode)> {
        let mut out = vec![(String::new(), self)];
        self.collect_named("", &mut out);
        out
    }

    fn collect_named<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a ModuleNode)>) {
        for (name, child) in &self.children {
            let qualified = join(prefix, name);
            out.push((qualified.clone(), child));
            child.collect_named(&qualified, out);
        }
    }

    /// Visit every node mutably in pre-order.
    pub fn visit_mut<F>(&mut self, f: &mut F)
    where
        F: FnMut(&str, &mut ModuleNode),
    {
        self.visit_mut_inner("", f);
    }

    fn visit_mut_inner<F>(&mut self, name: &str, f: &mut F)
    where
        F: FnMut(&str, &mut ModuleNode),
    {
        f(name, self);
        for (child_name, child) in &mut self.children {
            let qualified = join(name, child_name);
            child.visit_mut_inner(&qualified, f);
        }
    }

    /// Weight, bias and buffers of this node, in that order.
    pub fn params_mut(&mut self) -> impl Iterator<Item = &mut Param> {
        self.weight
            .iter_mut()
            .chain(self.bias.iter_mut())
            .chain(self.buffers.iter_mut().map(|(_, p)| p))
    }

    pub fn params(&self) -> impl Iterator<Item = &Param> {
        self.weight
            .iter()
            .chain(self.bias.iter())
            .chain(self.buffers.iter().map(|(_, p)| p))
    }

    /// Run the node's forward computation under its current variant.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.variant.forward(self, input)
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// A model: architecture name, module tree and sharding state.
#[derive(Debug, Clone)]
pub struct Model {
    /// Selects the mapping table (e.g. `GPT2LMHeadModel`).
    pub architecture: String,
    pub root: ModuleNode,
    input_embeddings: Option<String>,
    /// `Some` while the model holds per-rank shards.
    pub tensor_parallel: Option<TensorParallelState>,
}

impl Model {
    pub fn new(architecture: impl Into<String>, root: ModuleNode) -> Self {
        Self {
            architecture: architecture.into(),
            root,
            input_embeddings: None,
            tensor_parallel: None,
        }
    }

    /// Declare the qualified name of the input embedding module.
    pub fn with_input_embeddings(mut self, path: impl Into<String>) -> Self {
        self.input_embeddings = Some(path.into());
        self
    }

    pub fn input_embeddings_path(&self) -> Option<&str> {
        self.input_embeddings.as_deref()
    }

    pub fn input_embeddings(&self) -> Option<&ModuleNode> {
        self.input_embeddings
            .as_deref()
            .and_then(|path| self.root.get(path))
    }

    pub fn module(&self, name: &str) -> Option<&ModuleNode> {
        self.root.get(name)
    }

    pub fn module_mut(&mut self, name: &str) -> Option<&mut ModuleNode> {
        self.root.get_mut(name)
    }

    pub fn named_modules(&self) -> Vec<(String, &ModuleNode)> {
        self.root.named_modules()
    }

    /// Qualified names of every parameter and buffer, `module.weight`,
    /// `module.bias`, `module.<buffer>`.
    pub fn named_parameters(&self) -> Vec<(String, &Param)> {
        let mut out = Vec::new();
        for (name, node) in self.root.named_modules() {
            if let Some(w) = &node.weight {
                out.push((join(&name, "weight"), w));
            }
            if let Some(b) = &node.bias {
                out.push((join(&name, "bias"), b));
            }
            for (buf_name, buf) in &node.buffers {
                out.push((join(&name, buf_name), buf));
            }
        }
        out
    }

    /// Qualified names of every non-embedding module whose weight is the
    /// very tensor held by the module at `embedding_path`.
    pub fn tied_modules(&self, embedding_path: &str) -> Vec<String> {
        let Some(id) = self
            .root
            .get(embedding_path)
            .and_then(|node| node.weight.as_ref())
            .map(Param::id)
        else {
            return Vec::new();
        };
        self.named_modules()
            .into_iter()
            .filter(|(name, node)| {
                name != embedding_path
                    && node.kind != ModuleKind::Embedding
                    && node.weight.as_ref().is_some_and(|w| w.id() == id)
            })
            .map(|(name, _)| name)
            .collect()
    }

    pub fn is_parallelized(&self) -> bool {
        self.tensor_parallel.is_some()
    }
}
