//! Tiny GPT-2, GPT-Neo, BERT and Llama module graphs with a forward pass
//! built from the graph's own modules, so the same code runs sharded and
//! unsharded. The forwards skip layer norms and rotary embeddings; they only
//! have to route activations through every sharded projection.

use candle_core::{DType, Device, Tensor};

use super::tiny_config::{
    tiny_bert_config, tiny_bert_mlm_config, tiny_gpt2_config, tiny_gpt_neo_config,
    tiny_llama_config, TinyConfig,
};
use crate::model::{Attr, Model, ModuleNode};
use crate::tensor_parallel::Result;

/// Deterministic, pairwise distinct values in `[-0.5, 0.5]`.
pub fn seeded(shape: &[usize], seed: f64) -> candle_core::Result<Tensor> {
    let n: usize = shape.iter().product();
    Tensor::arange(0u32, n as u32, &Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(0.37, seed)?
        .sin()?
        .affine(0.5, 0.0)?
        .reshape(shape)
}

/// Largest element-wise absolute difference.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

fn module<'a>(model: &'a Model, name: &str) -> Result<&'a ModuleNode> {
    model
        .module(name)
        .ok_or_else(|| candle_core::Error::Msg(format!("no module `{name}`")).into())
}

fn attr(node: &ModuleNode, attr: Attr) -> Result<usize> {
    node.config
        .get(attr)
        .ok_or_else(|| candle_core::Error::Msg(format!("module has no `{attr}`")).into())
}

fn num_layers(model: &Model, path: &str) -> Result<usize> {
    Ok(module(model, path)?.children().count())
}

pub fn tiny_gpt2() -> Result<Model> {
    gpt2_from_config(&tiny_gpt2_config())
}

/// GPT-2 layout: transposed (`Conv1D`) projections, fused QKV and an output
/// head tied to the token embedding.
pub fn gpt2_from_config(cfg: &TinyConfig) -> Result<Model> {
    let h = cfg.hidden_size;
    let wte = seeded(&[cfg.vocab_size, h], 0.1)?;

    let mut layers = ModuleNode::container();
    for i in 0..cfg.num_layers {
        let seed = 10.0 * (i + 1) as f64;
        let attn = ModuleNode::container()
            .with_attr(Attr::EmbedDim, h)
            .with_attr(Attr::SplitSize, h)
            .with_attr(Attr::NumHeads, cfg.num_heads)
            .with_buffer("masked_bias", Tensor::new(&[-1e4f32], &Device::Cpu)?)
            .with_child(
                "c_attn",
                ModuleNode::conv1d(seeded(&[h, 3 * h], seed)?, Some(seeded(&[3 * h], seed + 1.0)?))?,
            )
            .with_child(
                "c_proj",
                ModuleNode::conv1d(seeded(&[h, h], seed + 2.0)?, Some(seeded(&[h], seed + 3.0)?))?,
            );
        let mlp = ModuleNode::container()
            .with_child(
                "c_fc",
                ModuleNode::conv1d(
                    seeded(&[h, cfg.intermediate_size], seed + 4.0)?,
                    Some(seeded(&[cfg.intermediate_size], seed + 5.0)?),
                )?,
            )
            .with_child(
                "c_proj",
                ModuleNode::conv1d(
                    seeded(&[cfg.intermediate_size, h], seed + 6.0)?,
                    Some(seeded(&[h], seed + 7.0)?),
                )?,
            );
        layers.add_child(
            i.to_string(),
            ModuleNode::container()
                .with_child("attn", attn)
                .with_child("mlp", mlp),
        );
    }

    let transformer = ModuleNode::container()
        .with_child("wte", ModuleNode::embedding(wte.clone())?)
        .with_child("wpe", ModuleNode::embedding(seeded(&[cfg.max_positions, h], 0.2)?)?)
        .with_child("h", layers);
    let root = ModuleNode::container()
        .with_child("transformer", transformer)
        .with_child("lm_head", ModuleNode::linear(wte, None)?);

    Ok(Model::new(cfg.architecture.clone(), root).with_input_embeddings("transformer.wte"))
}

/// Split `[b, t, heads * head_dim]` into `[b, heads, t, head_dim]`.
fn split_heads(x: &Tensor, heads: usize) -> Result<Tensor> {
    let (b, t, width) = x.dims3()?;
    Ok(x
        .reshape((b, t, heads, width / heads))?
        .transpose(1, 2)?
        .contiguous()?)
}

/// Repeat each key/value head `n_rep` times along the head axis.
fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, kv_heads, t, head_dim) = x.dims4()?;
    Ok(x
        .unsqueeze(2)?
        .broadcast_as((b, kv_heads, n_rep, t, head_dim))?
        .contiguous()?
        .reshape((b, kv_heads * n_rep, t, head_dim))?)
}

/// Unmasked scaled dot-product attention, merged back to `[b, t, width]`.
/// `k` and `v` carry `kv_heads` heads shared by groups of query heads.
fn grouped_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    heads: usize,
    kv_heads: usize,
) -> Result<Tensor> {
    let (b, t, width) = q.dims3()?;
    let head_dim = width / heads;
    let q = split_heads(q, heads)?;
    let k = repeat_kv(split_heads(k, kv_heads)?, heads / kv_heads)?;
    let v = repeat_kv(split_heads(v, kv_heads)?, heads / kv_heads)?;
    let scores = (q.matmul(&k.t()?.contiguous()?)? / (head_dim as f64).sqrt())?;
    let probs = candle_nn::ops::softmax_last_dim(&scores)?;
    Ok(probs
        .matmul(&v)?
        .transpose(1, 2)?
        .reshape((b, t, width))?)
}

fn attention(q: &Tensor, k: &Tensor, v: &Tensor, heads: usize) -> Result<Tensor> {
    grouped_attention(q, k, v, heads, heads)
}

/// Logits `[batch, seq, vocab]` for token ids `[batch, seq]`.
pub fn gpt2_forward(model: &Model, input_ids: &Tensor) -> Result<Tensor> {
    let (_, seq_len) = input_ids.dims2()?;
    let wte = module(model, "transformer.wte")?;
    let wpe = module(model, "transformer.wpe")?;

    let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
    let mut hidden = wte
        .forward(input_ids)?
        .broadcast_add(&wpe.forward(&positions)?)?;

    for i in 0..num_layers(model, "transformer.h")? {
        let attn = module(model, &format!("transformer.h.{i}.attn"))?;
        let split = attr(attn, Attr::SplitSize)?;
        let heads = attr(attn, Attr::NumHeads)?;
        let qkv = module(model, &format!("transformer.h.{i}.attn.c_attn"))?.forward(&hidden)?;
        let q = qkv.narrow(2, 0, split)?;
        let k = qkv.narrow(2, split, split)?;
        let v = qkv.narrow(2, 2 * split, split)?;
        let context = attention(&q, &k, &v, heads)?;
        let attn_out =
            module(model, &format!("transformer.h.{i}.attn.c_proj"))?.forward(&context)?;
        hidden = (hidden + attn_out)?;

        let fc = module(model, &format!("transformer.h.{i}.mlp.c_fc"))?.forward(&hidden)?;
        let mlp_out =
            module(model, &format!("transformer.h.{i}.mlp.c_proj"))?.forward(&fc.gelu()?)?;
        hidden = (hidden + mlp_out)?;
    }

    module(model, "lm_head")?.forward(&hidden)
}

pub fn tiny_gpt_neo() -> Result<Model> {
    gpt_neo_from_config(&tiny_gpt_neo_config())
}

/// GPT-Neo layout: `[out, in]` linears, bias-free Q/K/V under
/// `attn.attention` and an output head tied to the token embedding.
pub fn gpt_neo_from_config(cfg: &TinyConfig) -> Result<Model> {
    let h = cfg.hidden_size;
    let wte = seeded(&[cfg.vocab_size, h], 0.4)?;
    let linear = |out: usize, inp: usize, seed: f64, bias: bool| -> Result<ModuleNode> {
        let b = if bias {
            Some(seeded(&[out], seed + 0.5)?)
        } else {
            None
        };
        ModuleNode::linear(seeded(&[out, inp], seed)?, b)
    };

    let mut layers = ModuleNode::container();
    for i in 0..cfg.num_layers {
        let seed = 30.0 * (i + 1) as f64;
        let attention = ModuleNode::container()
            .with_attr(Attr::EmbedDim, h)
            .with_attr(Attr::NumHeads, cfg.num_heads)
            .with_attr(Attr::HeadDim, cfg.head_dim())
            .with_child("q_proj", linear(h, h, seed, false)?)
            .with_child("k_proj", linear(h, h, seed + 1.0, false)?)
            .with_child("v_proj", linear(h, h, seed + 2.0, false)?)
            .with_child("out_proj", linear(h, h, seed + 3.0, true)?);
        let mlp = ModuleNode::container()
            .with_child("c_fc", linear(cfg.intermediate_size, h, seed + 4.0, true)?)
            .with_child("c_proj", linear(h, cfg.intermediate_size, seed + 5.0, true)?);
        layers.add_child(
            i.to_string(),
            ModuleNode::container()
                .with_child("attn", ModuleNode::container().with_child("attention", attention))
                .with_child("mlp", mlp),
        );
    }

    let transformer = ModuleNode::container()
        .with_child("wte", ModuleNode::embedding(wte.clone())?)
        .with_child("wpe", ModuleNode::embedding(seeded(&[cfg.max_positions, h], 0.5)?)?)
        .with_child("h", layers);
    let root = ModuleNode::container()
        .with_child("transformer", transformer)
        .with_child("lm_head", ModuleNode::linear(wte, None)?);

    Ok(Model::new(cfg.architecture.clone(), root).with_input_embeddings("transformer.wte"))
}

pub fn gpt_neo_forward(model: &Model, input_ids: &Tensor) -> Result<Tensor> {
    let (_, seq_len) = input_ids.dims2()?;
    let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
    let mut hidden = module(model, "transformer.wte")?
        .forward(input_ids)?
        .broadcast_add(&module(model, "transformer.wpe")?.forward(&positions)?)?;

    for i in 0..num_layers(model, "transformer.h")? {
        let prefix = format!("transformer.h.{i}");
        let heads = attr(module(model, &format!("{prefix}.attn.attention"))?, Attr::NumHeads)?;
        let project = |name: &str| -> Result<Tensor> {
            module(model, &format!("{prefix}.attn.attention.{name}"))?.forward(&hidden)
        };
        let (q, k, v) = (project("q_proj")?, project("k_proj")?, project("v_proj")?);
        let context = attention(&q, &k, &v, heads)?;
        let attn_out =
            module(model, &format!("{prefix}.attn.attention.out_proj"))?.forward(&context)?;
        hidden = (hidden + attn_out)?;

        let fc = module(model, &format!("{prefix}.mlp.c_fc"))?.forward(&hidden)?;
        let mlp_out = module(model, &format!("{prefix}.mlp.c_proj"))?.forward(&fc.gelu()?)?;
        hidden = (hidden + mlp_out)?;
    }

    module(model, "lm_head")?.forward(&hidden)
}

pub fn tiny_bert() -> Result<Model> {
    bert_from_config(&tiny_bert_config())
}

/// BERT layout: `[out, in]` linears with biases and separate Q/K/V.
pub fn bert_from_config(cfg: &TinyConfig) -> Result<Model> {
    let h = cfg.hidden_size;
    let linear = |out: usize, inp: usize, seed: f64| -> Result<ModuleNode> {
        ModuleNode::linear(seeded(&[out, inp], seed)?, Some(seeded(&[out], seed + 0.5)?))
    };

    let mut layers = ModuleNode::container();
    for i in 0..cfg.num_layers {
        let seed = 20.0 * (i + 1) as f64;
        let self_attn = ModuleNode::container()
            .with_attr(Attr::NumAttentionHeads, cfg.num_heads)
            .with_attr(Attr::AllHeadSize, h)
            .with_attr(Attr::HeadDim, cfg.head_dim())
            .with_child("query", linear(h, h, seed)?)
            .with_child("key", linear(h, h, seed + 1.0)?)
            .with_child("value", linear(h, h, seed + 2.0)?);
        let attention = ModuleNode::container()
            .with_child("self", self_attn)
            .with_child(
                "output",
                ModuleNode::container().with_child("dense", linear(h, h, seed + 3.0)?),
            );
        layers.add_child(
            i.to_string(),
            ModuleNode::container()
                .with_child("attention", attention)
                .with_child(
                    "intermediate",
                    ModuleNode::container()
                        .with_attr(Attr::IntermediateSize, cfg.intermediate_size)
                        .with_child("dense", linear(cfg.intermediate_size, h, seed + 4.0)?),
                )
                .with_child(
                    "output",
                    ModuleNode::container()
                        .with_child("dense", linear(h, cfg.intermediate_size, seed + 5.0)?),
                ),
        );
    }

    let embeddings = ModuleNode::container()
        .with_child(
            "word_embeddings",
            ModuleNode::embedding(seeded(&[cfg.vocab_size, h], 0.3)?)?,
        )
        .with_buffer(
            "position_ids",
            Tensor::arange(0u32, cfg.max_positions as u32, &Device::Cpu)?,
        );
    let root = ModuleNode::container()
        .with_child("embeddings", embeddings)
        .with_child("encoder", ModuleNode::container().with_child("layer", layers));

    Ok(Model::new(cfg.architecture.clone(), root)
        .with_input_embeddings("embeddings.word_embeddings"))
}

/// Hidden states `[batch, seq, hidden]` for token ids `[batch, seq]`.
pub fn bert_forward(model: &Model, input_ids: &Tensor) -> Result<Tensor> {
    let mut hidden = module(model, "embeddings.word_embeddings")?.forward(input_ids)?;

    for i in 0..num_layers(model, "encoder.layer")? {
        let prefix = format!("encoder.layer.{i}");
        let self_attn = module(model, &format!("{prefix}.attention.self"))?;
        let heads = attr(self_attn, Attr::NumAttentionHeads)?;
        let project = |name: &str| -> Result<Tensor> {
            module(model, &format!("{prefix}.attention.self.{name}"))?.forward(&hidden)
        };
        let (q, k, v) = (project("query")?, project("key")?, project("value")?);
        let context = attention(&q, &k, &v, heads)?;
        let attn_out =
            module(model, &format!("{prefix}.attention.output.dense"))?.forward(&context)?;
        hidden = (hidden + attn_out)?;

        let inter = module(model, &format!("{prefix}.intermediate.dense"))?.forward(&hidden)?;
        let out = module(model, &format!("{prefix}.output.dense"))?.forward(&inter.gelu()?)?;
        hidden = (hidden + out)?;
    }
    Ok(hidden)
}

pub fn tiny_bert_mlm() -> Result<Model> {
    bert_mlm_from_config(&tiny_bert_mlm_config())
}

/// BERT with a masked-LM head: `cls.predictions.decoder` shares the word
/// embedding matrix and carries its own `[vocab]` bias.
pub fn bert_mlm_from_config(cfg: &TinyConfig) -> Result<Model> {
    let mut model = bert_from_config(cfg)?;
    let h = cfg.hidden_size;
    let wte = module(&model, "embeddings.word_embeddings")?
        .weight
        .as_ref()
        .map(|p| p.tensor.clone())
        .ok_or_else(|| candle_core::Error::Msg("word embeddings have no weight".to_string()))?;

    let predictions = ModuleNode::container()
        .with_child(
            "transform",
            ModuleNode::container().with_child(
                "dense",
                ModuleNode::linear(seeded(&[h, h], 0.6)?, Some(seeded(&[h], 0.7)?))?,
            ),
        )
        .with_child(
            "decoder",
            ModuleNode::linear(wte, Some(seeded(&[cfg.vocab_size], 0.8)?))?,
        );
    model
        .root
        .add_child("cls", ModuleNode::container().with_child("predictions", predictions));
    Ok(model)
}

/// Masked-LM logits `[batch, seq, vocab]`.
pub fn bert_mlm_forward(model: &Model, input_ids: &Tensor) -> Result<Tensor> {
    let hidden = bert_forward(model, input_ids)?;
    let transformed = module(model, "cls.predictions.transform.dense")?
        .forward(&hidden)?
        .gelu()?;
    module(model, "cls.predictions.decoder")?.forward(&transformed)
}

pub fn tiny_llama() -> Result<Model> {
    llama_from_config(&tiny_llama_config())
}

/// Llama layout: bias-free `[out, in]` projections, grouped key/value heads,
/// a gated MLP and an untied output head.
pub fn llama_from_config(cfg: &TinyConfig) -> Result<Model> {
    let h = cfg.hidden_size;
    let kv_width = cfg.num_key_value_heads * cfg.head_dim();
    let linear = |out: usize, inp: usize, seed: f64| -> Result<ModuleNode> {
        ModuleNode::linear(seeded(&[out, inp], seed)?, None)
    };

    let mut layers = ModuleNode::container();
    for i in 0..cfg.num_layers {
        let seed = 40.0 * (i + 1) as f64;
        let self_attn = ModuleNode::container()
            .with_attr(Attr::NumHeads, cfg.num_heads)
            .with_attr(Attr::NumKeyValueHeads, cfg.num_key_value_heads)
            .with_attr(Attr::HiddenSize, h)
            .with_attr(Attr::HeadDim, cfg.head_dim())
            .with_child("q_proj", linear(h, h, seed)?)
            .with_child("k_proj", linear(kv_width, h, seed + 1.0)?)
            .with_child("v_proj", linear(kv_width, h, seed + 2.0)?)
            .with_child("o_proj", linear(h, h, seed + 3.0)?);
        let mlp = ModuleNode::container()
            .with_child("gate_proj", linear(cfg.intermediate_size, h, seed + 4.0)?)
            .with_child("up_proj", linear(cfg.intermediate_size, h, seed + 5.0)?)
            .with_child("down_proj", linear(h, cfg.intermediate_size, seed + 6.0)?);
        layers.add_child(
            i.to_string(),
            ModuleNode::container()
                .with_child("self_attn", self_attn)
                .with_child("mlp", mlp),
        );
    }

    let inner = ModuleNode::container()
        .with_child(
            "embed_tokens",
            ModuleNode::embedding(seeded(&[cfg.vocab_size, h], 0.9)?)?,
        )
        .with_child("layers", layers);
    let root = ModuleNode::container()
        .with_child("model", inner)
        .with_child("lm_head", linear(cfg.vocab_size, h, 1.1)?);

    Ok(Model::new(cfg.architecture.clone(), root).with_input_embeddings("model.embed_tokens"))
}

pub fn llama_forward(model: &Model, input_ids: &Tensor) -> Result<Tensor> {
    let mut hidden = module(model, "model.embed_tokens")?.forward(input_ids)?;

    for i in 0..num_layers(model, "model.layers")? {
        let prefix = format!("model.layers.{i}");
        let self_attn = module(model, &format!("{prefix}.self_attn"))?;
        let heads = attr(self_attn, Attr::NumHeads)?;
        let kv_heads = attr(self_attn, Attr::NumKeyValueHeads)?;
        let project = |name: &str, x: &Tensor| -> Result<Tensor> {
            module(model, &format!("{prefix}.{name}"))?.forward(x)
        };
        let q = project("self_attn.q_proj", &hidden)?;
        let k = project("self_attn.k_proj", &hidden)?;
        let v = project("self_attn.v_proj", &hidden)?;
        let context = grouped_attention(&q, &k, &v, heads, kv_heads)?;
        hidden = (&hidden + project("self_attn.o_proj", &context)?)?;

        let gate = candle_nn::ops::silu(&project("mlp.gate_proj", &hidden)?)?;
        let up = project("mlp.up_proj", &hidden)?;
        hidden = (&hidden + project("mlp.down_proj", &(gate * up)?)?)?;
    }

    module(model, "lm_head")?.forward(&hidden)
}
