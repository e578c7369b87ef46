/// Dimensions of a tiny test model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TinyConfig {
    pub architecture: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    /// Equal to `num_heads` unless the attention groups its key/value heads.
    pub num_key_value_heads: usize,
    pub num_layers: usize,
    pub intermediate_size: usize,
    pub max_positions: usize,
}

impl TinyConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }
}

/// Tiny GPT-2 config (2 layers, 8 hidden, 4 heads). The vocabulary of 10
/// does not divide evenly over 4 ranks.
pub fn tiny_gpt2_config() -> TinyConfig {
    TinyConfig {
        architecture: "GPT2LMHeadModel".to_string(),
        vocab_size: 10,
        hidden_size: 8,
        num_heads: 4,
        num_key_value_heads: 4,
        num_layers: 2,
        intermediate_size: 32,
        max_positions: 8,
    }
}

/// Tiny BERT config (1 layer, 8 hidden, 4 heads).
pub fn tiny_bert_config() -> TinyConfig {
    TinyConfig {
        architecture: "BertModel".to_string(),
        vocab_size: 12,
        hidden_size: 8,
        num_heads: 4,
        num_key_value_heads: 4,
        num_layers: 1,
        intermediate_size: 16,
        max_positions: 8,
    }
}

/// Tiny BERT with a masked-LM head whose decoder is tied to the word
/// embeddings and carries its own bias.
pub fn tiny_bert_mlm_config() -> TinyConfig {
    TinyConfig {
        architecture: "BertForMaskedLM".to_string(),
        ..tiny_bert_config()
    }
}

/// Tiny GPT-Neo config: separate Q/K/V projections, `[out, in]` layout.
pub fn tiny_gpt_neo_config() -> TinyConfig {
    TinyConfig {
        architecture: "GPTNeoForCausalLM".to_string(),
        vocab_size: 10,
        hidden_size: 8,
        num_heads: 4,
        num_key_value_heads: 4,
        num_layers: 2,
        intermediate_size: 16,
        max_positions: 8,
    }
}

/// Tiny Llama config with grouped key/value heads (8 query heads sharing
/// 4 key/value heads), so both counts split over 1, 2 and 4 ranks.
pub fn tiny_llama_config() -> TinyConfig {
    TinyConfig {
        architecture: "LlamaForCausalLM".to_string(),
        vocab_size: 12,
        hidden_size: 16,
        num_heads: 8,
        num_key_value_heads: 4,
        num_layers: 2,
        intermediate_size: 24,
        max_positions: 8,
    }
}
