//! Shared test utilities for tp-core.
//!
//! Tiny model graphs, deterministic weights and a helper that runs one
//! closure per tensor-parallel rank on its own thread.

mod tiny_config;
mod tiny_models;

use std::sync::Arc;
use std::thread;

use candle_core::Device;

use crate::distributed::{DeviceCommunicator, ThreadGroup};

pub use tiny_config::{
    tiny_bert_config, tiny_bert_mlm_config, tiny_gpt2_config, tiny_gpt_neo_config,
    tiny_llama_config, TinyConfig,
};
pub use tiny_models::{
    bert_forward, bert_from_config, bert_mlm_forward, bert_mlm_from_config, gpt2_forward,
    gpt2_from_config, gpt_neo_forward, gpt_neo_from_config, llama_forward, llama_from_config,
    max_abs_diff, seeded, tiny_bert, tiny_bert_mlm, tiny_gpt2, tiny_gpt_neo, tiny_llama,
};

/// Run `f` once per rank of a `world_size` thread group on the CPU and
/// return the results in rank order. A panic on any rank is re-raised.
pub fn run_ranks<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(Arc<dyn DeviceCommunicator>) -> T + Sync,
{
    let comms = ThreadGroup::shared_mesh(world_size, &Device::Cpu);
    thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = &f;
                s.spawn(move || f(comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    })
}
