//! Move parameters to and from the device their shard descriptor implies.

use std::collections::HashMap;

use candle_core::{Device, Tensor, TensorId};
use tracing::debug;

use super::error::Result;
use crate::distributed::DeviceCommunicator;
use crate::model::{Model, Param};

/// Move `param` to the device of its recorded rank. A parameter without a
/// descriptor is placed as rank `(0, 0, 0)`.
pub fn allocate(comm: &dyn DeviceCommunicator, param: &mut Param) -> Result<()> {
    let shard = param.shard.unwrap_or_default();
    let device = comm.rank_to_device(shard.tp_rank, shard.pp_rank, shard.dp_rank)?;
    param.tensor = param.tensor.to_device(&device)?;
    Ok(())
}

/// Move `param` back to host memory.
pub fn deallocate(param: &mut Param) -> Result<()> {
    param.tensor = param.tensor.to_device(&Device::Cpu)?;
    Ok(())
}

/// [`allocate`] every parameter and buffer of `model`.
///
/// Tensors shared between modules (tied weights) are moved once and stay
/// shared.
pub fn allocate_model(comm: &dyn DeviceCommunicator, model: &mut Model) -> Result<()> {
    let moved = move_all(model, |param| {
        let shard = param.shard.unwrap_or_default();
        let device = comm.rank_to_device(shard.tp_rank, shard.pp_rank, shard.dp_rank)?;
        Ok(param.tensor.to_device(&device)?)
    })?;
    debug!(tensors = moved, "Allocated model parameters");
    Ok(())
}

/// [`deallocate`] every parameter and buffer of `model`.
pub fn deallocate_model(model: &mut Model) -> Result<()> {
    let moved = move_all(model, |param| Ok(param.tensor.to_device(&Device::Cpu)?))?;
    debug!(tensors = moved, "Deallocated model parameters");
    Ok(())
}

/// Replace every parameter with `place(param)`, once per distinct tensor.
/// Returns the number of distinct tensors.
fn move_all<F>(model: &mut Model, mut place: F) -> Result<usize>
where
    F: FnMut(&Param) -> Result<Tensor>,
{
    // Compute every destination first so a failure leaves the model as is.
    let mut placed: HashMap<TensorId, Tensor> = HashMap::new();
    for (_, param) in model.named_parameters() {
        if !placed.contains_key(&param.id()) {
            let tensor = place(param)?;
            placed.insert(param.id(), tensor);
        }
    }
    model.root.visit_mut(&mut |_, node| {
        for param in node.params_mut() {
            if let Some(tensor) = placed.get(&param.id()) {
                param.tensor = tensor.clone();
            }
        }
    });
    Ok(placed.len())
}
