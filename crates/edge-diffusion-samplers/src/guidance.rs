//! Classifier-Free Guidance utilities

use burn::prelude::*;

/// Apply classifier-free guidance
///
/// `uncond + scale * (cond - uncond)`. A scale of 1.0 returns the
/// conditional prediction.
pub fn apply_guidance<B: Backend>(
    noise_pred_uncond: Tensor<B, 4>,
    noise_pred_cond: Tensor<B, 4>,
    guidance_scale: f32,
) -> Tensor<B, 4> {
    noise_pred_uncond.clone() + (noise_pred_cond - noise_pred_uncond) * guidance_scale
}

/// Split a doubled-batch prediction into its unconditional and conditional
/// halves, in that order.
///
/// Returns `None` when the batch dimension is odd.
pub fn split_guidance_batch<B: Backend>(
    noise_pred: Tensor<B, 4>,
) -> Option<(Tensor<B, 4>, Tensor<B, 4>)> {
    let [batch, _, _, _] = noise_pred.dims();
    if batch == 0 || batch % 2 != 0 {
        return None;
    }
    let half = batch / 2;
    let uncond = noise_pred.clone().narrow(0, 0, half);
    let cond = noise_pred.narrow(0, half, half);
    Some((uncond, cond))
}
