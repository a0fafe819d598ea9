//! Feature gathering, output activations, and masked reductions shared by the criteria.

use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

/// Normaliser epsilon added to mask sums.
pub const MASK_EPS: f32 = 1e-4;

/// Gathers `feat[N, C, H, W]` at flat spatial indices `ind[N, M]`, giving `[N, M, C]`.
pub fn transpose_and_gather_feat<B: Backend>(
    feat: Tensor<B, 4>,
    ind: Tensor<B, 2, Int>,
) -> Tensor<B, 3> {
    let [n, c, h, w] = feat.dims();
    let [_, m] = ind.dims();
    let flat = feat.reshape([n, c, h * w]).swap_dims(1, 2);
    let index = ind.reshape([n, m, 1]).repeat(&[1, 1, c]);
    flat.gather(1, index)
}

/// Picks channel `cat[n, m]` out of gathered features `[N, M, C]`, giving `[N, M]`.
pub fn select_channel<B: Backend>(gathered: Tensor<B, 3>, cat: Tensor<B, 2, Int>) -> Tensor<B, 2> {
    let [n, m] = cat.dims();
    gathered.gather(2, cat.reshape([n, m, 1])).reshape([n, m])
}

/// Sigmoid clamped away from 0 and 1 so focal logs stay finite.
pub fn sigmoid_clamped<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    sigmoid(x).clamp(1e-4, 1.0 - 1e-4)
}

/// Inverse-sigmoid depth encoding: `1 / (sigmoid(x) + 1e-6) - 1`.
pub fn depth_activation<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    sigmoid(x).add_scalar(1e-6).recip().sub_scalar(1.0)
}

/// Channel `k` of `[N, M, C]` as `[N, M]`.
pub(crate) fn channel<B: Backend>(t: &Tensor<B, 3>, k: usize) -> Tensor<B, 2> {
    let [n, m, _] = t.dims();
    t.clone().narrow(2, k, 1).reshape([n, m])
}

/// `sum(values * mask) / (sum(mask) + eps)`.
pub(crate) fn masked_mean<B: Backend, const D: usize>(
    values: Tensor<B, D>,
    mask: Tensor<B, D>,
) -> Tensor<B, 1> {
    let denom = mask.clone().sum().add_scalar(MASK_EPS);
    (values * mask).sum() / denom
}

/// Elementwise smooth-L1 (beta = 1) of a difference tensor.
pub(crate) fn smooth_l1<B: Backend, const D: usize>(diff: Tensor<B, D>) -> Tensor<B, D> {
    let a = diff.abs();
    let q = a.clone().clamp_max(1.0);
    q.clone().powf_scalar(2.0).mul_scalar(0.5) + (a - q)
}

/// Broadcasts per-object weights `[N, M]` over `d` trailing channels.
pub(crate) fn expand_objects<B: Backend>(w: Tensor<B, 2>, d: usize) -> Tensor<B, 3> {
    let [n, m] = w.dims();
    w.reshape([n, m, 1]).repeat(&[1, 1, d])
}
