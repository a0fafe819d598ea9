//! 3D box vertex loss: compares the eight corners implied by predicted and ground-truth
//! dimensions and observation angle.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

use crate::gather::{channel, expand_objects, transpose_and_gather_feat, MASK_EPS};

/// Corner sign pattern, `x` scales width, `y` length, `z` height.
const CORNER_X: [f32; 8] = [-1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0];
const CORNER_Y: [f32; 8] = [-1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0];
const CORNER_Z: [f32; 8] = [1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, -1.0];

/// Squared norms at or below this count as a zero vector, for which `atan2` gives 0.
const ZERO_EPS: f32 = 1e-12;

fn corner_signs<B: Backend>(
    signs: [f32; 8],
    n: usize,
    m: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    Tensor::<B, 1>::from_data(TensorData::new(signs.to_vec(), [8]), device)
        .reshape([1, 1, 8])
        .repeat(&[n, m, 1])
}

/// Corners `[N, M, 8, 3]` of boxes with dims `[h, w, l]` (`[N, M, 3]`), rotated in the
/// `x`/`y` plane by the angle whose cosine and sine are given per object (`[N, M]`).
pub fn box_corners<B: Backend>(
    dim: Tensor<B, 3>,
    cos: Tensor<B, 2>,
    sin: Tensor<B, 2>,
) -> Tensor<B, 4> {
    let [n, m, _] = dim.dims();
    let device = dim.device();
    let half = dim.mul_scalar(0.5);
    let h = expand_objects(channel(&half, 0), 8);
    let w = expand_objects(channel(&half, 1), 8);
    let l = expand_objects(channel(&half, 2), 8);

    let x = w * corner_signs::<B>(CORNER_X, n, m, &device);
    let y = l * corner_signs::<B>(CORNER_Y, n, m, &device);
    let z = h * corner_signs::<B>(CORNER_Z, n, m, &device);

    let c = expand_objects(cos, 8);
    let s = expand_objects(sin, 8);
    let xr = c.clone() * x.clone() - s.clone() * y.clone();
    let yr = s * x + c * y;

    Tensor::cat(
        vec![
            xr.reshape([n, m, 8, 1]),
            yr.reshape([n, m, 8, 1]),
            z.reshape([n, m, 8, 1]),
        ],
        3,
    )
}

/// `(cos, sin)` of `atan2(s, c) + offset` for `offset = -/+ pi/2`, given as `sign = -/+ 1`.
///
/// A zero vector takes angle 0, so the result is the bin centre itself.
fn bin_angle<B: Backend>(
    s: Tensor<B, 2>,
    c: Tensor<B, 2>,
    sign: f32,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let sq = s.clone().powf_scalar(2.0) + c.clone().powf_scalar(2.0);
    let valid = sq.clone().greater_elem(ZERO_EPS).float();
    let r = sq.add_scalar(ZERO_EPS).sqrt();
    let centre = valid.clone().neg().add_scalar(1.0).mul_scalar(sign);
    let cos = (s / r.clone()).mul_scalar(-sign) * valid.clone();
    let sin = (c / r).mul_scalar(sign) * valid + centre;
    (cos, sin)
}

/// `(cos, sin)` of the predicted observation angle.
///
/// The bin whose positive logit is larger wins; bin 1 is centred at `-pi/2`, bin 2 at
/// `+pi/2`.
fn predicted_alpha<B: Backend>(rot: &Tensor<B, 3>) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let (cos1, sin1) = bin_angle(channel(rot, 2), channel(rot, 3), -1.0);
    let (cos2, sin2) = bin_angle(channel(rot, 6), channel(rot, 7), 1.0);

    let pick1 = channel(rot, 1).greater(channel(rot, 5)).float();
    let pick2 = pick1.clone().neg().add_scalar(1.0);
    let cos = pick1.clone() * cos1 + pick2.clone() * cos2;
    let sin = pick1 * sin1 + pick2 * sin2;
    (cos, sin)
}

/// Summed corner L1 over objects with an active rotation bin, divided by the dimension
/// mask sum. Dimensions are masked with `dim_mask` before corners are built.
#[allow(clippy::too_many_arguments)]
pub fn vertex_loss<B: Backend>(
    dim_output: Tensor<B, 4>,
    dim_mask: Tensor<B, 3>,
    ind: Tensor<B, 2, Int>,
    dim_target: Tensor<B, 3>,
    rot_output: Tensor<B, 4>,
    rot_mask: Tensor<B, 2>,
    rotbin: Tensor<B, 3, Int>,
    rotres: Tensor<B, 3>,
) -> Tensor<B, 1> {
    let [n, m] = ind.dims();
    let dim_pred = transpose_and_gather_feat(dim_output, ind.clone()) * dim_mask.clone();
    let dim_gt = dim_target * dim_mask.clone();
    let rot = transpose_and_gather_feat(rot_output, ind);

    let bins = rotbin.float();
    let b0 = channel(&bins, 0);
    let b1 = channel(&bins, 1);
    let active = b0.clone() + b1.clone() - b0.clone() * b1;
    let selected = rot_mask * active;

    let (cos_pred, sin_pred) = predicted_alpha(&rot);

    // Ground-truth alpha is the residual of bin 1 when set (centred at -pi/2), else of bin 2
    // (centred at +pi/2).
    let use1 = b0.clone();
    let use2 = b0.neg().add_scalar(1.0);
    let res1 = channel(&rotres, 0);
    let res2 = channel(&rotres, 1);
    let cos_gt = use1.clone() * res1.clone().sin() - use2.clone() * res2.clone().sin();
    let sin_gt = use2 * res2.cos() - use1 * res1.cos();

    let pred = box_corners(dim_pred, cos_pred, sin_pred);
    let gt = box_corners(dim_gt, cos_gt, sin_gt);
    let weight = selected.reshape([n, m, 1, 1]).repeat(&[1, 1, 8, 3]);

    ((pred - gt).abs() * weight).sum() / dim_mask.sum().add_scalar(MASK_EPS)
}
