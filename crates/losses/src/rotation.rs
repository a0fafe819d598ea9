//! Multi-bin rotation loss.
//!
//! An 8-channel rotation head encodes two overlapping angle bins:
//! `[bin1_logit0, bin1_logit1, bin1_sin, bin1_cos, bin2_logit0, bin2_logit1, bin2_sin, bin2_cos]`.

use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::gather::{channel, masked_mean, smooth_l1, transpose_and_gather_feat};

/// Two-way cross-entropy of logits `[N, M, 2]` against binary labels `[N, M]`.
fn bin_cross_entropy<B: Backend>(logits: Tensor<B, 3>, target: Tensor<B, 2>) -> Tensor<B, 2> {
    let logp = log_softmax(logits, 2);
    let lp0 = channel(&logp, 0);
    let lp1 = channel(&logp, 1);
    let negative = target.clone().neg().add_scalar(1.0);
    (target * lp1 + negative * lp0).neg()
}

/// Smooth-L1 between predicted `(sin, cos)` and the residual angle, per object.
fn residual_loss<B: Backend>(
    pred: &Tensor<B, 3>,
    sin_ch: usize,
    cos_ch: usize,
    res: Tensor<B, 2>,
) -> Tensor<B, 2> {
    smooth_l1(channel(pred, sin_ch) - res.clone().sin())
        + smooth_l1(channel(pred, cos_ch) - res.cos())
}

/// `rotbin` `[N, M, 2]` marks bin membership, `rotres` `[N, M, 2]` the in-bin residual angle.
pub fn bin_rot_loss<B: Backend>(
    output: Tensor<B, 4>,
    mask: Tensor<B, 2>,
    ind: Tensor<B, 2, Int>,
    rotbin: Tensor<B, 3, Int>,
    rotres: Tensor<B, 3>,
) -> Tensor<B, 1> {
    let pred = transpose_and_gather_feat(output, ind);
    let bins = rotbin.float();
    let bin1 = channel(&bins, 0);
    let bin2 = channel(&bins, 1);
    let res1 = channel(&rotres, 0);
    let res2 = channel(&rotres, 1);

    let loss_bin1 = masked_mean(
        bin_cross_entropy(pred.clone().narrow(2, 0, 2), bin1.clone()),
        mask.clone(),
    );
    let loss_bin2 = masked_mean(
        bin_cross_entropy(pred.clone().narrow(2, 4, 2), bin2.clone()),
        mask.clone(),
    );

    let loss_res1 = masked_mean(residual_loss(&pred, 2, 3, res1), bin1 * mask.clone());
    let loss_res2 = masked_mean(residual_loss(&pred, 6, 7, res2), bin2 * mask);

    loss_bin1 + loss_bin2 + loss_res1 + loss_res2
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;

    type B = burn_ndarray::NdArray<f32>;

    fn rot_map(values: [f32; 8]) -> Tensor<B, 4> {
        let data = TensorData::new(values.to_vec(), [1, 8, 1, 1]);
        Tensor::from_data(data, &Default::default())
    }

    fn run(values: [f32; 8], bins: [i64; 2], res: [f32; 2]) -> f32 {
        let device = Default::default();
        let mask = Tensor::<B, 2>::ones([1, 1], &device);
        let ind = Tensor::<B, 2, Int>::zeros([1, 1], &device);
        let rotbin = TensorData::new(bins.to_vec(), [1, 1, 2]);
        let rotbin = Tensor::<B, 3, Int>::from_data(rotbin, &device);
        let rotres = Tensor::<B, 3>::from_data(TensorData::new(res.to_vec(), [1, 1, 2]), &device);
        bin_rot_loss(rot_map(values), mask, ind, rotbin, rotres)
            .into_data()
            .to_vec::<f32>()
            .unwrap()[0]
    }

    #[test]
    fn confident_exact_prediction_has_small_loss() {
        let res = 0.4f32;
        let exact = [-10.0, 10.0, res.sin(), res.cos(), 10.0, -10.0, 0.0, 0.0];
        let good = run(exact, [1, 0], [res, 0.0]);
        assert!(good < 1e-3, "{good}");
    }

    #[test]
    fn wrong_bin_and_residual_cost_more() {
        let res = 0.4f32;
        let exact = [-10.0, 10.0, res.sin(), res.cos(), 10.0, -10.0, 0.0, 0.0];
        let good = run(exact, [1, 0], [res, 0.0]);
        let flipped = [10.0, -10.0, 0.0, -1.0, -10.0, 10.0, 0.0, 0.0];
        let bad = run(flipped, [1, 0], [res, 0.0]);
        assert!(bad > good + 1.0);
    }

    #[test]
    fn residual_of_inactive_bin_is_ignored() {
        let a = run([0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 5.0, 5.0], [1, 0], [0.0, 0.0]);
        let other = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, -5.0, 9.0];
        let b = run(other, [1, 0], [0.0, 0.0]);
        assert!((a - b).abs() < 1e-5);
    }
}
