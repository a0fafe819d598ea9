use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::gather::{transpose_and_gather_feat, MASK_EPS};

/// Numerically stable binary cross-entropy on logits.
pub(crate) fn bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    target: Tensor<B, D>,
) -> Tensor<B, D> {
    let soft = logits.clone().abs().neg().exp().add_scalar(1.0).log();
    relu(logits.clone()) - logits * target + soft
}

/// Masked BCE-with-logits for multi-label attribute heads.
pub fn weighted_bce<B: Backend>(
    output: Tensor<B, 4>,
    mask: Tensor<B, 3>,
    ind: Tensor<B, 2, Int>,
    target: Tensor<B, 3>,
) -> Tensor<B, 1> {
    let pred = transpose_and_gather_feat(output, ind);
    let loss = bce_with_logits(pred, target) * mask.clone();
    loss.sum() / mask.sum().add_scalar(MASK_EPS)
}
