use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::gather::{select_channel, transpose_and_gather_feat};

/// Penalty-reduced focal loss on an activated heatmap.
///
/// `out` and `target` are `[N, C, H, W]`; positives are read at `ind`/`cat` (`[N, M]`) and
/// weighted by `mask`. With no positives the result is the negative term alone.
pub fn fast_focal_loss<B: Backend>(
    out: Tensor<B, 4>,
    target: Tensor<B, 4>,
    ind: Tensor<B, 2, Int>,
    mask: Tensor<B, 2>,
    cat: Tensor<B, 2, Int>,
) -> Tensor<B, 1> {
    let gt = target.neg().add_scalar(1.0).powf_scalar(4.0);
    let neg_log = out.clone().neg().add_scalar(1.0).log();
    let neg_loss = (neg_log * out.clone().powf_scalar(2.0) * gt).sum();

    let pos_pred = select_channel(transpose_and_gather_feat(out, ind), cat);
    let num_pos = mask.clone().sum();
    let pos_weights = pos_pred.clone().neg().add_scalar(1.0).powf_scalar(2.0) * mask;
    let pos_loss = (pos_pred.log() * pos_weights).sum();

    // mask is binary, so clamping the count to 1 only changes the no-positive case.
    (pos_loss + neg_loss).neg() / num_pos.clamp_min(1.0)
}
