//! Depth-aware weighting and the depth regression criterion.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use serde::{Deserialize, Serialize};

use crate::gather::{expand_objects, transpose_and_gather_feat, MASK_EPS};

/// How ground-truth depth scales per-object regression error.
///
/// With `r = clamp(depth / m, 0, 1)`:
/// - `none`: 1
/// - `threshold`: `factor` beyond `m`, 1 otherwise
/// - `linear`: `1 + factor * r`
/// - `exponential`: `exp(factor * r)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthAdjustment {
    #[default]
    None,
    Threshold,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthScaling {
    pub kind: DepthAdjustment,
    /// Reference depth in metres.
    pub m: f32,
    pub factor: f32,
}

impl Default for DepthScaling {
    fn default() -> Self {
        Self {
            kind: DepthAdjustment::None,
            m: 50.0,
            factor: 1.0,
        }
    }
}

impl DepthScaling {
    pub fn is_active(&self) -> bool {
        self.kind != DepthAdjustment::None
    }

    /// Per-object weights `[N, M]` from ground-truth depth `[N, M, 1]`, or `None` when
    /// inactive. Slots outside `dep_mask` read depth 0 and so get the neutral weight 1.
    pub fn weights<B: Backend>(
        &self,
        dep: Tensor<B, 3>,
        dep_mask: Tensor<B, 3>,
    ) -> Option<Tensor<B, 2>> {
        let [n, m, _] = dep.dims();
        let depth = (dep.narrow(2, 0, 1) * dep_mask.narrow(2, 0, 1)).reshape([n, m]);
        let reference = self.m.max(f32::EPSILON);
        match self.kind {
            DepthAdjustment::None => None,
            DepthAdjustment::Threshold => {
                let far = depth.greater_elem(reference).float();
                Some(far.mul_scalar(self.factor - 1.0).add_scalar(1.0))
            }
            DepthAdjustment::Linear => {
                let r = depth.div_scalar(reference).clamp(0.0, 1.0);
                Some(r.mul_scalar(self.factor).add_scalar(1.0))
            }
            DepthAdjustment::Exponential => {
                let r = depth.div_scalar(reference).clamp(0.0, 1.0);
                Some(r.mul_scalar(self.factor).exp())
            }
        }
    }
}

/// Masked L1 between `pred` and `target` (`[N, M, D]`), optionally weighted per object,
/// normalised by the unweighted mask sum.
pub fn weighted_l1<B: Backend>(
    pred: Tensor<B, 3>,
    target: Tensor<B, 3>,
    mask: Tensor<B, 3>,
    weights: Option<Tensor<B, 2>>,
) -> Tensor<B, 1> {
    let [_, _, d] = pred.dims();
    let err = (pred * mask.clone() - target * mask.clone()).abs();
    let err = match weights {
        Some(w) => err * expand_objects(w, d),
        None => err,
    };
    err.sum() / mask.sum().add_scalar(MASK_EPS)
}

/// Depth loss on an activated depth map `[N, C, H, W]`.
///
/// A single-channel map is compared directly; a per-class map is read at `cat`.
pub fn depth_loss<B: Backend>(
    output: Tensor<B, 4>,
    target: Tensor<B, 3>,
    ind: Tensor<B, 2, Int>,
    mask: Tensor<B, 3>,
    cat: Tensor<B, 2, Int>,
    weights: Option<Tensor<B, 2>>,
) -> Tensor<B, 1> {
    let pred = transpose_and_gather_feat(output, ind);
    let [n, m, c] = pred.dims();
    let pred = if c > 1 {
        pred.gather(2, cat.reshape([n, m, 1]))
    } else {
        pred
    };
    weighted_l1(pred, target.narrow(2, 0, 1), mask.narrow(2, 0, 1), weights)
}
