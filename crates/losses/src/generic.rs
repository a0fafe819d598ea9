//! Multi-head, multi-stack loss aggregation.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use data_contracts::{Head, HeadWeights, LOSS_ORDER};
use models::HeadOutputs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::attribute::weighted_bce;
use crate::depth::{depth_loss, DepthScaling};
use crate::error::LossError;
use crate::focal::fast_focal_loss;
use crate::gather::{depth_activation, sigmoid_clamped};
use crate::regression::reg_weighted_l1;
use crate::rotation::bin_rot_loss;
use crate::targets::LossTargets;
use crate::vertex::vertex_loss;

/// Eight corners share one box, so the corner loss is scaled down by 8.
pub const VERTEX_LOSS_SCALE: f32 = 0.125;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub heads: Vec<Head>,
    pub weights: HeadWeights,
    pub num_stacks: usize,
    pub penalize_vertex_loss: bool,
    pub depth: DepthScaling,
    /// Apply the inverse-sigmoid depth encoding to `dep_sec` as well.
    pub sigmoid_dep_sec: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            heads: vec![Head::Hm, Head::Reg, Head::Wh, Head::Dep, Head::Dim, Head::Rot],
            weights: HeadWeights::default(),
            num_stacks: 1,
            penalize_vertex_loss: false,
            depth: DepthScaling::default(),
            sigmoid_dep_sec: false,
        }
    }
}

/// Key of one entry in the loss breakdown, ordered `tot`, heads, `vertex_loss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LossKey {
    Total,
    Head(Head),
    Vertex,
}

impl LossKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossKey::Total => "tot",
            LossKey::Head(h) => h.as_str(),
            LossKey::Vertex => "vertex_loss",
        }
    }
}

impl fmt::Display for LossKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-key scalar losses of one forward pass.
#[derive(Debug, Clone)]
pub struct LossBreakdown<B: Backend> {
    entries: BTreeMap<LossKey, Tensor<B, 1>>,
}

impl<B: Backend> LossBreakdown<B> {
    pub fn get(&self, key: LossKey) -> Option<&Tensor<B, 1>> {
        self.entries.get(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = LossKey> + '_ {
        self.entries.keys().copied()
    }

    /// Reads every entry back to the host.
    pub fn to_scalars(&self) -> Result<BTreeMap<LossKey, f32>, LossError> {
        self.entries
            .iter()
            .map(|(k, t)| {
                let values = t
                    .clone()
                    .into_data()
                    .convert::<f32>()
                    .to_vec::<f32>()
                    .map_err(|e| LossError::Readback {
                        key: k.as_str(),
                        reason: format!("{e:?}"),
                    })?;
                let v = values.first().copied().ok_or_else(|| LossError::Readback {
                    key: k.as_str(),
                    reason: "empty tensor".to_string(),
                })?;
                Ok((*k, v))
            })
            .collect()
    }
}

fn accumulate<B: Backend>(acc: &mut BTreeMap<Head, Tensor<B, 1>>, head: Head, loss: Tensor<B, 1>) {
    if let Some(slot) = acc.get_mut(&head) {
        *slot = slot.clone() + loss;
    }
}

#[derive(Debug, Clone)]
pub struct GenericLoss {
    config: LossConfig,
}

impl GenericLoss {
    pub fn new(config: LossConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Keys reported by [`Self::forward`]: `tot`, configured heads in loss order, and
    /// `vertex_loss` when the vertex penalty is on.
    pub fn stat_keys(&self) -> Vec<LossKey> {
        let mut keys = vec![LossKey::Total];
        keys.extend(
            LOSS_ORDER
                .iter()
                .filter(|h| self.config.heads.contains(h))
                .map(|h| LossKey::Head(*h)),
        );
        if self.config.penalize_vertex_loss {
            keys.push(LossKey::Vertex);
        }
        keys
    }

    /// Applies the output activations: clamped sigmoid on `hm`/`hm_hp` and the
    /// inverse-sigmoid depth encoding on `dep` (and `dep_sec` when configured).
    pub fn activate<B: Backend>(&self, mut output: HeadOutputs<B>) -> HeadOutputs<B> {
        for head in [Head::Hm, Head::HmHp] {
            if let Some(t) = output.remove(head) {
                output.insert(head, sigmoid_clamped(t));
            }
        }
        if let Some(t) = output.remove(Head::Dep) {
            output.insert(Head::Dep, depth_activation(t));
        }
        if self.config.sigmoid_dep_sec {
            if let Some(t) = output.remove(Head::DepSec) {
                output.insert(Head::DepSec, depth_activation(t));
            }
        }
        output
    }

    fn depth_weights<B: Backend>(
        &self,
        targets: &LossTargets<B>,
    ) -> Result<Option<Tensor<B, 2>>, LossError> {
        if !self.config.depth.is_active() {
            return Ok(None);
        }
        let dep = targets
            .dep
            .as_ref()
            .ok_or_else(|| LossError::missing(Head::Dep, "dep"))?;
        let (target, mask) = (dep.target.clone(), dep.mask.clone());
        Ok(self.config.depth.weights(target, mask))
    }

    /// Loss of one head in one activated stack, or `None` for heads scored elsewhere.
    fn head_loss<B: Backend>(
        &self,
        head: Head,
        pred: Tensor<B, 4>,
        targets: &LossTargets<B>,
        weights: &Option<Tensor<B, 2>>,
    ) -> Result<Option<Tensor<B, 1>>, LossError> {
        let loss = match head {
            Head::Hm => {
                let hm = targets
                    .hm
                    .clone()
                    .ok_or_else(|| LossError::missing(head, "hm"))?;
                fast_focal_loss(
                    pred,
                    hm,
                    targets.ind.clone(),
                    targets.mask.clone(),
                    targets.cat.clone(),
                )
            }
            Head::Dep | Head::DepSec => {
                let dep = targets
                    .dep
                    .as_ref()
                    .ok_or_else(|| LossError::missing(head, "dep"))?;
                depth_loss(
                    pred,
                    dep.target.clone(),
                    targets.ind.clone(),
                    dep.mask.clone(),
                    targets.cat.clone(),
                    weights.clone(),
                )
            }
            Head::Reg
            | Head::Wh
            | Head::Tracking
            | Head::Ltrb
            | Head::LtrbAmodal
            | Head::Hps
            | Head::Dim
            | Head::AmodelOffset
            | Head::Velocity => {
                let t = targets
                    .regression
                    .get(&head)
                    .ok_or_else(|| LossError::missing(head, head.as_str()))?;
                reg_weighted_l1(
                    pred,
                    t.mask.clone(),
                    targets.ind.clone(),
                    t.target.clone(),
                    weights.clone(),
                )
            }
            Head::HmHp => {
                let kp = targets
                    .keypoints
                    .as_ref()
                    .ok_or_else(|| LossError::missing(head, "hm_hp"))?;
                fast_focal_loss(
                    pred,
                    kp.hm_hp.clone(),
                    kp.hp_ind.clone(),
                    kp.hm_hp_mask.clone(),
                    kp.joint.clone(),
                )
            }
            // Scored together with `hm_hp`, against keypoint indices.
            Head::HpOffset => return Ok(None),
            Head::Rot | Head::RotSec => {
                let rot = targets
                    .rotation
                    .as_ref()
                    .ok_or_else(|| LossError::missing(head, "rotbin"))?;
                bin_rot_loss(
                    pred,
                    rot.mask.clone(),
                    targets.ind.clone(),
                    rot.rotbin.clone(),
                    rot.rotres.clone(),
                )
            }
            Head::NuscenesAtt => {
                let att = targets
                    .nuscenes_att
                    .as_ref()
                    .ok_or_else(|| LossError::missing(head, "nuscenes_att"))?;
                weighted_bce(
                    pred,
                    att.mask.clone(),
                    targets.ind.clone(),
                    att.target.clone(),
                )
            }
        };
        Ok(Some(loss))
    }

    fn keypoint_offset_loss<B: Backend>(
        &self,
        output: &HeadOutputs<B>,
        targets: &LossTargets<B>,
    ) -> Result<Option<Tensor<B, 1>>, LossError> {
        let (Some(pred), Some(kp)) = (output.get(Head::HpOffset), targets.keypoints.as_ref()) else {
            return Ok(None);
        };
        let off = kp
            .hp_offset
            .as_ref()
            .ok_or_else(|| LossError::missing(Head::HpOffset, "hp_offset"))?;
        Ok(Some(reg_weighted_l1(
            pred.clone(),
            off.mask.clone(),
            kp.hp_ind.clone(),
            off.target.clone(),
            None,
        )))
    }

    fn stack_vertex_loss<B: Backend>(
        &self,
        output: &HeadOutputs<B>,
        targets: &LossTargets<B>,
    ) -> Result<Tensor<B, 1>, LossError> {
        let dim_out = output
            .get(Head::Dim)
            .ok_or(LossError::MissingOutput(Head::Dim))?;
        let rot_out = output
            .get(Head::RotSec)
            .or_else(|| output.get(Head::Rot))
            .ok_or(LossError::MissingOutput(Head::RotSec))?;
        let dim = targets
            .regression
            .get(&Head::Dim)
            .ok_or_else(|| LossError::missing(Head::Dim, "dim"))?;
        let rot = targets
            .rotation
            .as_ref()
            .ok_or_else(|| LossError::missing(Head::Rot, "rotbin"))?;
        Ok(vertex_loss(
            dim_out.clone(),
            dim.mask.clone(),
            targets.ind.clone(),
            dim.target.clone(),
            rot_out.clone(),
            rot.mask.clone(),
            rot.rotbin.clone(),
            rot.rotres.clone(),
        ))
    }

    /// Scores the first `num_stacks` outputs against `targets`.
    ///
    /// Each head's loss is averaged over stacks; the total is the weighted sum over
    /// configured heads plus the scaled vertex loss.
    pub fn forward<B: Backend>(
        &self,
        outputs: &[HeadOutputs<B>],
        targets: &LossTargets<B>,
    ) -> Result<(Tensor<B, 1>, LossBreakdown<B>), LossError> {
        let num_stacks = self.config.num_stacks.max(1);
        if outputs.len() < num_stacks {
            return Err(LossError::StackCount {
                expected: num_stacks,
                actual: outputs.len(),
            });
        }
        let device = targets.mask.device();
        let stack_scale = 1.0 / num_stacks as f32;
        let weights = self.depth_weights(targets)?;

        let mut per_head: BTreeMap<Head, Tensor<B, 1>> = self
            .config
            .heads
            .iter()
            .map(|h| (*h, Tensor::zeros([1], &device)))
            .collect();
        let mut vertex = Tensor::<B, 1>::zeros([1], &device);

        for output in outputs.iter().take(num_stacks) {
            let output = self.activate(output.clone());
            for (head, pred) in output.iter() {
                if !per_head.contains_key(&head) {
                    continue;
                }
                if let Some(loss) = self.head_loss(head, pred.clone(), targets, &weights)? {
                    accumulate(&mut per_head, head, loss.mul_scalar(stack_scale));
                }
                if head == Head::HmHp && per_head.contains_key(&Head::HpOffset) {
                    if let Some(loss) = self.keypoint_offset_loss(&output, targets)? {
                        let loss = loss.mul_scalar(stack_scale);
                        accumulate(&mut per_head, Head::HpOffset, loss);
                    }
                }
            }
            if self.config.penalize_vertex_loss {
                let loss = self.stack_vertex_loss(&output, targets)?;
                vertex = vertex + loss.mul_scalar(stack_scale);
            }
        }

        let mut total = Tensor::<B, 1>::zeros([1], &device);
        for (head, loss) in &per_head {
            total = total + loss.clone().mul_scalar(self.config.weights.weight(*head));
        }

        let mut entries: BTreeMap<LossKey, Tensor<B, 1>> = per_head
            .into_iter()
            .map(|(h, t)| (LossKey::Head(h), t))
            .collect();
        if self.config.penalize_vertex_loss {
            let scaled = vertex.mul_scalar(VERTEX_LOSS_SCALE);
            total = total + scaled.clone();
            entries.insert(LossKey::Vertex, scaled);
        }
        entries.insert(LossKey::Total, total.clone());

        Ok((total, LossBreakdown { entries }))
    }
}
