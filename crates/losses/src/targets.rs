//! Ground-truth tensors consumed by [`crate::GenericLoss`].

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use data_contracts::Head;
use std::collections::BTreeMap;

/// Target values `[N, M, D]` with a matching mask.
#[derive(Debug, Clone)]
pub struct MaskedTarget<B: Backend> {
    pub target: Tensor<B, 3>,
    pub mask: Tensor<B, 3>,
}

impl<B: Backend> MaskedTarget<B> {
    pub fn new(target: Tensor<B, 3>, mask: Tensor<B, 3>) -> Self {
        Self { target, mask }
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            target: self.target.to_device(device),
            mask: self.mask.to_device(device),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RotationTarget<B: Backend> {
    /// `[N, M]`
    pub mask: Tensor<B, 2>,
    /// `[N, M, 2]` bin membership flags.
    pub rotbin: Tensor<B, 3, Int>,
    /// `[N, M, 2]` residual angle within each bin.
    pub rotres: Tensor<B, 3>,
}

impl<B: Backend> RotationTarget<B> {
    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            mask: self.mask.to_device(device),
            rotbin: self.rotbin.to_device(device),
            rotres: self.rotres.to_device(device),
        }
    }
}

/// Keypoint heatmap targets; indices run over `objects * joints`.
#[derive(Debug, Clone)]
pub struct KeypointTargets<B: Backend> {
    pub hm_hp: Tensor<B, 4>,
    pub hp_ind: Tensor<B, 2, Int>,
    pub hm_hp_mask: Tensor<B, 2>,
    pub joint: Tensor<B, 2, Int>,
    pub hp_offset: Option<MaskedTarget<B>>,
}

impl<B: Backend> KeypointTargets<B> {
    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            hm_hp: self.hm_hp.to_device(device),
            hp_ind: self.hp_ind.to_device(device),
            hm_hp_mask: self.hm_hp_mask.to_device(device),
            joint: self.joint.to_device(device),
            hp_offset: self.hp_offset.map(|t| t.to_device(device)),
        }
    }
}

/// Per-batch ground truth, one slot per object (`M` slots, padded and masked).
#[derive(Debug, Clone)]
pub struct LossTargets<B: Backend> {
    /// Class heatmap `[N, C, H, W]`.
    pub hm: Option<Tensor<B, 4>>,
    /// Flat output-map index per object `[N, M]`.
    pub ind: Tensor<B, 2, Int>,
    /// Object presence `[N, M]`.
    pub mask: Tensor<B, 2>,
    /// Class per object `[N, M]`.
    pub cat: Tensor<B, 2, Int>,
    /// Depth `[N, M, 1]` and its mask.
    pub dep: Option<MaskedTarget<B>>,
    pub regression: BTreeMap<Head, MaskedTarget<B>>,
    pub rotation: Option<RotationTarget<B>>,
    pub nuscenes_att: Option<MaskedTarget<B>>,
    pub keypoints: Option<KeypointTargets<B>>,
}

impl<B: Backend> LossTargets<B> {
    pub fn new(ind: Tensor<B, 2, Int>, mask: Tensor<B, 2>, cat: Tensor<B, 2, Int>) -> Self {
        Self {
            hm: None,
            ind,
            mask,
            cat,
            dep: None,
            regression: BTreeMap::new(),
            rotation: None,
            nuscenes_att: None,
            keypoints: None,
        }
    }

    pub fn with_heatmap(mut self, hm: Tensor<B, 4>) -> Self {
        self.hm = Some(hm);
        self
    }

    pub fn with_depth(mut self, dep: Tensor<B, 3>, dep_mask: Tensor<B, 3>) -> Self {
        self.dep = Some(MaskedTarget::new(dep, dep_mask));
        self
    }

    pub fn with_regression(mut self, head: Head, target: Tensor<B, 3>, mask: Tensor<B, 3>) -> Self {
        self.regression.insert(head, MaskedTarget::new(target, mask));
        self
    }

    pub fn with_rotation(
        mut self,
        mask: Tensor<B, 2>,
        rotbin: Tensor<B, 3, Int>,
        rotres: Tensor<B, 3>,
    ) -> Self {
        self.rotation = Some(RotationTarget {
            mask,
            rotbin,
            rotres,
        });
        self
    }

    pub fn with_attributes(mut self, target: Tensor<B, 3>, mask: Tensor<B, 3>) -> Self {
        self.nuscenes_att = Some(MaskedTarget::new(target, mask));
        self
    }

    pub fn with_keypoints(mut self, keypoints: KeypointTargets<B>) -> Self {
        self.keypoints = Some(keypoints);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.ind.dims()[0]
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            hm: self.hm.map(|t| t.to_device(device)),
            ind: self.ind.to_device(device),
            mask: self.mask.to_device(device),
            cat: self.cat.to_device(device),
            dep: self.dep.map(|t| t.to_device(device)),
            regression: self
                .regression
                .into_iter()
                .map(|(h, t)| (h, t.to_device(device)))
                .collect(),
            rotation: self.rotation.map(|t| t.to_device(device)),
            nuscenes_att: self.nuscenes_att.map(|t| t.to_device(device)),
            keypoints: self.keypoints.map(|t| t.to_device(device)),
        }
    }
}
