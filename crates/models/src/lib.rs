//! Burn model surface for the camera + point-cloud fusion detector.
//!
//! - `HeadOutputs`: one prediction stack, head name to `[N, C, H, W]` map.
//! - `FusionDetector`: the forward contract the trainer drives.
//! - `FusionHeadsModel`: a small convolutional reference network implementing the contract.
//!
//! The reference model exists so training and evaluation can run end to end; it is not a
//! detector architecture.

pub mod outputs;

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use data_contracts::Head;

pub use outputs::HeadOutputs;

/// Forward contract: `(image, pc_hm, pc_dep, calib) -> per-stack outputs`.
pub trait FusionDetector<B: Backend> {
    fn forward_stacks(
        &self,
        image: Tensor<B, 4>,
        pc_hm: Option<Tensor<B, 4>>,
        pc_dep: Option<Tensor<B, 4>>,
        calib: Tensor<B, 3>,
    ) -> Vec<HeadOutputs<B>>;
}

#[derive(Debug, Clone)]
pub struct FusionHeadsModelConfig {
    pub heads: Vec<Head>,
    pub num_classes: usize,
    pub num_joints: usize,
    pub hidden: usize,
    pub down_ratio: usize,
    pub num_stacks: usize,
    /// Point-cloud heatmap channels concatenated after the stem.
    pub pc_channels: usize,
}

impl Default for FusionHeadsModelConfig {
    fn default() -> Self {
        Self {
            heads: vec![Head::Hm, Head::Reg, Head::Wh, Head::Dep, Head::Dim, Head::Rot],
            num_classes: 10,
            num_joints: 17,
            hidden: 32,
            down_ratio: 4,
            num_stacks: 1,
            pc_channels: 0,
        }
    }
}

#[derive(Debug, Module)]
pub struct FusionStack<B: Backend> {
    refine: Conv2d<B>,
    heads: Vec<Conv2d<B>>,
}

#[derive(Debug, Module)]
pub struct FusionHeadsModel<B: Backend> {
    stem: Conv2d<B>,
    stacks: Vec<FusionStack<B>>,
    head_order: Ignored<Vec<Head>>,
    pc_channels: usize,
}

impl<B: Backend> FusionHeadsModel<B> {
    pub fn new(cfg: FusionHeadsModelConfig, device: &B::Device) -> Self {
        let stride = cfg.down_ratio.max(1);
        let hidden = cfg.hidden.max(1);
        let stem = Conv2dConfig::new([3, hidden], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let fused = hidden + cfg.pc_channels;
        let mut stacks = Vec::with_capacity(cfg.num_stacks.max(1));
        for _ in 0..cfg.num_stacks.max(1) {
            let refine = Conv2dConfig::new([fused, hidden], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device);
            let heads = cfg
                .heads
                .iter()
                .map(|head| {
                    let out = head.channels(cfg.num_classes, cfg.num_joints);
                    Conv2dConfig::new([hidden, out], [1, 1]).init(device)
                })
                .collect();
            stacks.push(FusionStack { refine, heads });
        }
        Self {
            stem,
            stacks,
            head_order: Ignored(cfg.heads),
            pc_channels: cfg.pc_channels,
        }
    }

    pub fn heads(&self) -> &[Head] {
        &self.head_order.0
    }

    fn fuse_point_cloud(&self, feat: Tensor<B, 4>, pc_hm: Option<Tensor<B, 4>>) -> Tensor<B, 4> {
        if self.pc_channels == 0 {
            return feat;
        }
        let [n, _, h, w] = feat.dims();
        let pc = match pc_hm {
            Some(pc) if pc.dims() == [n, self.pc_channels, h, w] => pc,
            _ => Tensor::zeros([n, self.pc_channels, h, w], &feat.device()),
        };
        Tensor::cat(vec![feat, pc], 1)
    }
}

impl<B: Backend> FusionDetector<B> for FusionHeadsModel<B> {
    fn forward_stacks(
        &self,
        image: Tensor<B, 4>,
        pc_hm: Option<Tensor<B, 4>>,
        _pc_dep: Option<Tensor<B, 4>>,
        _calib: Tensor<B, 3>,
    ) -> Vec<HeadOutputs<B>> {
        let mut feat = relu(self.stem.forward(image));
        let mut outputs = Vec::with_capacity(self.stacks.len());
        for stack in &self.stacks {
            let fused = self.fuse_point_cloud(feat, pc_hm.clone());
            feat = relu(stack.refine.forward(fused));
            let mut out = HeadOutputs::new();
            for (head, conv) in self.head_order.0.iter().zip(&stack.heads) {
                out.insert(*head, conv.forward(feat.clone()));
            }
            outputs.push(out);
        }
        outputs
    }
}

pub mod prelude {
    pub use super::{FusionDetector, FusionHeadsModel, FusionHeadsModelConfig, HeadOutputs};
}
