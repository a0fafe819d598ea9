//! Batches handed to the epoch driver and the loader contract that yields them.

use burn::tensor::{backend::Backend, Tensor};
use data_contracts::Detection;
use losses::LossTargets;

/// Per-image bookkeeping carried next to the tensors; used by post-processing and debugging.
#[derive(Debug, Clone, Default)]
pub struct BatchMeta {
    pub img_ids: Vec<i64>,
    /// Affine centre `[cx, cy]` of each input crop, in original image pixels.
    pub centers: Vec<[f32; 2]>,
    /// Affine scale of each input crop.
    pub scales: Vec<f32>,
    /// Camera projection `3x4` per image.
    pub calib: Option<Vec<[[f32; 4]; 3]>>,
    /// Ground-truth detections per image, when the loader provides them.
    pub gt_det: Option<Vec<Vec<Detection>>>,
}

#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// Normalised image `[N, 3, H, W]`.
    pub image: Tensor<B, 4>,
    /// Point-cloud heatmap channels at output resolution.
    pub pc_hm: Option<Tensor<B, 4>>,
    /// Point-cloud depth channels at output resolution.
    pub pc_dep: Option<Tensor<B, 4>>,
    /// Projection matrices `[N, 3, 4]`.
    pub calib: Tensor<B, 3>,
    pub targets: LossTargets<B>,
    pub meta: BatchMeta,
}

impl<B: Backend> Batch<B> {
    /// Number of images in the batch.
    pub fn num_images(&self) -> usize {
        self.image.dims()[0]
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            image: self.image.to_device(device),
            pc_hm: self.pc_hm.map(|t| t.to_device(device)),
            pc_dep: self.pc_dep.map(|t| t.to_device(device)),
            calib: self.calib.to_device(device),
            targets: self.targets.to_device(device),
            meta: self.meta,
        }
    }
}

/// Source of batches for one phase. `reset` rewinds to the first batch of a new epoch.
pub trait BatchLoader<B: Backend> {
    fn num_batches(&self) -> usize;

    fn reset(&mut self);

    fn next_batch(&mut self, device: &B::Device) -> anyhow::Result<Option<Batch<B>>>;
}

/// Loader over batches already held in memory.
#[derive(Debug, Clone)]
pub struct VecLoader<B: Backend> {
    batches: Vec<Batch<B>>,
    cursor: usize,
}

impl<B: Backend> VecLoader<B> {
    pub fn new(batches: Vec<Batch<B>>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl<B: Backend> BatchLoader<B> for VecLoader<B> {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn next_batch(&mut self, device: &B::Device) -> anyhow::Result<Option<Batch<B>>> {
        let Some(batch) = self.batches.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        Ok(Some(batch.clone().to_device(device)))
    }
}
