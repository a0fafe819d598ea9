use anyhow::Context;
use burn::tensor::{backend::Backend, Tensor};
use losses::{GenericLoss, LossBreakdown};
use models::{FusionDetector, HeadOutputs};

use crate::batch::Batch;

/// Result of one forward + loss pass.
#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    /// Last stack, with output activations applied (sigmoid heatmaps, decoded depth).
    pub output: HeadOutputs<B>,
    pub loss: Tensor<B, 1>,
    pub stats: LossBreakdown<B>,
}

/// Couples a detector with its loss so the trainer drives both in one call.
#[derive(Debug, Clone)]
pub struct ModelWithLoss<M> {
    pub model: M,
    pub loss: GenericLoss,
}

impl<M> ModelWithLoss<M> {
    pub fn new(model: M, loss: GenericLoss) -> Self {
        Self { model, loss }
    }

    pub fn forward<B: Backend>(&self, batch: &Batch<B>) -> anyhow::Result<StepOutput<B>>
    where
        M: FusionDetector<B>,
    {
        let mut outputs = self.model.forward_stacks(
            batch.image.clone(),
            batch.pc_hm.clone(),
            batch.pc_dep.clone(),
            batch.calib.clone(),
        );
        if outputs.is_empty() {
            anyhow::bail!("model returned no output stacks");
        }
        let (loss, stats) = self
            .loss
            .forward(&outputs, &batch.targets)
            .context("loss computation failed")?;
        let last = outputs
            .pop()
            .ok_or_else(|| anyhow::anyhow!("model returned no output stacks"))?;
        Ok(StepOutput {
            output: self.loss.activate(last),
            loss,
            stats,
        })
    }
}
