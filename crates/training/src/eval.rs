//! Evaluation hooks: decode raw head maps, post-process into image space, and merge the
//! surviving detections into per-image results.

use anyhow::Context;
use burn::tensor::{backend::Backend, Tensor};
use data_contracts::{Detection, EvalResults, HostArray, HostArrays};
use models::HeadOutputs;

/// Turns one activated output stack into the top-`k` raw detections per image
/// (`scores`, `clses`, `xs`, `ys`, and per-head regressions).
pub trait DetectionDecoder<B: Backend> {
    fn decode(&self, output: &HeadOutputs<B>, k: usize) -> anyhow::Result<HostArrays>;
}

/// Geometry needed to map decoder output back to the original images.
#[derive(Debug, Clone, Copy)]
pub struct PostProcessContext<'a> {
    pub centers: &'a [[f32; 2]],
    pub scales: &'a [f32],
    pub out_height: usize,
    pub out_width: usize,
    pub num_classes: usize,
    pub calib: Option<&'a [[[f32; 4]; 3]]>,
}

/// Converts decoder output into structured detections, one list per image in the batch.
pub trait PostProcessor {
    fn post_process(
        &self,
        dets: &HostArrays,
        ctx: &PostProcessContext<'_>,
    ) -> anyhow::Result<Vec<Vec<Detection>>>;
}

/// Copies a tensor to the host as a [`HostArray`].
pub fn host_array<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> anyhow::Result<HostArray> {
    let shape = tensor.dims().to_vec();
    let data = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("tensor readback failed: {e:?}"))?;
    Ok(HostArray::new(shape, data)?)
}

/// Keeps detections scoring above `out_thresh` whose dimensions are all positive and stores
/// them under the matching image id.
pub fn merge_detections(
    per_image: Vec<Vec<Detection>>,
    img_ids: &[i64],
    out_thresh: f32,
    results: &mut EvalResults,
) -> anyhow::Result<()> {
    if per_image.len() != img_ids.len() {
        anyhow::bail!(
            "post-processing produced {} images but the batch has {} ids",
            per_image.len(),
            img_ids.len()
        );
    }
    for (dets, img_id) in per_image.into_iter().zip(img_ids) {
        let kept: Vec<Detection> = dets
            .into_iter()
            .filter(|d| d.score > out_thresh && d.has_positive_dims())
            .collect();
        results.insert(*img_id, kept);
    }
    Ok(())
}

/// Decode + post-process + merge for one validation batch.
#[allow(clippy::too_many_arguments)]
pub(crate) fn evaluate_batch<B: Backend>(
    decoder: &dyn DetectionDecoder<B>,
    post: &dyn PostProcessor,
    output: &HeadOutputs<B>,
    meta: &crate::batch::BatchMeta,
    k: usize,
    num_classes: usize,
    out_thresh: f32,
    results: &mut EvalResults,
) -> anyhow::Result<()> {
    let (out_height, out_width) = output
        .heatmap_size()
        .context("evaluation needs an `hm` head in the model output")?;
    let dets = decoder.decode(output, k).context("detection decode failed")?;
    let ctx = PostProcessContext {
        centers: &meta.centers,
        scales: &meta.scales,
        out_height,
        out_width,
        num_classes,
        calib: meta.calib.as_deref(),
    };
    let per_image = post
        .post_process(&dets, &ctx)
        .context("post-processing failed")?;
    merge_detections(per_image, &meta.img_ids, out_thresh, results)
}
