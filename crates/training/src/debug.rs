//! Debug hook invoked per iteration when `debug > 0`.

use anyhow::Context;
use burn::tensor::backend::Backend;
use data_contracts::{Detection, HostArrays};
use models::HeadOutputs;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::batch::Batch;

/// Debug level at which records are written to disk instead of logged.
pub const DUMP_LEVEL: u8 = 4;

/// What the trainer hands the debugger each iteration.
pub struct DebugFrame<'a, B: Backend> {
    pub epoch: usize,
    pub iter_id: usize,
    pub batch: &'a Batch<B>,
    pub output: &'a HeadOutputs<B>,
    /// Decoded top-k detections, when a decoder is attached.
    pub detections: Option<&'a HostArrays>,
}

pub trait Debugger<B: Backend> {
    fn debug(&mut self, frame: DebugFrame<'_, B>) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize)]
struct DebugRecord<'a> {
    epoch: usize,
    iter_id: usize,
    img_ids: &'a [i64],
    head_shapes: BTreeMap<String, Vec<usize>>,
    heatmap_peak: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detections: Option<&'a HostArrays>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gt_det: Option<&'a [Vec<Detection>]>,
}

/// Summarises each iteration via `tracing`; at [`DUMP_LEVEL`] writes a JSON record per
/// iteration into its directory.
#[derive(Debug, Clone)]
pub struct JsonDumpDebugger {
    dir: PathBuf,
    level: u8,
}

impl JsonDumpDebugger {
    pub fn new(dir: impl Into<PathBuf>, level: u8) -> Self {
        Self {
            dir: dir.into(),
            level,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl<B: Backend> Debugger<B> for JsonDumpDebugger {
    fn debug(&mut self, frame: DebugFrame<'_, B>) -> anyhow::Result<()> {
        let head_shapes = frame
            .output
            .iter()
            .map(|(head, t)| (head.to_string(), t.dims().to_vec()))
            .collect();
        let heatmap_peak = frame
            .output
            .get(data_contracts::Head::Hm)
            .and_then(|hm| {
                let peak = hm.clone().max().into_data().convert::<f32>();
                peak.to_vec::<f32>().ok()
            })
            .and_then(|v| v.first().copied());
        let record = DebugRecord {
            epoch: frame.epoch,
            iter_id: frame.iter_id,
            img_ids: &frame.batch.meta.img_ids,
            head_shapes,
            heatmap_peak,
            detections: frame.detections,
            gt_det: frame.batch.meta.gt_det.as_deref(),
        };

        if self.level < DUMP_LEVEL {
            tracing::debug!(
                epoch = record.epoch,
                iter = record.iter_id,
                images = record.img_ids.len(),
                peak = record.heatmap_peak.unwrap_or(0.0),
                "debug frame"
            );
            return Ok(());
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating debug dir {}", self.dir.display()))?;
        let path = self
            .dir
            .join(format!("epoch{:03}_iter{:06}.json", record.epoch, record.iter_id));
        let json = serde_json::to_vec_pretty(&record)?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}
