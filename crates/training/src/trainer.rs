//! Epoch driver: forward, backward and optimizer step per batch, running loss averages,
//! optional debugging and validation-time evaluation.

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use data_contracts::EvalResults;
use losses::{GenericLoss, LossKey};
use models::FusionDetector;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use crate::batch::{Batch, BatchLoader};
use crate::debug::{DebugFrame, Debugger};
use crate::eval::{evaluate_batch, DetectionDecoder, PostProcessor};
use crate::meter::AverageMeter;
use crate::model_with_loss::{ModelWithLoss, StepOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Val,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Val => "val",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TrainerOptions {
    pub task: String,
    pub exp_id: String,
    pub lr: f64,
    pub num_iters: Option<usize>,
    pub print_iter: usize,
    pub debug: u8,
    pub run_dataset_eval: bool,
    pub eval: bool,
    pub k: usize,
    pub out_thresh: f32,
    pub num_classes: usize,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        Self {
            task: "ddd".to_string(),
            exp_id: "default".to_string(),
            lr: 1.25e-4,
            num_iters: None,
            print_iter: 0,
            debug: 0,
            run_dataset_eval: false,
            eval: false,
            k: 100,
            out_thresh: 0.1,
            num_classes: 10,
        }
    }
}

/// Averaged losses of one epoch keyed by loss name, plus wall time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EpochStats {
    pub losses: BTreeMap<String, f64>,
    pub time_minutes: f64,
    pub iterations: usize,
}

impl EpochStats {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.losses.get(key).copied()
    }
}

impl fmt::Display for EpochStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.losses {
            write!(f, "{k} {v:.4} | ")?;
        }
        write!(f, "time {:.2} min", self.time_minutes)
    }
}

/// Keys averaged over an epoch: `tot`, `vertex_loss` and every head with a positive weight.
fn tracked_keys(loss: &GenericLoss) -> Vec<LossKey> {
    let weights = &loss.config().weights;
    loss.stat_keys()
        .into_iter()
        .filter(|key| match key {
            LossKey::Total | LossKey::Vertex => true,
            LossKey::Head(head) => weights.weight(*head) > 0.0,
        })
        .collect()
}

pub struct Trainer<B: AutodiffBackend, M, O> {
    opts: TrainerOptions,
    model_with_loss: ModelWithLoss<M>,
    optimizer: O,
    device: B::Device,
    decoder: Option<Box<dyn DetectionDecoder<B>>>,
    post_processor: Option<Box<dyn PostProcessor>>,
    debugger: Option<Box<dyn Debugger<B>>>,
    warned_missing_debugger: bool,
}

impl<B, M, O> Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + FusionDetector<B>,
    O: Optimizer<M, B>,
{
    pub fn new(
        opts: TrainerOptions,
        model: M,
        loss: GenericLoss,
        optimizer: O,
        device: B::Device,
    ) -> Self {
        Self {
            opts,
            model_with_loss: ModelWithLoss::new(model, loss),
            optimizer,
            device,
            decoder: None,
            post_processor: None,
            debugger: None,
            warned_missing_debugger: false,
        }
    }

    /// Attaches the decode and post-process steps used for validation results.
    pub fn with_evaluator(
        mut self,
        decoder: Box<dyn DetectionDecoder<B>>,
        post_processor: Box<dyn PostProcessor>,
    ) -> Self {
        self.decoder = Some(decoder);
        self.post_processor = Some(post_processor);
        self
    }

    pub fn with_debugger(mut self, debugger: Box<dyn Debugger<B>>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    pub fn options(&self) -> &TrainerOptions {
        &self.opts
    }

    pub fn model(&self) -> &M {
        &self.model_with_loss.model
    }

    pub fn into_model(self) -> M {
        self.model_with_loss.model
    }

    pub fn train<L>(
        &mut self,
        epoch: usize,
        loader: &mut L,
    ) -> anyhow::Result<(EpochStats, EvalResults)>
    where
        L: BatchLoader<B> + ?Sized,
    {
        self.run_epoch(Phase::Train, epoch, loader)
    }

    pub fn val<L>(
        &mut self,
        epoch: usize,
        loader: &mut L,
    ) -> anyhow::Result<(EpochStats, EvalResults)>
    where
        L: BatchLoader<B> + ?Sized,
    {
        self.run_epoch(Phase::Val, epoch, loader)
    }

    fn wants_eval(&self, phase: Phase) -> bool {
        phase == Phase::Val && (self.opts.run_dataset_eval || self.opts.eval)
    }

    /// Whether the per-iteration debug hook runs; warns once when a level is set but no
    /// debugger is attached.
    fn wants_debug(&mut self) -> bool {
        if self.opts.debug == 0 {
            return false;
        }
        if self.debugger.is_none() {
            if !self.warned_missing_debugger {
                tracing::warn!(
                    level = self.opts.debug,
                    "debug level set but no debugger is attached; skipping debug output"
                );
                self.warned_missing_debugger = true;
            }
            return false;
        }
        true
    }

    pub fn run_epoch<L>(
        &mut self,
        phase: Phase,
        epoch: usize,
        loader: &mut L,
    ) -> anyhow::Result<(EpochStats, EvalResults)>
    where
        L: BatchLoader<B> + ?Sized,
    {
        let keys = tracked_keys(&self.model_with_loss.loss);
        let mut meters: BTreeMap<LossKey, AverageMeter> =
            keys.iter().map(|k| (*k, AverageMeter::new())).collect();
        let mut data_time = AverageMeter::new();
        let mut batch_time = AverageMeter::new();
        let mut results = EvalResults::new();

        let num_iters = self.opts.num_iters.unwrap_or_else(|| loader.num_batches());
        let run_eval = self.wants_eval(phase);
        let run_debug = self.wants_debug();
        if run_eval && (self.decoder.is_none() || self.post_processor.is_none()) {
            anyhow::bail!("evaluation requested but no decoder/post-processor is attached");
        }

        loader.reset();
        let started = Instant::now();
        let mut end = Instant::now();
        let mut iter_id = 0usize;
        while iter_id < num_iters {
            let Some(batch) = loader.next_batch(&self.device)? else {
                break;
            };
            data_time.update(end.elapsed().as_secs_f64(), 1);
            let batch = batch.to_device(&self.device);

            let StepOutput {
                output,
                loss,
                stats,
            } = self.model_with_loss.forward(&batch)?;
            if phase == Phase::Train {
                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &self.model_with_loss.model);
                self.model_with_loss.model = self.optimizer.step(
                    self.opts.lr,
                    self.model_with_loss.model.clone(),
                    grads,
                );
            }
            batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();

            let scalars = stats.to_scalars()?;
            let n = batch.num_images();
            for (key, meter) in meters.iter_mut() {
                if let Some(v) = scalars.get(key) {
                    meter.update(f64::from(*v), n);
                }
            }
            self.log_progress(
                phase,
                epoch,
                iter_id,
                num_iters,
                &meters,
                &data_time,
                &batch_time,
            );

            if run_debug {
                self.run_debugger(epoch, iter_id, &batch, &output)?;
            }
            if run_eval {
                if let (Some(decoder), Some(post)) =
                    (self.decoder.as_deref(), self.post_processor.as_deref())
                {
                    evaluate_batch(
                        decoder,
                        post,
                        &output,
                        &batch.meta,
                        self.opts.k,
                        self.opts.num_classes,
                        self.opts.out_thresh,
                        &mut results,
                    )?;
                }
            }
            iter_id += 1;
        }

        let stats = EpochStats {
            losses: meters
                .iter()
                .map(|(k, m)| (k.as_str().to_string(), m.avg))
                .collect(),
            time_minutes: started.elapsed().as_secs_f64() / 60.0,
            iterations: iter_id,
        };
        tracing::info!(
            task = %self.opts.task,
            exp_id = %self.opts.exp_id,
            phase = %phase,
            epoch,
            "{stats}"
        );
        Ok((stats, results))
    }

    fn run_debugger(
        &mut self,
        epoch: usize,
        iter_id: usize,
        batch: &Batch<B>,
        output: &models::HeadOutputs<B>,
    ) -> anyhow::Result<()> {
        let detections = match self.decoder.as_deref() {
            Some(decoder) => Some(decoder.decode(output, self.opts.k)?),
            None => None,
        };
        if let Some(debugger) = self.debugger.as_deref_mut() {
            debugger.debug(DebugFrame {
                epoch,
                iter_id,
                batch,
                output,
                detections: detections.as_ref(),
            })?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn log_progress(
        &self,
        phase: Phase,
        epoch: usize,
        iter_id: usize,
        num_iters: usize,
        meters: &BTreeMap<LossKey, AverageMeter>,
        data_time: &AverageMeter,
        batch_time: &AverageMeter,
    ) {
        let mut line = format!(
            "{}/{}| {phase}: [{epoch}][{iter_id}/{num_iters}]",
            self.opts.task, self.opts.exp_id
        );
        for (key, meter) in meters {
            line.push_str(&format!("|{key} {:.4} ", meter.avg));
        }
        line.push_str(&format!(
            "|Data {:.3}s({:.3}s) |Net {:.3}s",
            data_time.val, data_time.avg, batch_time.avg
        ));
        if self.opts.print_iter > 0 && iter_id % self.opts.print_iter == 0 {
            tracing::info!("{line}");
        } else {
            tracing::debug!("{line}");
        }
    }
}
