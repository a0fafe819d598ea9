use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::backend::Autodiff;
use burn::module::Module;
use burn::optim::AdamConfig;
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use clap::{Parser, ValueEnum};
use losses::GenericLoss;
use models::{FusionHeadsModel, FusionHeadsModelConfig};

use crate::config::TrainConfig;
use crate::debug::JsonDumpDebugger;
use crate::synthetic::{SyntheticLoader, SyntheticSpec};
use crate::trainer::{EpochStats, Phase, Trainer};
use crate::TrainBackend;

type ADBackend = Autodiff<TrainBackend>;

pub const CHECKPOINT_NAME: &str = "model_last";
pub const METRICS_NAME: &str = "metrics.jsonl";

pub fn load_model_from_checkpoint<P: AsRef<Path>>(
    path: P,
    cfg: FusionHeadsModelConfig,
    device: &<TrainBackend as burn::tensor::backend::Backend>::Device,
) -> Result<FusionHeadsModel<TrainBackend>, RecorderError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    FusionHeadsModel::<TrainBackend>::new(cfg, device).load_file(path.as_ref(), &recorder, device)
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "train",
    about = "Train the camera + point-cloud fusion detector heads"
)]
pub struct TrainArgs {
    /// TOML config (falls back to $FUSION_TRAIN_CONFIG, then fusion-train.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
    /// Number of epochs.
    #[arg(long)]
    pub epochs: Option<usize>,
    /// Batch size.
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Learning rate.
    #[arg(long)]
    pub lr: Option<f64>,
    /// Iterations per epoch (all batches when omitted).
    #[arg(long)]
    pub num_iters: Option<usize>,
    /// Validate every N epochs.
    #[arg(long)]
    pub val_intervals: Option<usize>,
    /// Log progress every N iterations.
    #[arg(long)]
    pub print_iter: Option<usize>,
    /// Debug level; 4 dumps per-iteration JSON records.
    #[arg(long)]
    pub debug: Option<u8>,
    /// Add the 3D box vertex loss to the total.
    #[arg(long)]
    pub penalize_vertex_loss: bool,
    /// Output directory for checkpoints and results.
    #[arg(long)]
    pub save_dir: Option<PathBuf>,
}

impl TrainArgs {
    pub fn apply(&self, cfg: &mut TrainConfig) {
        if let Some(v) = self.epochs {
            cfg.num_epochs = v;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.lr {
            cfg.lr = v;
        }
        if self.num_iters.is_some() {
            cfg.num_iters = self.num_iters;
        }
        if let Some(v) = self.val_intervals {
            cfg.val_intervals = v;
        }
        if let Some(v) = self.print_iter {
            cfg.print_iter = v;
        }
        if let Some(v) = self.debug {
            cfg.debug = v;
        }
        if self.penalize_vertex_loss {
            cfg.loss.penalize_vertex_loss = true;
        }
        if let Some(dir) = &self.save_dir {
            cfg.save_dir = dir.clone();
            cfg.debug_dir = dir.join("debug");
        }
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend.unwrap_or(BackendKind::NdArray))?;

    let mut cfg = match &args.config {
        Some(path) => TrainConfig::from_path(path)?,
        None => TrainConfig::load()?,
    };
    args.apply(&mut cfg);
    cfg.validate()?;

    let ckpt_path = train_with_config(&cfg)?;
    tracing::info!(path = %ckpt_path.display(), "saved checkpoint");
    Ok(())
}

/// Runs the configured schedule on synthetic data; returns the checkpoint path.
///
/// Per-epoch stats are appended to `metrics.jsonl` in `save_dir`.
pub fn train_with_config(cfg: &TrainConfig) -> anyhow::Result<PathBuf> {
    let device = <ADBackend as burn::tensor::backend::Backend>::Device::default();
    let model = FusionHeadsModel::<ADBackend>::new(cfg.model_config(), &device);
    let optim = AdamConfig::new().init::<ADBackend, FusionHeadsModel<ADBackend>>();

    let mut opts = cfg.trainer_options();
    if opts.run_dataset_eval || opts.eval {
        tracing::warn!("no detection decoder is linked into `train`; skipping evaluation");
        opts.run_dataset_eval = false;
        opts.eval = false;
    }
    let mut trainer = Trainer::<ADBackend, _, _>::new(
        opts,
        model,
        GenericLoss::new(cfg.loss.clone()),
        optim,
        device,
    );
    if cfg.debug > 0 {
        trainer = trainer.with_debugger(Box::new(JsonDumpDebugger::new(
            cfg.debug_dir.clone(),
            cfg.debug,
        )));
    }

    let spec = SyntheticSpec::from_config(cfg);
    let seed = cfg.synthetic.seed;
    let mut train_loader = SyntheticLoader::new(spec.clone(), cfg.synthetic.train_batches, seed);
    let val_seed = seed.wrapping_add(1);
    let mut val_loader = SyntheticLoader::new(spec, cfg.synthetic.val_batches, val_seed);

    fs::create_dir_all(&cfg.save_dir)
        .with_context(|| format!("creating {}", cfg.save_dir.display()))?;
    let metrics_path = cfg.save_dir.join(METRICS_NAME);
    let mut metrics = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&metrics_path)
        .with_context(|| format!("opening {}", metrics_path.display()))?;

    for epoch in 1..=cfg.num_epochs {
        let (stats, _) = trainer.train(epoch, &mut train_loader)?;
        write_metrics(&mut metrics, epoch, Phase::Train, &stats)?;
        if cfg.val_intervals > 0 && epoch % cfg.val_intervals == 0 {
            let (stats, _) = trainer.val(epoch, &mut val_loader)?;
            write_metrics(&mut metrics, epoch, Phase::Val, &stats)?;
        }
    }

    let ckpt_path = cfg.save_dir.join(CHECKPOINT_NAME);
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    trainer
        .model()
        .clone()
        .save_file(ckpt_path.clone(), &recorder)
        .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;
    // The recorder appends its own extension.
    Ok(ckpt_path.with_extension("bin"))
}

fn write_metrics(
    out: &mut fs::File,
    epoch: usize,
    phase: Phase,
    stats: &EpochStats,
) -> anyhow::Result<()> {
    let line = serde_json::json!({
        "epoch": epoch,
        "phase": phase.as_str(),
        "losses": stats.losses,
        "time_minutes": stats.time_minutes,
        "iterations": stats.iterations,
    });
    writeln!(out, "{line}")?;
    Ok(())
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!(
                "backend-wgpu feature not enabled; rebuild with --features backend-wgpu \
                 or choose ndarray"
            )
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!(
                "built with backend-wgpu; training still uses WGPU despite --backend ndarray"
            );
        }
        _ => {}
    }
    Ok(())
}
