//! Training configuration: TOML file with optional fields merged over defaults.

use data_contracts::{Head, HeadWeights};
use losses::{DepthScaling, LossConfig};
use models::FusionHeadsModelConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::trainer::TrainerOptions;

pub const DEFAULT_CONFIG_NAME: &str = "fusion-train.toml";
pub const CONFIG_ENV: &str = "FUSION_TRAIN_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Sizes of the generated dataset used by the `train` binary.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub train_batches: usize,
    pub val_batches: usize,
    pub max_objects: usize,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            train_batches: 8,
            val_batches: 2,
            max_objects: 8,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub task: String,
    pub exp_id: String,
    pub loss: LossConfig,
    pub num_classes: usize,
    pub num_joints: usize,
    pub input_h: usize,
    pub input_w: usize,
    pub down_ratio: usize,
    pub hidden: usize,
    pub pc_channels: usize,
    pub lr: f64,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub val_intervals: usize,
    /// Iterations per epoch; every batch when unset.
    pub num_iters: Option<usize>,
    /// Log progress every N iterations; 0 logs every iteration at `debug` only.
    pub print_iter: usize,
    pub debug: u8,
    pub debug_dir: PathBuf,
    pub save_dir: PathBuf,
    pub run_dataset_eval: bool,
    pub eval: bool,
    /// Top-k detections decoded per image.
    pub k: usize,
    pub out_thresh: f32,
    pub synthetic: SyntheticConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        let save_dir = PathBuf::from("exp/ddd/default");
        Self {
            task: "ddd".to_string(),
            exp_id: "default".to_string(),
            loss: LossConfig::default(),
            num_classes: 10,
            num_joints: 17,
            input_h: 64,
            input_w: 64,
            down_ratio: 4,
            hidden: 32,
            pc_channels: 0,
            lr: 1.25e-4,
            batch_size: 2,
            num_epochs: 1,
            val_intervals: 1,
            num_iters: None,
            print_iter: 0,
            debug: 0,
            debug_dir: save_dir.join("debug"),
            save_dir,
            run_dataset_eval: false,
            eval: false,
            k: 100,
            out_thresh: 0.1,
            synthetic: SyntheticConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrainConfigFile {
    task: Option<String>,
    exp_id: Option<String>,
    num_classes: Option<usize>,
    num_joints: Option<usize>,
    input_h: Option<usize>,
    input_w: Option<usize>,
    down_ratio: Option<usize>,
    hidden: Option<usize>,
    pc_channels: Option<usize>,
    save_dir: Option<String>,
    debug_dir: Option<String>,
    loss: Option<LossSection>,
    schedule: Option<ScheduleSection>,
    eval: Option<EvalSection>,
    synthetic: Option<SyntheticSection>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LossSection {
    heads: Option<Vec<Head>>,
    weights: Option<HeadWeights>,
    num_stacks: Option<usize>,
    penalize_vertex_loss: Option<bool>,
    sigmoid_dep_sec: Option<bool>,
    depth: Option<DepthScaling>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ScheduleSection {
    lr: Option<f64>,
    batch_size: Option<usize>,
    num_epochs: Option<usize>,
    val_intervals: Option<usize>,
    num_iters: Option<usize>,
    print_iter: Option<usize>,
    debug: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EvalSection {
    run_dataset_eval: Option<bool>,
    eval: Option<bool>,
    k: Option<usize>,
    out_thresh: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SyntheticSection {
    train_batches: Option<usize>,
    val_batches: Option<usize>,
    max_objects: Option<usize>,
    seed: Option<u64>,
}

impl TrainConfig {
    /// Reads the file named by `FUSION_TRAIN_CONFIG`, else `fusion-train.toml` in the working
    /// directory, else returns defaults.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_path(Path::new(&path));
        }
        let default_path = Path::new(DEFAULT_CONFIG_NAME);
        if default_path.exists() {
            return Self::from_path(default_path);
        }
        Ok(Self::default())
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: TrainConfigFile = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_file(file))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: TrainConfigFile = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: TrainConfigFile) -> Self {
        let d = Self::default();
        let save_dir = file.save_dir.map(|v| expand_path(&v)).unwrap_or(d.save_dir);
        let debug_dir = file
            .debug_dir
            .map(|v| expand_path(&v))
            .unwrap_or_else(|| save_dir.join("debug"));

        let loss = file.loss.unwrap_or_default();
        let loss = LossConfig {
            heads: loss.heads.unwrap_or(d.loss.heads),
            weights: loss.weights.unwrap_or(d.loss.weights),
            num_stacks: loss.num_stacks.unwrap_or(d.loss.num_stacks),
            penalize_vertex_loss: loss
                .penalize_vertex_loss
                .unwrap_or(d.loss.penalize_vertex_loss),
            depth: loss.depth.unwrap_or(d.loss.depth),
            sigmoid_dep_sec: loss.sigmoid_dep_sec.unwrap_or(d.loss.sigmoid_dep_sec),
        };
        let schedule = file.schedule.unwrap_or_default();
        let eval = file.eval.unwrap_or_default();
        let synthetic = file.synthetic.unwrap_or_default();

        TrainConfig {
            task: file.task.unwrap_or(d.task),
            exp_id: file.exp_id.unwrap_or(d.exp_id),
            loss,
            num_classes: file.num_classes.unwrap_or(d.num_classes),
            num_joints: file.num_joints.unwrap_or(d.num_joints),
            input_h: file.input_h.unwrap_or(d.input_h),
            input_w: file.input_w.unwrap_or(d.input_w),
            down_ratio: file.down_ratio.unwrap_or(d.down_ratio),
            hidden: file.hidden.unwrap_or(d.hidden),
            pc_channels: file.pc_channels.unwrap_or(d.pc_channels),
            lr: schedule.lr.unwrap_or(d.lr),
            batch_size: schedule.batch_size.unwrap_or(d.batch_size),
            num_epochs: schedule.num_epochs.unwrap_or(d.num_epochs),
            val_intervals: schedule.val_intervals.unwrap_or(d.val_intervals),
            num_iters: schedule.num_iters.or(d.num_iters),
            print_iter: schedule.print_iter.unwrap_or(d.print_iter),
            debug: schedule.debug.unwrap_or(d.debug),
            debug_dir,
            save_dir,
            run_dataset_eval: eval.run_dataset_eval.unwrap_or(d.run_dataset_eval),
            eval: eval.eval.unwrap_or(d.eval),
            k: eval.k.unwrap_or(d.k),
            out_thresh: eval.out_thresh.unwrap_or(d.out_thresh),
            synthetic: SyntheticConfig {
                train_batches: synthetic.train_batches.unwrap_or(d.synthetic.train_batches),
                val_batches: synthetic.val_batches.unwrap_or(d.synthetic.val_batches),
                max_objects: synthetic.max_objects.unwrap_or(d.synthetic.max_objects),
                seed: synthetic.seed.unwrap_or(d.synthetic.seed),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.loss.heads.is_empty() {
            return invalid("loss.heads is empty".into());
        }
        if self.loss.num_stacks == 0 {
            return invalid("loss.num_stacks must be at least 1".into());
        }
        if self.batch_size == 0 {
            return invalid("schedule.batch_size must be at least 1".into());
        }
        if self.num_classes == 0 {
            return invalid("num_classes must be at least 1".into());
        }
        if self.down_ratio == 0
            || self.input_h % self.down_ratio != 0
            || self.input_w % self.down_ratio != 0
        {
            return invalid(format!(
                "input {}x{} is not divisible by down_ratio {}",
                self.input_h, self.input_w, self.down_ratio
            ));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return invalid(format!("schedule.lr must be positive, got {}", self.lr));
        }
        if self.loss.depth.m <= 0.0 {
            return invalid(format!("loss.depth.m must be positive, got {}", self.loss.depth.m));
        }
        Ok(())
    }

    pub fn model_config(&self) -> FusionHeadsModelConfig {
        FusionHeadsModelConfig {
            heads: self.loss.heads.clone(),
            num_classes: self.num_classes,
            num_joints: self.num_joints,
            hidden: self.hidden,
            down_ratio: self.down_ratio,
            num_stacks: self.loss.num_stacks,
            pc_channels: self.pc_channels,
        }
    }

    pub fn trainer_options(&self) -> TrainerOptions {
        TrainerOptions {
            task: self.task.clone(),
            exp_id: self.exp_id.clone(),
            lr: self.lr,
            num_iters: self.num_iters,
            print_iter: self.print_iter,
            debug: self.debug,
            run_dataset_eval: self.run_dataset_eval,
            eval: self.eval,
            k: self.k,
            out_thresh: self.out_thresh,
            num_classes: self.num_classes,
        }
    }
}

fn expand_path(raw: &str) -> PathBuf {
    if let Some(stripped) = raw.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(format!("{home}{stripped}"));
        }
    }
    PathBuf::from(raw)
}
