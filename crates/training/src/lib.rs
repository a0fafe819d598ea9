#![recursion_limit = "256"]

pub mod batch;
pub mod config;
pub mod debug;
pub mod eval;
pub mod meter;
pub mod model_with_loss;
pub mod synthetic;
pub mod trainer;
pub mod util;

pub use batch::{Batch, BatchLoader, BatchMeta, VecLoader};
pub use config::{ConfigError, TrainConfig};
pub use debug::{DebugFrame, Debugger, JsonDumpDebugger};
pub use eval::{merge_detections, DetectionDecoder, PostProcessContext, PostProcessor};
pub use meter::AverageMeter;
pub use model_with_loss::{ModelWithLoss, StepOutput};
pub use trainer::{EpochStats, Phase, Trainer, TrainerOptions};
pub use util::{run_train, TrainArgs};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
