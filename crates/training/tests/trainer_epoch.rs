use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use burn::backend::Autodiff;
use burn::optim::AdamConfig;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use data_contracts::{Detection, Head, HeadWeights, HostArray, HostArrays};
use losses::{GenericLoss, LossConfig};
use models::{FusionDetector, FusionHeadsModel, FusionHeadsModelConfig, HeadOutputs};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;
use training::synthetic::{SyntheticLoader, SyntheticSpec};
use training::{
    BatchLoader, DebugFrame, Debugger, DetectionDecoder, JsonDumpDebugger, ModelWithLoss,
    PostProcessContext, PostProcessor, Trainer, TrainerOptions, VecLoader,
};

type AD = Autodiff<burn_ndarray::NdArray<f32>>;

const HEADS: [Head; 5] = [Head::Hm, Head::Reg, Head::Dep, Head::Dim, Head::Rot];

fn spec(batch_size: usize) -> SyntheticSpec {
    SyntheticSpec {
        heads: HEADS.to_vec(),
        num_classes: 3,
        num_joints: 0,
        input_h: 16,
        input_w: 16,
        down_ratio: 4,
        pc_channels: 0,
        batch_size,
        max_objects: 3,
    }
}

fn model_config() -> FusionHeadsModelConfig {
    FusionHeadsModelConfig {
        heads: HEADS.to_vec(),
        num_classes: 3,
        num_joints: 0,
        hidden: 8,
        down_ratio: 4,
        num_stacks: 1,
        pc_channels: 0,
    }
}

fn loss_config() -> LossConfig {
    LossConfig {
        heads: HEADS.to_vec(),
        ..Default::default()
    }
}

fn options() -> TrainerOptions {
    TrainerOptions {
        lr: 1e-2,
        num_classes: 3,
        ..Default::default()
    }
}

fn trainer(
    opts: TrainerOptions,
    loss: LossConfig,
) -> Trainer<
    AD,
    FusionHeadsModel<AD>,
    impl burn::optim::Optimizer<FusionHeadsModel<AD>, AD>,
> {
    let device = Default::default();
    let model = FusionHeadsModel::<AD>::new(model_config(), &device);
    let optim = AdamConfig::new().init::<AD, FusionHeadsModel<AD>>();
    Trainer::new(opts, model, GenericLoss::new(loss), optim, device)
}

fn heatmap_of(model: &FusionHeadsModel<AD>) -> Vec<f32> {
    let device = Default::default();
    let image = Tensor::<AD, 4>::ones([1, 3, 16, 16], &device);
    let calib = Tensor::<AD, 3>::zeros([1, 3, 4], &device);
    let out = model.forward_stacks(image, None, None, calib);
    out[0]
        .get(Head::Hm)
        .unwrap()
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap()
}

#[test]
fn num_iters_cuts_the_epoch_short() {
    let mut t = trainer(
        TrainerOptions {
            num_iters: Some(2),
            ..options()
        },
        loss_config(),
    );
    let mut loader = SyntheticLoader::new(spec(1), 5, 1);
    let (stats, _) = t.val(1, &mut loader).unwrap();
    assert_eq!(stats.iterations, 2);

    let mut t = trainer(options(), loss_config());
    let (stats, _) = t.val(1, &mut loader).unwrap();
    assert_eq!(stats.iterations, 5);
}

#[test]
fn tracked_keys_skip_zero_weight_heads() {
    let loss = LossConfig {
        weights: HeadWeights::new().with(Head::Reg, 0.0),
        penalize_vertex_loss: true,
        ..loss_config()
    };
    let mut t = trainer(options(), loss);
    let mut loader = SyntheticLoader::new(spec(2), 1, 2);
    let (stats, _) = t.val(1, &mut loader).unwrap();
    let keys: Vec<&str> = stats.losses.keys().map(String::as_str).collect();
    assert!(keys.contains(&"tot"));
    assert!(keys.contains(&"vertex_loss"));
    assert!(keys.contains(&"hm"));
    assert!(!keys.contains(&"reg"));
    assert!(stats.time_minutes >= 0.0);
}

#[test]
fn epoch_average_is_weighted_by_image_count() {
    let device = Default::default();
    let mut big = SyntheticLoader::new(spec(3), 1, 5);
    let mut small = SyntheticLoader::new(spec(1), 1, 6);
    let b3 = BatchLoader::<AD>::next_batch(&mut big, &device).unwrap();
    let b1 = BatchLoader::<AD>::next_batch(&mut small, &device).unwrap();
    let (b3, b1) = (b3.unwrap(), b1.unwrap());

    let mut t = trainer(options(), loss_config());
    let mwl = ModelWithLoss::new(t.model().clone(), GenericLoss::new(loss_config()));
    let tot = |batch: &training::Batch<AD>| -> f64 {
        let step = mwl.forward::<AD>(batch).unwrap();
        f64::from(step.loss.into_data().to_vec::<f32>().unwrap()[0])
    };
    let expected = (3.0 * tot(&b3) + tot(&b1)) / 4.0;

    let mut loader = VecLoader::new(vec![b3, b1]);
    let (stats, _) = t.val(1, &mut loader).unwrap();
    let avg = stats.get("tot").unwrap();
    assert!((avg - expected).abs() < 1e-4 * expected.abs().max(1.0), "{avg} vs {expected}");
}

#[test]
fn train_updates_parameters_and_val_does_not() {
    let mut t = trainer(options(), loss_config());
    let before = heatmap_of(t.model());

    let mut val_loader = SyntheticLoader::new(spec(2), 2, 3);
    t.val(1, &mut val_loader).unwrap();
    assert_eq!(heatmap_of(t.model()), before);

    let mut train_loader = SyntheticLoader::new(spec(2), 2, 4);
    let (stats, results) = t.train(1, &mut train_loader).unwrap();
    assert!(stats.get("tot").unwrap().is_finite());
    assert!(results.is_empty());
    assert_ne!(heatmap_of(t.model()), before);
}

struct FixedScores;

impl<B: Backend> DetectionDecoder<B> for FixedScores {
    fn decode(&self, output: &HeadOutputs<B>, k: usize) -> anyhow::Result<HostArrays> {
        let n = output
            .get(Head::Hm)
            .map(|t| t.dims()[0])
            .ok_or_else(|| anyhow::anyhow!("no heatmap"))?;
        let pattern = [0.9f32, 0.05, 0.5];
        let scores = (0..n * k).map(|i| pattern[i % k % pattern.len()]).collect();
        let mut out = HostArrays::new();
        out.insert("scores", HostArray::new(vec![n, k], scores)?);
        Ok(out)
    }
}

struct ScoresToDetections;

impl PostProcessor for ScoresToDetections {
    fn post_process(
        &self,
        dets: &HostArrays,
        ctx: &PostProcessContext<'_>,
    ) -> anyhow::Result<Vec<Vec<Detection>>> {
        let scores = dets.require("scores")?;
        let [n, k] = [scores.shape()[0], scores.shape()[1]];
        assert_eq!(ctx.centers.len(), n);
        assert_eq!((ctx.out_height, ctx.out_width), (4, 4));
        Ok((0..n)
            .map(|b| {
                (0..k)
                    .map(|j| {
                        let score = scores.get(&[b, j]).unwrap_or(0.0);
                        Detection::new([0.0, 0.0, 4.0, 4.0], 0, score)
                            .with_box3d([1.0, 1.0, 1.0], 10.0, 0.0)
                    })
                    .collect()
            })
            .collect())
    }
}

#[test]
fn validation_collects_thresholded_results_per_image() {
    let opts = TrainerOptions {
        run_dataset_eval: true,
        k: 3,
        out_thresh: 0.1,
        ..options()
    };
    let mut t = trainer(opts, loss_config())
        .with_evaluator(Box::new(FixedScores), Box::new(ScoresToDetections));

    let mut loader = SyntheticLoader::new(spec(2), 2, 9);
    let (_, results) = t.val(1, &mut loader).unwrap();
    assert_eq!(results.len(), 4);
    for (_, dets) in results.iter() {
        assert_eq!(dets.len(), 2);
        assert!(dets.iter().all(|d| d.score > 0.1));
    }

    let (_, train_results) = t.train(1, &mut loader).unwrap();
    assert!(train_results.is_empty());
}

#[test]
fn eval_without_decoder_is_an_error() {
    let mut t = trainer(
        TrainerOptions {
            eval: true,
            ..options()
        },
        loss_config(),
    );
    let mut loader = SyntheticLoader::new(spec(1), 1, 1);
    assert!(t.val(1, &mut loader).is_err());
}

struct CountingDebugger(Arc<AtomicUsize>);

impl<B: Backend> Debugger<B> for CountingDebugger {
    fn debug(&mut self, frame: DebugFrame<'_, B>) -> anyhow::Result<()> {
        assert!(frame.output.contains(Head::Hm));
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn debugger_runs_only_when_debug_is_set() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut loader = SyntheticLoader::new(spec(1), 3, 2);

    let mut quiet = trainer(options(), loss_config())
        .with_debugger(Box::new(CountingDebugger(calls.clone())));
    quiet.val(1, &mut loader).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let mut loud = trainer(
        TrainerOptions {
            debug: 1,
            ..options()
        },
        loss_config(),
    )
    .with_debugger(Box::new(CountingDebugger(calls.clone())));
    loud.val(1, &mut loader).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn json_debugger_dumps_records_at_level_four() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = trainer(
        TrainerOptions {
            debug: 4,
            ..options()
        },
        loss_config(),
    )
    .with_debugger(Box::new(JsonDumpDebugger::new(dir.path(), 4)));
    let mut loader = SyntheticLoader::new(spec(2), 2, 8);
    t.val(3, &mut loader).unwrap();

    let mut files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    files.sort();
    assert_eq!(files, vec!["epoch003_iter000000.json", "epoch003_iter000001.json"]);

    let raw = std::fs::read_to_string(dir.path().join(&files[0])).unwrap();
    let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["img_ids"], serde_json::json!([0, 1]));
    assert_eq!(record["gt_det"].as_array().unwrap().len(), 2);
}

/// Counts `WARN` events seen while installed.
struct WarnCounter(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn debug_level_without_debugger_warns_once() {
    let warnings = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(WarnCounter(warnings.clone()));
    let mut t = trainer(
        TrainerOptions {
            debug: 2,
            ..options()
        },
        loss_config(),
    );
    let mut loader = SyntheticLoader::new(spec(1), 2, 3);
    tracing::subscriber::with_default(subscriber, || {
        t.val(1, &mut loader).unwrap();
        t.train(1, &mut loader).unwrap();
    });
    assert_eq!(warnings.load(Ordering::SeqCst), 1);

    let quiet = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(WarnCounter(quiet.clone()));
    let mut t = trainer(options(), loss_config());
    tracing::subscriber::with_default(subscriber, || {
        t.val(1, &mut loader).unwrap();
    });
    assert_eq!(quiet.load(Ordering::SeqCst), 0);
}
