use burn::tensor::{Int, Tensor, TensorData};
use data_contracts::{Head, HeadWeights};
use losses::vertex::vertex_loss;
use losses::{
    DepthAdjustment, DepthScaling, GenericLoss, KeypointTargets, LossConfig, LossError, LossKey,
    LossTargets, MaskedTarget,
};
use std::collections::BTreeMap;
use models::HeadOutputs;

type B = burn_ndarray::NdArray<f32>;

const N: usize = 1;
const M: usize = 2;
const C: usize = 2;
const H: usize = 4;
const W: usize = 4;

fn ramp_value(i: usize, scale: f32) -> f32 {
    ((i as f32) * 0.37).sin() * scale
}

fn ramp(shape: [usize; 4], scale: f32) -> Tensor<B, 4> {
    let len: usize = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|i| ramp_value(i, scale)).collect();
    Tensor::from_data(TensorData::new(data, shape), &Default::default())
}

fn t3(values: Vec<f32>, shape: [usize; 3]) -> Tensor<B, 3> {
    Tensor::from_data(TensorData::new(values, shape), &Default::default())
}

fn stack() -> HeadOutputs<B> {
    let mut out = HeadOutputs::new();
    out.insert(Head::Hm, ramp([N, C, H, W], 2.0));
    out.insert(Head::Reg, ramp([N, 2, H, W], 0.5));
    out.insert(Head::Dep, ramp([N, 1, H, W], 1.0));
    out.insert(Head::Dim, ramp([N, 3, H, W], 1.5));
    out.insert(Head::Rot, ramp([N, 8, H, W], 1.0));
    out
}

fn targets() -> LossTargets<B> {
    let device = Default::default();
    let mut hm = vec![0.0f32; N * C * H * W];
    hm[5] = 1.0; // class 0 at index 5
    hm[H * W + 10] = 1.0; // class 1 at index 10
    let hm = Tensor::<B, 4>::from_data(TensorData::new(hm, [N, C, H, W]), &device);
    let ind = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![5i64, 10], [N, M]), &device);
    let cat = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![0i64, 1], [N, M]), &device);
    let mask = Tensor::<B, 2>::ones([N, M], &device);
    let rotbin = TensorData::new(vec![1i64, 0, 0, 1], [N, M, 2]);
    let rotbin = Tensor::<B, 3, Int>::from_data(rotbin, &device);

    LossTargets::new(ind, mask.clone(), cat)
        .with_heatmap(hm)
        .with_depth(t3(vec![12.0, 48.0], [N, M, 1]), t3(vec![1.0; 2], [N, M, 1]))
        .with_regression(
            Head::Reg,
            t3(vec![0.2, 0.4, 0.6, 0.8], [N, M, 2]),
            t3(vec![1.0; 4], [N, M, 2]),
        )
        .with_regression(
            Head::Dim,
            t3(vec![1.5, 1.7, 4.0, 1.4, 1.6, 3.9], [N, M, 3]),
            t3(vec![1.0; 6], [N, M, 3]),
        )
        .with_rotation(mask, rotbin, t3(vec![0.3, 0.0, 0.0, -0.2], [N, M, 2]))
}

fn config() -> LossConfig {
    LossConfig {
        heads: vec![Head::Hm, Head::Reg, Head::Dep, Head::Dim, Head::Rot],
        weights: HeadWeights::new()
            .with(Head::Hm, 1.0)
            .with(Head::Reg, 0.5)
            .with(Head::Dep, 2.0)
            .with(Head::Dim, 1.0)
            .with(Head::Rot, 0.25),
        ..Default::default()
    }
}

fn scalar(t: Tensor<B, 1>) -> f32 {
    t.into_data().to_vec::<f32>().unwrap()[0]
}

fn stats(
    loss: &GenericLoss,
    out: HeadOutputs<B>,
    targets: &LossTargets<B>,
) -> BTreeMap<LossKey, f32> {
    let (_, breakdown) = loss.forward(&[out], targets).unwrap();
    breakdown.to_scalars().unwrap()
}

/// One joint per object at flat indices `hp_ind`, with per-keypoint offsets `[N, M, 2]`.
fn keypoints(hp_ind: [usize; M], offsets: Vec<f32>) -> KeypointTargets<B> {
    let device = Default::default();
    let mut hm_hp = vec![0.0f32; N * H * W];
    for k in hp_ind {
        hm_hp[k] = 1.0;
    }
    let ind: Vec<i64> = hp_ind.iter().map(|&k| k as i64).collect();
    KeypointTargets {
        hm_hp: Tensor::from_data(TensorData::new(hm_hp, [N, 1, H, W]), &device),
        hp_ind: Tensor::from_data(TensorData::new(ind, [N, M]), &device),
        hm_hp_mask: Tensor::ones([N, M], &device),
        joint: Tensor::zeros([N, M], &device),
        hp_offset: Some(MaskedTarget::new(
            t3(offsets, [N, M, 2]),
            t3(vec![1.0; 4], [N, M, 2]),
        )),
    }
}

#[test]
fn total_is_weighted_sum_of_head_losses() {
    let cfg = config();
    let loss = GenericLoss::new(cfg.clone());
    let (total, breakdown) = loss.forward(&[stack()], &targets()).unwrap();
    let stats = breakdown.to_scalars().unwrap();

    let mut expected = 0.0f32;
    for head in &cfg.heads {
        let v = stats[&LossKey::Head(*head)];
        assert!(v.is_finite() && v >= 0.0, "{head}: {v}");
        expected += cfg.weights.weight(*head) * v;
    }
    let total = scalar(total);
    assert!((total - expected).abs() < 1e-4, "{total} vs {expected}");
    assert!((stats[&LossKey::Total] - total).abs() < 1e-6);
    assert_eq!(
        breakdown.keys().collect::<Vec<_>>(),
        loss.stat_keys(),
        "breakdown keys follow the reporting order"
    );
}

#[test]
fn vertex_penalty_adds_scaled_term() {
    let cfg = LossConfig {
        penalize_vertex_loss: true,
        ..config()
    };
    let loss = GenericLoss::new(cfg.clone());
    let (total, breakdown) = loss.forward(&[stack()], &targets()).unwrap();
    let stats = breakdown.to_scalars().unwrap();

    let heads: f32 = cfg
        .heads
        .iter()
        .map(|h| cfg.weights.weight(*h) * stats[&LossKey::Head(*h)])
        .sum();
    let vertex = stats[&LossKey::Vertex];
    assert!(vertex > 0.0);
    assert!((scalar(total) - (heads + vertex)).abs() < 1e-4);
    assert_eq!(loss.stat_keys().last(), Some(&LossKey::Vertex));
}

#[test]
fn identical_stacks_average_to_single_stack() {
    let single = GenericLoss::new(config());
    let double = GenericLoss::new(LossConfig {
        num_stacks: 2,
        ..config()
    });
    let (one, _) = single.forward(&[stack()], &targets()).unwrap();
    let (two, _) = double.forward(&[stack(), stack()], &targets()).unwrap();
    assert!((scalar(one) - scalar(two)).abs() < 1e-4);
}

#[test]
fn too_few_stacks_is_an_error() {
    let loss = GenericLoss::new(LossConfig {
        num_stacks: 3,
        ..config()
    });
    let err = loss.forward(&[stack()], &targets()).unwrap_err();
    assert!(matches!(
        err,
        LossError::StackCount {
            expected: 3,
            actual: 1
        }
    ));
}

#[test]
fn predicted_head_without_target_fails() {
    let mut cfg = config();
    cfg.heads.push(Head::Velocity);
    let mut out = stack();
    out.insert(Head::Velocity, ramp([N, 3, H, W], 1.0));
    let loss = GenericLoss::new(cfg);
    let err = loss.forward(&[out], &targets()).unwrap_err();
    assert!(matches!(
        err,
        LossError::MissingTarget {
            head: Head::Velocity,
            ..
        }
    ));
}

#[test]
fn unconfigured_heads_are_ignored() {
    let mut out = stack();
    out.insert(Head::Velocity, ramp([N, 3, H, W], 1.0));
    let loss = GenericLoss::new(config());
    let (with_extra, _) = loss.forward(&[out], &targets()).unwrap();
    let (plain, _) = loss.forward(&[stack()], &targets()).unwrap();
    assert!((scalar(with_extra) - scalar(plain)).abs() < 1e-6);
}

#[test]
fn neutral_depth_scaling_matches_plain_l1() {
    let plain = GenericLoss::new(config());
    let neutral = GenericLoss::new(LossConfig {
        depth: DepthScaling {
            kind: DepthAdjustment::Linear,
            m: 50.0,
            factor: 0.0,
        },
        ..config()
    });
    let boosted = GenericLoss::new(LossConfig {
        depth: DepthScaling {
            kind: DepthAdjustment::Linear,
            m: 50.0,
            factor: 1.0,
        },
        ..config()
    });
    let (a, _) = plain.forward(&[stack()], &targets()).unwrap();
    let (b, _) = neutral.forward(&[stack()], &targets()).unwrap();
    let (c, _) = boosted.forward(&[stack()], &targets()).unwrap();
    assert!((scalar(a.clone()) - scalar(b)).abs() < 1e-5);
    assert!(scalar(c) > scalar(a));
}

#[test]
fn vertex_loss_vanishes_for_exact_prediction() {
    let device = Default::default();
    let res = 0.6f32;
    let dims = [1.5f32, 1.8, 4.2];

    let rot = vec![-5.0, 5.0, res.sin(), res.cos(), 5.0, -5.0, 0.0, 1.0];
    let dim_map = Tensor::<B, 4>::from_data(TensorData::new(dims.to_vec(), [1, 3, 1, 1]), &device);
    let rot_map = Tensor::<B, 4>::from_data(TensorData::new(rot, [1, 8, 1, 1]), &device);
    let ind = Tensor::<B, 2, Int>::zeros([1, 1], &device);
    let dim_mask = Tensor::<B, 3>::ones([1, 1, 3], &device);
    let rot_mask = Tensor::<B, 2>::ones([1, 1], &device);
    let rotbin = Tensor::<B, 3, Int>::from_data([[[1i64, 0]]], &device);
    let rotres = Tensor::<B, 3>::from_data(TensorData::new(vec![res, 0.0], [1, 1, 2]), &device);

    let exact = scalar(vertex_loss(
        dim_map.clone(),
        dim_mask.clone(),
        ind.clone(),
        t3(dims.to_vec(), [1, 1, 3]),
        rot_map.clone(),
        rot_mask.clone(),
        rotbin.clone(),
        rotres.clone(),
    ));
    assert!(exact < 1e-4, "{exact}");

    let off = scalar(vertex_loss(
        dim_map,
        dim_mask,
        ind,
        t3(vec![1.5, 1.8, 5.2], [1, 1, 3]),
        rot_map,
        rot_mask,
        rotbin,
        rotres,
    ));
    assert!(off > 0.1);
}

#[test]
fn keypoint_offsets_are_read_at_keypoint_indices() {
    let offset_at = |k: usize| [ramp_value(k, 0.5), ramp_value(H * W + k, 0.5)];
    let hp_ind = [3, 12];
    let cfg = LossConfig {
        heads: vec![Head::Hm, Head::HmHp, Head::HpOffset],
        ..config()
    };
    let loss = GenericLoss::new(cfg);
    let mut out = stack();
    out.insert(Head::HmHp, ramp([N, 1, H, W], 1.0));
    out.insert(Head::HpOffset, ramp([N, 2, H, W], 0.5));

    let exact: Vec<f32> = hp_ind.iter().flat_map(|&k| offset_at(k)).collect();
    let exact = targets().with_keypoints(keypoints(hp_ind, exact));
    let hit = stats(&loss, out.clone(), &exact);
    assert!(hit[&LossKey::Head(Head::HpOffset)] < 1e-5);
    assert!(hit[&LossKey::Head(Head::HmHp)] > 0.0);

    // Offsets taken at the object centres instead of the keypoints do not line up.
    let at_centres: Vec<f32> = [5, 10].iter().flat_map(|&k| offset_at(k)).collect();
    let at_centres = targets().with_keypoints(keypoints(hp_ind, at_centres));
    let miss = stats(&loss, out, &at_centres);
    assert!(miss[&LossKey::Head(Head::HpOffset)] > 1e-2);
}

#[test]
fn keypoint_heads_without_keypoint_targets_fail() {
    let cfg = LossConfig {
        heads: vec![Head::Hm, Head::HmHp],
        ..config()
    };
    let mut out = stack();
    out.insert(Head::HmHp, ramp([N, 1, H, W], 1.0));
    let loss = GenericLoss::new(cfg);
    let err = loss.forward(&[out], &targets()).unwrap_err();
    assert!(matches!(
        err,
        LossError::MissingTarget {
            head: Head::HmHp,
            ..
        }
    ));
}

#[test]
fn dep_sec_is_activated_only_when_configured() {
    let heads = vec![Head::Hm, Head::Dep, Head::DepSec];
    let raw = GenericLoss::new(LossConfig {
        heads: heads.clone(),
        ..config()
    });
    let activated = GenericLoss::new(LossConfig {
        heads,
        sigmoid_dep_sec: true,
        ..config()
    });
    let mut out = stack();
    out.insert(Head::DepSec, ramp([N, 1, H, W], 1.0));

    let dep = LossKey::Head(Head::Dep);
    let dep_sec = LossKey::Head(Head::DepSec);
    let on = stats(&activated, out.clone(), &targets());
    assert!((on[&dep_sec] - on[&dep]).abs() < 1e-6);
    let off = stats(&raw, out, &targets());
    assert!((off[&dep] - on[&dep]).abs() < 1e-6);
    assert!((off[&dep_sec] - off[&dep]).abs() > 1e-2);
}

#[test]
fn rot_sec_is_scored_against_rotation_targets() {
    let loss = GenericLoss::new(LossConfig {
        heads: vec![Head::Hm, Head::Rot, Head::RotSec],
        ..config()
    });
    let mut out = stack();
    out.insert(Head::RotSec, ramp([N, 8, H, W], 1.0));
    let s = stats(&loss, out, &targets());
    let rot = s[&LossKey::Head(Head::Rot)];
    assert!(rot > 0.0);
    assert!((s[&LossKey::Head(Head::RotSec)] - rot).abs() < 1e-6);
}

#[test]
fn vertex_term_uses_rot_sec_when_predicted() {
    let loss = GenericLoss::new(LossConfig {
        penalize_vertex_loss: true,
        ..config()
    });
    let vertex = |out: HeadOutputs<B>| stats(&loss, out, &targets())[&LossKey::Vertex];
    let base = vertex(stack());

    let mut same = stack();
    same.insert(Head::RotSec, ramp([N, 8, H, W], 1.0));
    assert!((vertex(same) - base).abs() < 1e-6);

    let mut other = stack();
    other.insert(Head::RotSec, ramp([N, 8, H, W], -1.3));
    assert!((vertex(other) - base).abs() > 1e-3);
}

#[test]
fn attribute_head_adds_logistic_loss() {
    let mut cfg = config();
    cfg.heads.push(Head::NuscenesAtt);
    cfg.weights.set(Head::NuscenesAtt, 2.0);
    let loss = GenericLoss::new(cfg);
    let mut out = stack();
    // Zero logits cost ln 2 per attribute whatever the label.
    let logits = Tensor::zeros([N, 8, H, W], &Default::default());
    out.insert(Head::NuscenesAtt, logits);
    let labels: Vec<f32> = (0..M * 8).map(|i| (i % 3 == 0) as u8 as f32).collect();
    let mask = t3(vec![1.0; M * 8], [N, M, 8]);
    let batch = targets().with_attributes(t3(labels, [N, M, 8]), mask);

    let with_att = stats(&loss, out, &batch);
    let att = with_att[&LossKey::Head(Head::NuscenesAtt)];
    let count = (M * 8) as f32;
    assert!((att - 2.0f32.ln() * count / (count + 1e-4)).abs() < 1e-5, "{att}");

    let without = stats(&GenericLoss::new(config()), stack(), &batch);
    let gap = with_att[&LossKey::Total] - without[&LossKey::Total];
    assert!((gap - 2.0 * att).abs() < 1e-4);
}
