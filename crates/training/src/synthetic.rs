//! Seeded generator of well-formed batches for every configured head. Backs the `train`
//! binary and end-to-end tests; each `reset` replays the same sequence.

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use data_contracts::{Detection, Head};
use losses::{KeypointTargets, LossTargets, MaskedTarget};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;

use crate::batch::{Batch, BatchLoader, BatchMeta};
use crate::config::TrainConfig;

const GAUSSIAN_RADIUS: i64 = 2;
const FOCAL: f32 = 50.0;

#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub heads: Vec<Head>,
    pub num_classes: usize,
    pub num_joints: usize,
    pub input_h: usize,
    pub input_w: usize,
    pub down_ratio: usize,
    pub pc_channels: usize,
    pub batch_size: usize,
    /// Object slots per image (`M`).
    pub max_objects: usize,
}

impl SyntheticSpec {
    pub fn from_config(cfg: &TrainConfig) -> Self {
        Self {
            heads: cfg.loss.heads.clone(),
            num_classes: cfg.num_classes,
            num_joints: cfg.num_joints,
            input_h: cfg.input_h,
            input_w: cfg.input_w,
            down_ratio: cfg.down_ratio.max(1),
            pc_channels: cfg.pc_channels,
            batch_size: cfg.batch_size.max(1),
            max_objects: cfg.synthetic.max_objects.max(1),
        }
    }

    fn out_size(&self) -> (usize, usize) {
        let ratio = self.down_ratio;
        (self.input_h / ratio, self.input_w / ratio)
    }

    fn has(&self, head: Head) -> bool {
        self.heads.contains(&head)
    }
}

struct Object {
    class: usize,
    /// Sub-pixel centre on the output map.
    cx: f32,
    cy: f32,
    w: f32,
    h: f32,
    depth: f32,
    dim: [f32; 3],
    alpha: f32,
}

impl Object {
    fn ind(&self, out_w: usize) -> usize {
        self.cy.floor() as usize * out_w + self.cx.floor() as usize
    }

    /// Bin membership and residuals for the two overlapping rotation bins.
    fn rotation_bins(&self) -> ([i64; 2], [f32; 2]) {
        let mut bins = [0i64; 2];
        let mut res = [0f32; 2];
        let a = self.alpha;
        if a < PI / 6.0 || a > 5.0 * PI / 6.0 {
            bins[0] = 1;
            res[0] = a + 0.5 * PI;
        }
        if a > -PI / 6.0 || a < -5.0 * PI / 6.0 {
            bins[1] = 1;
            res[1] = a - 0.5 * PI;
        }
        (bins, res)
    }
}

/// Dense `[N, M, D]` target plus mask, filled per object slot.
struct SlotBuffer {
    dims: usize,
    target: Vec<f32>,
    mask: Vec<f32>,
}

impl SlotBuffer {
    fn new(n: usize, m: usize, dims: usize) -> Self {
        Self {
            dims,
            target: vec![0.0; n * m * dims],
            mask: vec![0.0; n * m * dims],
        }
    }

    fn set(&mut self, slot: usize, values: &[f32]) {
        let start = slot * self.dims;
        for (d, v) in values.iter().take(self.dims).enumerate() {
            self.target[start + d] = *v;
            self.mask[start + d] = 1.0;
        }
    }

    fn into_target<B: Backend>(self, n: usize, m: usize, device: &B::Device) -> MaskedTarget<B> {
        MaskedTarget::new(
            Tensor::from_data(TensorData::new(self.target, [n, m, self.dims]), device),
            Tensor::from_data(TensorData::new(self.mask, [n, m, self.dims]), device),
        )
    }
}

fn draw_gaussian(map: &mut [f32], h: usize, w: usize, cx: usize, cy: usize) {
    let sigma = (2 * GAUSSIAN_RADIUS + 1) as f32 / 6.0;
    for dy in -GAUSSIAN_RADIUS..=GAUSSIAN_RADIUS {
        for dx in -GAUSSIAN_RADIUS..=GAUSSIAN_RADIUS {
            let x = cx as i64 + dx;
            let y = cy as i64 + dy;
            if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
                continue;
            }
            let v = (-((dx * dx + dy * dy) as f32) / (2.0 * sigma * sigma)).exp();
            let idx = y as usize * w + x as usize;
            map[idx] = map[idx].max(v);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticLoader {
    spec: SyntheticSpec,
    num_batches: usize,
    seed: u64,
    rng: StdRng,
    produced: usize,
}

impl SyntheticLoader {
    pub fn new(spec: SyntheticSpec, num_batches: usize, seed: u64) -> Self {
        Self {
            spec,
            num_batches,
            seed,
            rng: StdRng::seed_from_u64(seed),
            produced: 0,
        }
    }

    fn sample_object(&mut self) -> Object {
        let (out_h, out_w) = self.spec.out_size();
        let class = self.rng.random_range(0..self.spec.num_classes.max(1));
        let cx = self.rng.random_range(0.0..out_w as f32 - 1e-3);
        let cy = self.rng.random_range(0.0..out_h as f32 - 1e-3);
        Object {
            class,
            cx,
            cy,
            w: self.rng.random_range(1.0..out_w as f32 / 2.0 + 1.0),
            h: self.rng.random_range(1.0..out_h as f32 / 2.0 + 1.0),
            depth: self.rng.random_range(5.0..60.0),
            dim: [
                self.rng.random_range(1.2..2.0),
                self.rng.random_range(1.5..2.5),
                self.rng.random_range(3.0..5.0),
            ],
            alpha: self.rng.random_range(-PI..PI),
        }
    }

    fn build<B: Backend>(&mut self, device: &B::Device) -> Batch<B> {
        let spec = self.spec.clone();
        let (n, m) = (spec.batch_size, spec.max_objects);
        let (out_h, out_w) = spec.out_size();
        let (c, j) = (spec.num_classes.max(1), spec.num_joints);
        let first_id = (self.produced * n) as i64;

        let objects: Vec<Vec<Object>> = (0..n)
            .map(|_| {
                let count = self.rng.random_range(1..=m);
                (0..count).map(|_| self.sample_object()).collect()
            })
            .collect();

        let mut hm = vec![0f32; n * c * out_h * out_w];
        let mut ind = vec![0i64; n * m];
        let mut cat = vec![0i64; n * m];
        let mut mask = vec![0f32; n * m];
        let mut rotbin = vec![0i64; n * m * 2];
        let mut rotres = vec![0f32; n * m * 2];
        let mut dep = SlotBuffer::new(n, m, 1);
        let mut regression: Vec<(Head, SlotBuffer)> = spec
            .heads
            .iter()
            .filter(|h| h.is_regression())
            .map(|h| (*h, SlotBuffer::new(n, m, h.channels(c, j))))
            .collect();
        let mut att = SlotBuffer::new(n, m, Head::NuscenesAtt.channels(c, j));

        let mut hm_hp = vec![0f32; n * j * out_h * out_w];
        let mut hp_ind = vec![0i64; n * m * j];
        let mut hp_mask = vec![0f32; n * m * j];
        let mut joint = vec![0i64; n * m * j];
        let mut hp_offset = SlotBuffer::new(n, m * j, 2);

        let mut pc_hm = vec![0f32; n * spec.pc_channels * out_h * out_w];
        let mut gt_det = Vec::with_capacity(n);

        for (b, objs) in objects.iter().enumerate() {
            let mut dets = Vec::with_capacity(objs.len());
            for (k, obj) in objs.iter().enumerate() {
                let slot = b * m + k;
                let (ix, iy) = (obj.cx.floor() as usize, obj.cy.floor() as usize);
                let map = &mut hm[(b * c + obj.class) * out_h * out_w..][..out_h * out_w];
                draw_gaussian(map, out_h, out_w, ix, iy);

                ind[slot] = obj.ind(out_w) as i64;
                cat[slot] = obj.class as i64;
                mask[slot] = 1.0;
                let (bins, res) = obj.rotation_bins();
                rotbin[slot * 2..slot * 2 + 2].copy_from_slice(&bins);
                rotres[slot * 2..slot * 2 + 2].copy_from_slice(&res);
                dep.set(slot, &[obj.depth]);

                let (left, top) = (obj.cx - obj.w / 2.0, obj.cy - obj.h / 2.0);
                for (head, buf) in regression.iter_mut() {
                    let values: Vec<f32> = match head {
                        Head::Reg => vec![obj.cx - ix as f32, obj.cy - iy as f32],
                        Head::Wh => vec![obj.w, obj.h],
                        Head::Dim => obj.dim.to_vec(),
                        Head::Ltrb | Head::LtrbAmodal => vec![
                            left - ix as f32,
                            top - iy as f32,
                            left + obj.w - ix as f32,
                            top + obj.h - iy as f32,
                        ],
                        _ => (0..buf.dims)
                            .map(|_| self.rng.random_range(-1.0..1.0))
                            .collect(),
                    };
                    buf.set(slot, &values);
                }
                let mut one_hot = vec![0f32; att.dims];
                one_hot[self.rng.random_range(0..att.dims)] = 1.0;
                att.set(slot, &one_hot);

                for jj in 0..j {
                    let px = obj.cx + self.rng.random_range(-1.0..1.0);
                    let py = obj.cy + self.rng.random_range(-1.0..1.0);
                    let px = px.clamp(0.0, out_w as f32 - 1e-3);
                    let py = py.clamp(0.0, out_h as f32 - 1e-3);
                    let (pix, piy) = (px.floor() as usize, py.floor() as usize);
                    let map = &mut hm_hp[(b * j + jj) * out_h * out_w..][..out_h * out_w];
                    draw_gaussian(map, out_h, out_w, pix, piy);
                    let hp_slot = slot * j + jj;
                    hp_ind[hp_slot] = (piy * out_w + pix) as i64;
                    hp_mask[hp_slot] = 1.0;
                    joint[hp_slot] = jj as i64;
                    hp_offset.set(hp_slot, &[px - pix as f32, py - piy as f32]);
                }

                for ch in 0..spec.pc_channels {
                    pc_hm[((b * spec.pc_channels + ch) * out_h + iy) * out_w + ix] = obj.depth;
                }

                let r = spec.down_ratio as f32;
                let bbox = [left * r, top * r, (left + obj.w) * r, (top + obj.h) * r];
                dets.push(
                    Detection::new(bbox, obj.class as u32, 1.0)
                        .with_box3d(obj.dim, obj.depth, obj.alpha),
                );
            }
            gt_det.push(dets);
        }

        let t2 = |v: Vec<f32>| Tensor::<B, 2>::from_data(TensorData::new(v, [n, m]), device);
        let i2 = |v: Vec<i64>, cols: usize| {
            Tensor::<B, 2, Int>::from_data(TensorData::new(v, [n, cols]), device)
        };
        let t4 = |v: Vec<f32>, shape: [usize; 4]| {
            Tensor::<B, 4>::from_data(TensorData::new(v, shape), device)
        };

        let mut targets = LossTargets::new(i2(ind, m), t2(mask.clone()), i2(cat, m))
            .with_heatmap(t4(hm, [n, c, out_h, out_w]));
        let dep = dep.into_target::<B>(n, m, device);
        targets = targets.with_depth(dep.target, dep.mask);
        for (head, buf) in regression {
            let t = buf.into_target::<B>(n, m, device);
            targets = targets.with_regression(head, t.target, t.mask);
        }
        if spec.has(Head::Rot) || spec.has(Head::RotSec) {
            targets = targets.with_rotation(
                t2(mask),
                Tensor::from_data(TensorData::new(rotbin, [n, m, 2]), device),
                Tensor::from_data(TensorData::new(rotres, [n, m, 2]), device),
            );
        }
        if spec.has(Head::NuscenesAtt) {
            let t = att.into_target::<B>(n, m, device);
            targets = targets.with_attributes(t.target, t.mask);
        }
        if spec.has(Head::HmHp) && j > 0 {
            targets = targets.with_keypoints(KeypointTargets {
                hm_hp: t4(hm_hp, [n, j, out_h, out_w]),
                hp_ind: i2(hp_ind, m * j),
                hm_hp_mask: Tensor::from_data(TensorData::new(hp_mask, [n, m * j]), device),
                joint: i2(joint, m * j),
                hp_offset: Some(hp_offset.into_target::<B>(n, m * j, device)),
            });
        }

        let projection = [
            [FOCAL, 0.0, spec.input_w as f32 / 2.0, 0.0],
            [0.0, FOCAL, spec.input_h as f32 / 2.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ];
        let calib_flat: Vec<f32> = (0..n)
            .flat_map(|_| projection.iter().flatten().copied())
            .collect();
        let image_len = n * 3 * spec.input_h * spec.input_w;
        let image: Vec<f32> = (0..image_len)
            .map(|_| self.rng.random_range(-1.0..1.0))
            .collect();

        Batch {
            image: t4(image, [n, 3, spec.input_h, spec.input_w]),
            pc_hm: (spec.pc_channels > 0)
                .then(|| t4(pc_hm, [n, spec.pc_channels, out_h, out_w])),
            pc_dep: None,
            calib: Tensor::from_data(TensorData::new(calib_flat, [n, 3, 4]), device),
            targets,
            meta: BatchMeta {
                img_ids: (0..n as i64).map(|i| first_id + i).collect(),
                centers: vec![[spec.input_w as f32 / 2.0, spec.input_h as f32 / 2.0]; n],
                scales: vec![spec.input_h.max(spec.input_w) as f32; n],
                calib: Some(vec![projection; n]),
                gt_det: Some(gt_det),
            },
        }
    }
}

impl<B: Backend> BatchLoader<B> for SyntheticLoader {
    fn num_batches(&self) -> usize {
        self.num_batches
    }

    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.produced = 0;
    }

    fn next_batch(&mut self, device: &B::Device) -> anyhow::Result<Option<Batch<B>>> {
        if self.produced >= self.num_batches {
            return Ok(None);
        }
        let batch = self.build::<B>(device);
        self.produced += 1;
        Ok(Some(batch))
    }
}
