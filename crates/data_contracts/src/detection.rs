use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Post-processed 3D detection for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Image-space box `[x0, y0, x1, y1]` in input pixels.
    pub bbox: [f32; 4],
    pub class: u32,
    pub score: f32,
    /// Object dimensions `[h, w, l]`; absent for 2D-only head sets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<f32>,
    /// Yaw around the camera y axis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rot_y: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking: Option<[f32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nuscenes_att: Option<Vec<f32>>,
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("unknown head name: {0}")]
    UnknownHead(String),
    #[error("bbox invalid order or NaN: {0:?}")]
    InvalidBbox([f32; 4]),
    #[error("score out of range: {0}")]
    InvalidScore(f32),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Detection {
    pub fn new(bbox: [f32; 4], class: u32, score: f32) -> Self {
        Self {
            bbox,
            class,
            score,
            dim: None,
            depth: None,
            rot_y: None,
            alpha: None,
            loc: None,
            tracking: None,
            velocity: None,
            nuscenes_att: None,
        }
    }

    pub fn with_box3d(mut self, dim: [f32; 3], depth: f32, rot_y: f32) -> Self {
        self.dim = Some(dim);
        self.depth = Some(depth);
        self.rot_y = Some(rot_y);
        self
    }

    /// True when every predicted dimension is strictly positive, or no dimensions were decoded.
    pub fn has_positive_dims(&self) -> bool {
        self.dim.map_or(true, |d| d.iter().all(|v| *v > 0.0))
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        let b = self.bbox;
        if b.iter().any(|v| v.is_nan()) || b[0] > b[2] || b[1] > b[3] {
            return Err(ContractError::InvalidBbox(b));
        }
        if self.score.is_nan() || !(0.0..=1.0).contains(&self.score) {
            return Err(ContractError::InvalidScore(self.score));
        }
        Ok(())
    }
}

/// Evaluation output keyed by image id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvalResults(BTreeMap<i64, Vec<Detection>>);

impl EvalResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any detections previously recorded for `img_id`.
    pub fn insert(&mut self, img_id: i64, dets: Vec<Detection>) {
        self.0.insert(img_id, dets);
    }

    pub fn get(&self, img_id: i64) -> Option<&[Detection]> {
        self.0.get(&img_id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&i64, &Vec<Detection>)> {
        self.0.iter()
    }

    pub fn num_detections(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn save_json(&self, path: &Path) -> Result<(), ContractError> {
        let json = serde_json::to_vec_pretty(self).map_err(|source| ContractError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| ContractError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_json(path: &Path) -> Result<Self, ContractError> {
        let raw = fs::read(path).map_err(|source| ContractError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ContractError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}
