//! Host-side dense arrays handed from the detection decoder to post-processing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArrayError {
    #[error("shape {shape:?} needs {expected} values, got {actual}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("missing array: {0}")]
    Missing(String),
}

/// Row-major `f32` array with an explicit shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostArray {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostArray {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, ArrayError> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(ArrayError::ShapeMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, index: &[usize]) -> Option<f32> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0usize;
        for (i, (&idx, &dim)) in index.iter().zip(&self.shape).enumerate() {
            if idx >= dim {
                return None;
            }
            let stride: usize = self.shape[i + 1..].iter().product();
            offset += idx * stride;
        }
        self.data.get(offset).copied()
    }

    /// Trailing values at a leading index prefix, e.g. the `[4]` box of `bboxes[b, k]`.
    pub fn row(&self, prefix: &[usize]) -> Option<&[f32]> {
        if prefix.len() > self.shape.len() {
            return None;
        }
        let mut offset = 0usize;
        for (i, (&idx, &dim)) in prefix.iter().zip(&self.shape).enumerate() {
            if idx >= dim {
                return None;
            }
            let stride: usize = self.shape[i + 1..].iter().product();
            offset += idx * stride;
        }
        let len: usize = self.shape[prefix.len()..].iter().product();
        self.data.get(offset..offset + len)
    }
}

/// Named decoder outputs (`scores`, `clses`, `bboxes`, `dep`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostArrays(BTreeMap<String, HostArray>);

impl HostArrays {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, array: HostArray) {
        self.0.insert(name.into(), array);
    }

    pub fn get(&self, name: &str) -> Option<&HostArray> {
        self.0.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&HostArray, ArrayError> {
        self.0
            .get(name)
            .ok_or_else(|| ArrayError::Missing(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_shape() {
        let err = HostArray::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert_eq!(
            err,
            ArrayError::ShapeMismatch {
                shape: vec![2, 3],
                expected: 6,
                actual: 5
            }
        );
    }

    #[test]
    fn indexes_row_major() {
        let values = (0..12).map(|v| v as f32).collect();
        let arr = HostArray::new(vec![2, 2, 3], values).unwrap();
        assert_eq!(arr.get(&[1, 0, 2]), Some(8.0));
        assert_eq!(arr.get(&[2, 0, 0]), None);
        assert_eq!(arr.row(&[1, 1]), Some(&[9.0, 10.0, 11.0][..]));
        assert_eq!(arr.row(&[0]).map(<[f32]>::len), Some(6));
    }
}
