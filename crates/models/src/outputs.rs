use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use data_contracts::Head;
use std::collections::BTreeMap;

/// Predictions of one stack, keyed by head. Every tensor is `[N, C, H, W]`.
#[derive(Debug, Clone)]
pub struct HeadOutputs<B: Backend> {
    heads: BTreeMap<Head, Tensor<B, 4>>,
}

impl<B: Backend> Default for HeadOutputs<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> HeadOutputs<B> {
    pub fn new() -> Self {
        Self {
            heads: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, head: Head, tensor: Tensor<B, 4>) -> Option<Tensor<B, 4>> {
        self.heads.insert(head, tensor)
    }

    pub fn get(&self, head: Head) -> Option<&Tensor<B, 4>> {
        self.heads.get(&head)
    }

    pub fn remove(&mut self, head: Head) -> Option<Tensor<B, 4>> {
        self.heads.remove(&head)
    }

    pub fn contains(&self, head: Head) -> bool {
        self.heads.contains_key(&head)
    }

    pub fn heads(&self) -> impl Iterator<Item = Head> + '_ {
        self.heads.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Head, &Tensor<B, 4>)> {
        self.heads.iter().map(|(h, t)| (*h, t))
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Output map resolution `(height, width)` taken from the `hm` head.
    pub fn heatmap_size(&self) -> Option<(usize, usize)> {
        self.heads.get(&Head::Hm).map(|t| {
            let [_, _, h, w] = t.dims();
            (h, w)
        })
    }

    pub fn detach(self) -> Self {
        Self {
            heads: self
                .heads
                .into_iter()
                .map(|(h, t)| (h, t.detach()))
                .collect(),
        }
    }
}

impl<B: Backend> FromIterator<(Head, Tensor<B, 4>)> for HeadOutputs<B> {
    fn from_iter<T: IntoIterator<Item = (Head, Tensor<B, 4>)>>(iter: T) -> Self {
        Self {
            heads: iter.into_iter().collect(),
        }
    }
}
