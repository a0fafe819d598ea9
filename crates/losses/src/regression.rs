use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::depth::weighted_l1;
use crate::gather::transpose_and_gather_feat;

/// Weighted L1 for box-size, offset, tracking, dimension and velocity style heads.
///
/// `mask` and `target` are `[N, M, D]` with `D` equal to the head's channel count.
pub fn reg_weighted_l1<B: Backend>(
    output: Tensor<B, 4>,
    mask: Tensor<B, 3>,
    ind: Tensor<B, 2, Int>,
    target: Tensor<B, 3>,
    weights: Option<Tensor<B, 2>>,
) -> Tensor<B, 1> {
    let pred = transpose_and_gather_feat(output, ind);
    weighted_l1(pred, target, mask, weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;

    type B = burn_ndarray::NdArray<f32>;

    #[test]
    fn masked_entries_do_not_contribute() {
        let device = Default::default();
        // [1, 2, 1, 2]: location 0 -> (1, 3), location 1 -> (2, 4)
        let output = Tensor::<B, 4>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [1, 2, 1, 2]),
            &device,
        );
        let ind = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![0i64, 1], [1, 2]), &device);
        let target = Tensor::<B, 3>::from_data(
            TensorData::new(vec![0.0f32, 0.0, 100.0, 100.0], [1, 2, 2]),
            &device,
        );
        let mask = Tensor::<B, 3>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 0.0, 0.0], [1, 2, 2]),
            &device,
        );
        let got = reg_weighted_l1(output, mask, ind, target, None)
            .into_data()
            .to_vec::<f32>()
            .unwrap()[0];
        assert!((got - 4.0 / (2.0 + 1e-4)).abs() < 1e-5);
    }

    #[test]
    fn weights_scale_each_object() {
        let device = Default::default();
        let output = Tensor::<B, 4>::zeros([1, 1, 1, 2], &device);
        let ind = Tensor::<B, 2, Int>::from_data(TensorData::new(vec![0i64, 1], [1, 2]), &device);
        let target = Tensor::<B, 3>::ones([1, 2, 1], &device);
        let mask = Tensor::<B, 3>::ones([1, 2, 1], &device);
        let weights = Tensor::<B, 2>::from_data([[1.0f32, 3.0]], &device);
        let got = reg_weighted_l1(output, mask, ind, target, Some(weights))
            .into_data()
            .to_vec::<f32>()
            .unwrap()[0];
        assert!((got - 4.0 / (2.0 + 1e-4)).abs() < 1e-5);
    }
}
