//! Classifier-free guidance arithmetic
//!
//! Guided batches stack the conditional rows first and the unconditional rows
//! second along dim 0. These helpers split and refill such batches.

use burn::prelude::*;

use crate::error::SamplerError;

/// Apply classifier-free guidance
///
/// Combines conditional and unconditional predictions:
/// `output = uncond + guidance_scale * (cond - uncond)`
pub fn apply_guidance<B: Backend>(
    noise_pred_uncond: Tensor<B, 4>,
    noise_pred_cond: Tensor<B, 4>,
    guidance_scale: f64,
) -> Tensor<B, 4> {
    noise_pred_uncond.clone() + (noise_pred_cond - noise_pred_uncond) * guidance_scale
}

/// Split a guided batch into its `(first, second)` halves along dim 0
pub fn split_halves<B: Backend>(x: Tensor<B, 4>) -> Result<(Tensor<B, 4>, Tensor<B, 4>), SamplerError> {
    let [n, c, h, w] = x.dims();
    if n % 2 != 0 {
        return Err(SamplerError::OddBatch(n));
    }
    let half = n / 2;
    let first = x.clone().slice([0..half, 0..c, 0..h, 0..w]);
    let second = x.slice([half..n, 0..c, 0..h, 0..w]);
    Ok((first, second))
}

/// Stack `half` twice along dim 0
pub fn duplicate_halves<B: Backend>(half: Tensor<B, 4>) -> Tensor<B, 4> {
    Tensor::cat(vec![half.clone(), half], 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_guidance_scale_one_is_cond() {
        let device = Default::default();
        let uncond = Tensor::<TestBackend, 4>::ones([1, 3, 2, 2], &device) * 2.0;
        let cond = Tensor::<TestBackend, 4>::ones([1, 3, 2, 2], &device) * 5.0;

        let guided = apply_guidance(uncond.clone(), cond.clone(), 1.0);
        let diff: f32 = (guided - cond.clone()).abs().max().into_scalar();
        assert!(diff < 1e-6);

        let guided = apply_guidance(uncond.clone(), cond, 0.0);
        let diff: f32 = (guided - uncond).abs().max().into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_guidance_extrapolates() {
        let device = Default::default();
        let uncond = Tensor::<TestBackend, 4>::zeros([1, 1, 1, 1], &device);
        let cond = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
        let guided: f32 = apply_guidance(uncond, cond, 5.0).into_scalar();
        assert!((guided - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_split_halves_odd_batch() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::zeros([3, 4, 2, 2], &device);
        assert!(matches!(split_halves(x), Err(SamplerError::OddBatch(3))));
    }

    #[test]
    fn test_split_then_duplicate() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::from_floats([[[[1.0]]], [[[2.0]]]], &device);
        let (first, second) = split_halves(x).unwrap();
        assert_eq!(first.clone().into_scalar(), 1.0);
        assert_eq!(second.into_scalar(), 2.0);

        let doubled = duplicate_halves(first);
        assert_eq!(doubled.dims(), [2, 1, 1, 1]);
        let values = doubled.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![1.0, 1.0]);
    }
}
