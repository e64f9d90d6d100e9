//! Aesthetic embedding fusion

use burn::prelude::*;

use crate::error::GlidError;

const NORM_EPS: f64 = 1e-12;

/// L2-normalize each row
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let dims = x.dims();
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(NORM_EPS);
    x / norm.expand(dims)
}

/// Blend prompt CLIP embeddings with an aesthetic embedding and renormalize
///
/// `prompt` is `[N, D]`, `aesthetic` is `[1, D]` or `[N, D]`.
/// Returns `normalize(prompt * (1 - weight) + aesthetic * weight)`.
pub fn fuse<B: Backend>(
    prompt: Tensor<B, 2>,
    aesthetic: Tensor<B, 2>,
    weight: f64,
) -> Result<Tensor<B, 2>, GlidError> {
    let [n, d] = prompt.dims();
    let [rows, aesthetic_dim] = aesthetic.dims();
    if aesthetic_dim != d {
        return Err(GlidError::EmbeddingDimMismatch {
            prompt: d,
            aesthetic: aesthetic_dim,
        });
    }
    let aesthetic = match rows {
        r if r == n => aesthetic,
        1 => aesthetic.expand([n, d]),
        r => {
            return Err(GlidError::invalid(
                "aesthetic_embedding",
                format!("{r} rows cannot broadcast to {n}"),
            ));
        }
    };

    Ok(l2_normalize(prompt * (1.0 - weight) + aesthetic * weight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn rows(t: Tensor<TestBackend, 2>) -> Vec<Vec<f32>> {
        let [_, d] = t.dims();
        let v: Vec<f32> = t.into_data().to_vec().unwrap();
        v.chunks(d).map(|c| c.to_vec()).collect()
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
        }
    }

    fn tensor(data: Vec<f32>, shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::from_data(TensorData::new(data, shape), &Default::default())
    }

    #[test]
    fn test_weight_zero_keeps_prompt_direction() {
        let prompt = tensor(vec![3.0, 4.0, 0.0, 0.0, 0.0, 2.0], [2, 3]);
        let aesthetic = tensor(vec![1.0, 1.0, 1.0], [1, 3]);
        let out = rows(fuse(prompt, aesthetic, 0.0).unwrap());
        assert_close(&out[0], &[0.6, 0.8, 0.0]);
        assert_close(&out[1], &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_weight_one_takes_aesthetic_direction() {
        let prompt = tensor(vec![3.0, 4.0, 0.0, -1.0, 0.5, 2.0], [2, 3]);
        let aesthetic = tensor(vec![0.0, 2.0, 0.0], [1, 3]);
        let out = rows(fuse(prompt, aesthetic, 1.0).unwrap());
        assert_close(&out[0], &[0.0, 1.0, 0.0]);
        assert_close(&out[1], &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_output_is_unit_norm() {
        let prompt = tensor(vec![1.0, 2.0, 3.0, 4.0], [1, 4]);
        let aesthetic = tensor(vec![-4.0, 0.5, 0.0, 1.0], [1, 4]);
        let out = rows(fuse(prompt, aesthetic, 0.5).unwrap());
        let norm: f32 = out[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_zero_vector_does_not_produce_nan() {
        let prompt = tensor(vec![0.0; 3], [1, 3]);
        let aesthetic = tensor(vec![0.0; 3], [1, 3]);
        let out = rows(fuse(prompt, aesthetic, 0.5).unwrap());
        assert!(out[0].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_dim_mismatch() {
        let prompt = tensor(vec![1.0; 4], [1, 4]);
        let aesthetic = tensor(vec![1.0; 3], [1, 3]);
        assert!(matches!(
            fuse(prompt, aesthetic, 0.5),
            Err(GlidError::EmbeddingDimMismatch { prompt: 4, aesthetic: 3 })
        ));
    }
}
