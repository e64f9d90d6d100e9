//! Seeded Gaussian noise
//!
//! Drawn on the host so a seed reproduces the same latents on every backend.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// RNG for one predict call
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Standard normal tensor of `shape`
pub fn randn<B: Backend>(rng: &mut StdRng, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
    let data: Vec<f32> = (0..shape.iter().product::<usize>())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Tensor::from_data(TensorData::new(data, shape), device)
}
