//! Base noise schedules
//!
//! Values are host-side `f64` scalars indexed by timestep.

use serde::{Deserialize, Serialize};

/// Named beta schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetaSchedule {
    /// Betas evenly spaced from 0.00085 to 0.012
    #[default]
    Linear,
    /// Squared-cosine alpha-bar schedule
    Cosine,
}

/// Precomputed base schedule over the full training timestep range
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    /// Per-step betas
    pub betas: Vec<f64>,
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// Linear beta schedule, endpoints inclusive
    pub fn linear(num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let denom = num_steps.saturating_sub(1).max(1) as f64;
        let betas = (0..num_steps)
            .map(|i| beta_start + (i as f64 / denom) * (beta_end - beta_start))
            .collect();
        Self::from_betas(betas)
    }

    /// Cosine schedule: betas derived from ᾱ(t) = cos²((t + 0.008) / 1.008 · π/2)
    pub fn cosine(num_steps: usize) -> Self {
        let alpha_bar =
            |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
        let betas = (0..num_steps)
            .map(|i| {
                let t1 = i as f64 / num_steps as f64;
                let t2 = (i + 1) as f64 / num_steps as f64;
                (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
            })
            .collect();
        Self::from_betas(betas)
    }

    /// Build the named schedule
    pub fn named(kind: BetaSchedule, num_steps: usize) -> Self {
        match kind {
            BetaSchedule::Linear => Self::linear(num_steps, 0.00085, 0.012),
            BetaSchedule::Cosine => Self::cosine(num_steps),
        }
    }

    /// Build from explicit betas
    pub fn from_betas(betas: Vec<f64>) -> Self {
        let mut cumprod = 1.0f64;
        let alphas_cumprod = betas
            .iter()
            .map(|beta| {
                cumprod *= 1.0 - beta;
                cumprod
            })
            .collect();
        Self {
            betas,
            alphas_cumprod,
        }
    }

    /// Number of training timesteps
    pub fn num_train_steps(&self) -> usize {
        self.betas.len()
    }
}
