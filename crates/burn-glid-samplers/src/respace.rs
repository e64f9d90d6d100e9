//! Timestep respacing
//!
//! Inference runs on a subset of the training timesteps. The subset is described
//! by a string: either `"ddimN"` for a uniform stride yielding exactly `N` steps,
//! or comma-separated section counts (`"27"`, `"10,15,5"`) where the training
//! range is cut into equal sections and each section takes its count of evenly
//! strided indices.

use std::collections::BTreeSet;

use burn::prelude::*;

use crate::error::SamplerError;
use crate::scheduler::NoiseSchedule;

/// Select the training timesteps to keep for a respacing spec
pub fn space_timesteps(num_timesteps: usize, spec: &str) -> Result<BTreeSet<usize>, SamplerError> {
    let invalid = |reason: String| SamplerError::InvalidRespacing {
        spec: spec.to_string(),
        reason,
    };

    if let Some(count) = spec.strip_prefix("ddim") {
        let desired: usize = count
            .trim()
            .parse()
            .map_err(|e| invalid(format!("bad step count: {e}")))?;
        for stride in 1..num_timesteps {
            if num_timesteps.div_ceil(stride) == desired {
                return Ok((0..num_timesteps).step_by(stride).collect());
            }
        }
        return Err(invalid(format!(
            "cannot create exactly {desired} steps with an integer stride"
        )));
    }

    let section_counts = spec
        .split(',')
        .map(|part| part.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(format!("bad section count: {e}")))?;
    if section_counts.is_empty() {
        return Err(invalid("no sections".to_string()));
    }

    let size_per = num_timesteps / section_counts.len();
    let extra = num_timesteps % section_counts.len();
    let mut start_idx = 0usize;
    let mut all_steps = BTreeSet::new();

    for (i, &section_count) in section_counts.iter().enumerate() {
        let size = size_per + usize::from(i < extra);
        if size < section_count {
            return Err(invalid(format!(
                "cannot divide section of {size} steps into {section_count}"
            )));
        }
        let frac_stride = if section_count <= 1 {
            1.0
        } else {
            (size - 1) as f64 / (section_count - 1) as f64
        };
        // Indices round the running sum, not i * stride
        let mut cur_idx = 0.0f64;
        for _ in 0..section_count {
            all_steps.insert(start_idx + cur_idx.round_ties_even() as usize);
            cur_idx += frac_stride;
        }
        start_idx += size;
    }

    Ok(all_steps)
}

/// A respaced view of a base [`NoiseSchedule`]
///
/// Index `t` here is the respaced step index in `0..num_timesteps()`; the
/// original training timestep is `timestep_map[t]`.
#[derive(Debug, Clone)]
pub struct SpacedSchedule {
    alphas_cumprod: Vec<f64>,
    timestep_map: Vec<usize>,
    original_num_steps: usize,
    rescale_timesteps: bool,
}

impl SpacedSchedule {
    /// Keep only `use_timesteps` from the base schedule
    pub fn new(base: &NoiseSchedule, use_timesteps: &BTreeSet<usize>, rescale_timesteps: bool) -> Self {
        let mut last_alpha_cumprod = 1.0f64;
        let mut betas = Vec::with_capacity(use_timesteps.len());
        let mut timestep_map = Vec::with_capacity(use_timesteps.len());

        for (i, &alpha_cumprod) in base.alphas_cumprod.iter().enumerate() {
            if use_timesteps.contains(&i) {
                betas.push(1.0 - alpha_cumprod / last_alpha_cumprod);
                last_alpha_cumprod = alpha_cumprod;
                timestep_map.push(i);
            }
        }

        let spaced = NoiseSchedule::from_betas(betas);
        Self {
            alphas_cumprod: spaced.alphas_cumprod,
            timestep_map,
            original_num_steps: base.num_train_steps(),
            rescale_timesteps,
        }
    }

    /// Respace a base schedule from a spec string such as `"27"` or `"ddim50"`
    pub fn from_spec(base: &NoiseSchedule, spec: &str, rescale_timesteps: bool) -> Result<Self, SamplerError> {
        let use_timesteps = space_timesteps(base.num_train_steps(), spec)?;
        Ok(Self::new(base, &use_timesteps, rescale_timesteps))
    }

    /// Number of respaced steps
    pub fn num_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// Original training timesteps, indexed by respaced step
    pub fn timestep_map(&self) -> &[usize] {
        &self.timestep_map
    }

    /// ᾱ at respaced step `t`
    pub fn alpha_cumprod(&self, t: usize) -> f64 {
        self.alphas_cumprod[t]
    }

    /// ᾱ at respaced step `t - 1`, or 1.0 at the first step
    pub fn alpha_cumprod_prev(&self, t: usize) -> f64 {
        if t == 0 {
            1.0
        } else {
            self.alphas_cumprod[t - 1]
        }
    }

    /// Timestep value fed to the network for respaced step `t`
    pub fn model_timestep(&self, t: usize) -> f32 {
        let original = self.timestep_map[t] as f64;
        if self.rescale_timesteps {
            (original * 1000.0 / self.original_num_steps as f64) as f32
        } else {
            original as f32
        }
    }

    /// Diffuse `x_start` forward to step `t`
    pub fn q_sample<B: Backend>(&self, x_start: Tensor<B, 4>, t: usize, noise: Tensor<B, 4>) -> Tensor<B, 4> {
        let alpha_cumprod = self.alpha_cumprod(t);
        x_start * alpha_cumprod.sqrt() + noise * (1.0 - alpha_cumprod).sqrt()
    }

    /// x0 = sqrt(1/ᾱ)·x − sqrt(1/ᾱ − 1)·eps
    pub fn predict_xstart_from_eps<B: Backend>(&self, x_t: Tensor<B, 4>, t: usize, eps: Tensor<B, 4>) -> Tensor<B, 4> {
        let alpha_cumprod = self.alpha_cumprod(t);
        x_t * (1.0 / alpha_cumprod).sqrt() - eps * (1.0 / alpha_cumprod - 1.0).sqrt()
    }

    /// eps = (sqrt(1/ᾱ)·x − x0) / sqrt(1/ᾱ − 1)
    pub fn predict_eps_from_xstart<B: Backend>(&self, x_t: Tensor<B, 4>, t: usize, pred_xstart: Tensor<B, 4>) -> Tensor<B, 4> {
        let alpha_cumprod = self.alpha_cumprod(t);
        (x_t * (1.0 / alpha_cumprod).sqrt() - pred_xstart) / (1.0 / alpha_cumprod - 1.0).sqrt()
    }
}
