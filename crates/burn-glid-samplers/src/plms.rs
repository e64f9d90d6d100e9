//! PLMS (Pseudo Linear Multi-Step) progressive sampler
//!
//! Runs the respaced reverse process and yields one [`SampleState`] per step.
//! The first step uses a pseudo improved Euler update (two model evaluations);
//! later steps combine the stored noise history with Adams-Bashforth weights.

use std::collections::VecDeque;

use burn::prelude::*;

use crate::error::SamplerError;
use crate::respace::SpacedSchedule;

/// A denoising model function: `(x_t, timesteps) -> model output`
///
/// Timesteps are already mapped to the network's time scale, one per batch row.
pub trait DenoiseFn<B: Backend> {
    fn denoise(&self, x_t: Tensor<B, 4>, timesteps: Tensor<B, 1>) -> Result<Tensor<B, 4>, SamplerError>;
}

impl<B, F> DenoiseFn<B> for F
where
    B: Backend,
    F: Fn(Tensor<B, 4>, Tensor<B, 1>) -> Result<Tensor<B, 4>, SamplerError>,
{
    fn denoise(&self, x_t: Tensor<B, 4>, timesteps: Tensor<B, 1>) -> Result<Tensor<B, 4>, SamplerError> {
        self(x_t, timesteps)
    }
}

/// Configuration for the PLMS sampler
#[derive(Debug, Clone)]
pub struct PlmsConfig {
    /// Multistep order (1-4)
    pub order: usize,
    /// Clamp predicted x0 to [-1, 1]
    pub clip_denoised: bool,
}

impl Default for PlmsConfig {
    fn default() -> Self {
        Self {
            order: 2,
            clip_denoised: false,
        }
    }
}

/// State produced after each sampler step
#[derive(Debug, Clone)]
pub struct SampleState<B: Backend> {
    /// Latent to continue sampling from
    pub sample: Tensor<B, 4>,
    /// Predicted clean latent at this step
    pub pred_xstart: Tensor<B, 4>,
    /// Respaced timestep index of this step
    pub timestep: usize,
    /// Zero-based position in the loop
    pub iteration: usize,
}

/// Lazily evaluated PLMS sample loop
///
/// Each call to `next` runs one step. After an error the loop yields `None`.
/// Dropping it mid-way simply stops sampling.
pub struct PlmsSampleLoop<B: Backend, M> {
    model: M,
    schedule: SpacedSchedule,
    config: PlmsConfig,
    img: Tensor<B, 4>,
    indices: Vec<usize>,
    position: usize,
    old_eps: VecDeque<Tensor<B, 4>>,
    done: bool,
}

impl<B: Backend, M: DenoiseFn<B>> PlmsSampleLoop<B, M> {
    /// Create a sample loop
    ///
    /// # Arguments
    /// * `noise` - Starting noise, shape `[batch, channels, height, width]`
    /// * `init` - Optional latent to start from instead of pure noise
    /// * `skip_timesteps` - Number of leading (noisiest) steps to skip
    pub fn new(
        model: M,
        schedule: SpacedSchedule,
        config: PlmsConfig,
        noise: Tensor<B, 4>,
        init: Option<Tensor<B, 4>>,
        skip_timesteps: usize,
    ) -> Result<Self, SamplerError> {
        if !(1..=4).contains(&config.order) {
            return Err(SamplerError::InvalidOrder(config.order));
        }

        let num_timesteps = schedule.num_timesteps();
        let skip = if skip_timesteps >= num_timesteps {
            let clamped = num_timesteps.saturating_sub(1);
            tracing::warn!(
                "skip_timesteps {} >= {} steps, clamping to {}",
                skip_timesteps,
                num_timesteps,
                clamped
            );
            clamped
        } else {
            skip_timesteps
        };

        let indices: Vec<usize> = (0..num_timesteps - skip).rev().collect();

        let init = match init {
            Some(init) => Some(init),
            None if skip > 0 => Some(noise.zeros_like()),
            None => None,
        };

        let img = match (init, indices.first()) {
            (Some(init), Some(&first)) => schedule.q_sample(init, first, noise),
            _ => noise,
        };

        Ok(Self {
            model,
            schedule,
            config,
            img,
            indices,
            position: 0,
            old_eps: VecDeque::new(),
            done: false,
        })
    }

    /// Total number of steps this loop will yield
    pub fn total_steps(&self) -> usize {
        self.indices.len()
    }

    /// The respaced schedule driving this loop
    pub fn schedule(&self) -> &SpacedSchedule {
        &self.schedule
    }

    /// Evaluate the model and return `(eps, pred_xstart)`
    fn model_output(&self, x: &Tensor<B, 4>, t: usize) -> Result<(Tensor<B, 4>, Tensor<B, 4>), SamplerError> {
        let [n, c, h, w] = x.dims();
        let device = x.device();
        let timesteps = Tensor::<B, 1>::from_data(
            TensorData::new(vec![self.schedule.model_timestep(t); n], [n]),
            &device,
        );

        let output = self.model.denoise(x.clone(), timesteps)?;
        let out_channels = output.dims()[1];
        let model_eps = if out_channels == c {
            output
        } else if out_channels == 2 * c {
            // Learned variance occupies the trailing channels
            output.slice([0..n, 0..c, 0..h, 0..w])
        } else {
            return Err(SamplerError::ChannelMismatch {
                expected: c,
                actual: out_channels,
            });
        };

        let mut pred_xstart = self.schedule.predict_xstart_from_eps(x.clone(), t, model_eps);
        if self.config.clip_denoised {
            pred_xstart = pred_xstart.clamp(-1.0, 1.0);
        }
        let eps = self
            .schedule
            .predict_eps_from_xstart(x.clone(), t, pred_xstart.clone());

        Ok((eps, pred_xstart))
    }

    fn step(&mut self, t: usize) -> Result<SampleState<B>, SamplerError> {
        let x = self.img.clone();
        let alpha_bar_prev = self.schedule.alpha_cumprod_prev(t);
        let (eps, pred_xstart) = self.model_output(&x, t)?;

        let to_mean = |pred: Tensor<B, 4>, eps: Tensor<B, 4>| {
            pred * alpha_bar_prev.sqrt() + eps * (1.0 - alpha_bar_prev).sqrt()
        };

        let mean_pred = if self.config.order > 1 && self.position == 0 {
            // Pseudo improved Euler
            self.old_eps.push_back(eps.clone());
            let euler = to_mean(pred_xstart.clone(), eps.clone());
            let (eps_2, _) = self.model_output(&euler, t.saturating_sub(1))?;
            let eps_prime = (eps + eps_2) / 2.0;
            let pred_prime = self
                .schedule
                .predict_xstart_from_eps(x, t, eps_prime.clone());
            to_mean(pred_prime, eps_prime)
        } else {
            // Pseudo linear multistep (Adams-Bashforth)
            self.old_eps.push_back(eps);
            let eps_prime = adams_bashforth(&self.old_eps, self.config.order);
            let pred_prime = self
                .schedule
                .predict_xstart_from_eps(x, t, eps_prime.clone());
            to_mean(pred_prime, eps_prime)
        };

        if self.old_eps.len() >= self.config.order {
            self.old_eps.pop_front();
        }

        let sample = if t != 0 {
            mean_pred
        } else {
            pred_xstart.clone()
        };
        self.img = sample.clone();

        Ok(SampleState {
            sample,
            pred_xstart,
            timestep: t,
            iteration: self.position,
        })
    }
}

/// Combine the most recent eps values, newest last
fn adams_bashforth<B: Backend>(history: &VecDeque<Tensor<B, 4>>, order: usize) -> Tensor<B, 4> {
    let len = history.len();
    let recent = |k: usize| history[len - k].clone();
    match order.min(len) {
        1 => recent(1),
        2 => (recent(1) * 3.0 - recent(2)) / 2.0,
        3 => (recent(1) * 23.0 - recent(2) * 16.0 + recent(3) * 5.0) / 12.0,
        _ => (recent(1) * 55.0 - recent(2) * 59.0 + recent(3) * 37.0 - recent(4) * 9.0) / 24.0,
    }
}

impl<B: Backend, M: DenoiseFn<B>> Iterator for PlmsSampleLoop<B, M> {
    type Item = Result<SampleState<B>, SamplerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let Some(&t) = self.indices.get(self.position) else {
            self.done = true;
            return None;
        };

        match self.step(t) {
            Ok(state) => {
                self.position += 1;
                Some(Ok(state))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.done {
            0
        } else {
            self.indices.len() - self.position
        };
        (0, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::respace::SpacedSchedule;
    use crate::scheduler::{BetaSchedule, NoiseSchedule};
    use burn_ndarray::NdArray;
    use std::cell::Cell;

    type TestBackend = NdArray<f32>;

    fn schedule(steps: usize) -> SpacedSchedule {
        let base = NoiseSchedule::named(BetaSchedule::Linear, 1000);
        SpacedSchedule::from_spec(&base, &steps.to_string(), true).unwrap()
    }

    fn zero_eps(x: Tensor<TestBackend, 4>, _t: Tensor<TestBackend, 1>) -> Result<Tensor<TestBackend, 4>, SamplerError> {
        Ok(x.zeros_like())
    }

    #[test]
    fn test_invalid_order() {
        let device = Default::default();
        let noise = Tensor::<TestBackend, 4>::zeros([2, 4, 2, 2], &device);
        let config = PlmsConfig {
            order: 5,
            ..Default::default()
        };
        let result = PlmsSampleLoop::new(zero_eps, schedule(15), config, noise, None, 0);
        assert!(matches!(result, Err(SamplerError::InvalidOrder(5))));
    }

    #[test]
    fn test_yields_one_state_per_step() {
        let device = Default::default();
        let noise = Tensor::<TestBackend, 4>::ones([2, 4, 2, 2], &device);
        let sampler =
            PlmsSampleLoop::new(zero_eps, schedule(15), PlmsConfig::default(), noise, None, 0).unwrap();
        assert_eq!(sampler.total_steps(), 15);

        let states: Vec<_> = sampler.collect::<Result<_, _>>().unwrap();
        assert_eq!(states.len(), 15);
        assert_eq!(states[0].timestep, 14);
        assert_eq!(states[14].timestep, 0);
        assert_eq!(states[14].iteration, 14);
        assert_eq!(states[0].sample.dims(), [2, 4, 2, 2]);
    }

    #[test]
    fn test_zero_eps_recovers_scaled_input() {
        // With eps = 0 the final sample is x_T / sqrt(ᾱ_T)
        let device = Default::default();
        let spaced = schedule(20);
        let expected = 1.0 / spaced.alpha_cumprod(19).sqrt();
        let noise = Tensor::<TestBackend, 4>::ones([2, 4, 1, 1], &device);
        let sampler =
            PlmsSampleLoop::new(zero_eps, spaced, PlmsConfig::default(), noise, None, 0).unwrap();

        let last = sampler.last().unwrap().unwrap();
        let values = last.sample.into_data().to_vec::<f32>().unwrap();
        for v in values {
            assert!((v as f64 - expected).abs() / expected < 1e-3, "{v} vs {expected}");
        }
    }

    #[test]
    fn test_skip_timesteps() {
        let device = Default::default();
        let noise = Tensor::<TestBackend, 4>::zeros([2, 4, 2, 2], &device);
        let init = Tensor::<TestBackend, 4>::ones([2, 4, 2, 2], &device);
        let sampler = PlmsSampleLoop::new(
            zero_eps,
            schedule(20),
            PlmsConfig::default(),
            noise,
            Some(init),
            10,
        )
        .unwrap();
        assert_eq!(sampler.total_steps(), 10);
        assert_eq!(sampler.count(), 10);
    }

    #[test]
    fn test_skip_all_is_clamped() {
        let device = Default::default();
        let noise = Tensor::<TestBackend, 4>::zeros([2, 4, 2, 2], &device);
        let sampler =
            PlmsSampleLoop::new(zero_eps, schedule(15), PlmsConfig::default(), noise, None, 15)
                .unwrap();
        assert_eq!(sampler.total_steps(), 1);
    }

    #[test]
    fn test_first_step_evaluates_twice() {
        let device = Default::default();
        let calls = Cell::new(0usize);
        let model = |x: Tensor<TestBackend, 4>, _t: Tensor<TestBackend, 1>| -> Result<Tensor<TestBackend, 4>, SamplerError> {
            calls.set(calls.get() + 1);
            Ok(x.zeros_like())
        };
        let noise = Tensor::<TestBackend, 4>::zeros([2, 4, 2, 2], &device);
        let mut sampler =
            PlmsSampleLoop::new(&model, schedule(15), PlmsConfig::default(), noise, None, 0).unwrap();

        sampler.next().unwrap().unwrap();
        assert_eq!(calls.get(), 2);
        sampler.next().unwrap().unwrap();
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_model_error_fuses() {
        let device = Default::default();
        let failing = |_x: Tensor<TestBackend, 4>, _t: Tensor<TestBackend, 1>| -> Result<Tensor<TestBackend, 4>, SamplerError> {
            Err(SamplerError::Model("boom".into()))
        };
        let noise = Tensor::<TestBackend, 4>::zeros([2, 4, 2, 2], &device);
        let mut sampler =
            PlmsSampleLoop::new(failing, schedule(15), PlmsConfig::default(), noise, None, 0).unwrap();

        assert!(matches!(sampler.next(), Some(Err(SamplerError::Model(_)))));
        assert!(sampler.next().is_none());
    }

    #[test]
    fn test_channel_mismatch() {
        let device = Default::default();
        let model = |x: Tensor<TestBackend, 4>, _t: Tensor<TestBackend, 1>| -> Result<Tensor<TestBackend, 4>, SamplerError> {
            let [n, _, h, w] = x.dims();
            Ok(Tensor::zeros([n, 3, h, w], &x.device()))
        };
        let noise = Tensor::<TestBackend, 4>::zeros([2, 4, 2, 2], &device);
        let mut sampler =
            PlmsSampleLoop::new(model, schedule(15), PlmsConfig::default(), noise, None, 0).unwrap();
        assert!(matches!(
            sampler.next(),
            Some(Err(SamplerError::ChannelMismatch { expected: 4, actual: 3 }))
        ));
    }
}
