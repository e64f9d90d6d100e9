//! Samplers for guided latent diffusion
//!
//! - [`NoiseSchedule`] - base beta schedule (linear or cosine)
//! - [`SpacedSchedule`] - respaced subset of the base schedule used at inference
//! - [`PlmsSampleLoop`] - progressive pseudo linear multistep sampler
//! - [`apply_guidance`] - classifier-free guidance arithmetic

pub mod error;
pub mod guidance;
pub mod plms;
pub mod respace;
pub mod scheduler;

pub use error::SamplerError;
pub use guidance::{apply_guidance, duplicate_halves, split_halves};
pub use plms::{DenoiseFn, PlmsConfig, PlmsSampleLoop, SampleState};
pub use respace::{SpacedSchedule, space_timesteps};
pub use scheduler::{BetaSchedule, NoiseSchedule};
