//! Predict inputs and model configuration

use std::path::{Path, PathBuf};

use burn_glid_samplers::BetaSchedule;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::GlidError;

pub const BATCH_SIZES: [usize; 6] = [1, 2, 3, 4, 6, 8];
pub const IMAGE_SIZES: [usize; 5] = [128, 192, 256, 320, 384];
pub const MAX_SEED: i64 = u32::MAX as i64;

/// Inputs to a single predict call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictInput {
    pub prompt: String,
    /// Aesthetic bucket 1..=9, or 0 to skip aesthetic fusion
    pub aesthetic_rating: u8,
    /// Weight of the aesthetic embedding in the fused CLIP embedding
    pub aesthetic_weight: f64,
    /// Text for the unconditional half of the batch
    pub negative: String,
    pub init_image: Option<PathBuf>,
    /// Fraction of sampling steps skipped when starting from `init_image`
    pub init_skip_fraction: f64,
    pub batch_size: usize,
    pub width: usize,
    pub height: usize,
    /// RNG seed, -1 picks one at random
    pub seed: i64,
    pub guidance_scale: f64,
    pub steps: usize,
}

impl Default for PredictInput {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            aesthetic_rating: 9,
            aesthetic_weight: 0.5,
            negative: String::new(),
            init_image: None,
            init_skip_fraction: 0.0,
            batch_size: 4,
            width: 256,
            height: 256,
            seed: -1,
            guidance_scale: 5.0,
            steps: 150,
        }
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), GlidError> {
    if !value.is_finite() {
        return Err(GlidError::invalid(field, format!("{value} is not finite")));
    }
    if value < min || value > max {
        return Err(GlidError::invalid(
            field,
            format!("{value} outside {min}..={max}"),
        ));
    }
    Ok(())
}

fn check_choice(field: &'static str, value: usize, choices: &[usize]) -> Result<(), GlidError> {
    if choices.contains(&value) {
        Ok(())
    } else {
        Err(GlidError::invalid(
            field,
            format!("{value} not one of {choices:?}"),
        ))
    }
}

impl PredictInput {
    /// Check every field against its public bounds
    pub fn validate(&self) -> Result<(), GlidError> {
        if self.aesthetic_rating > 9 {
            return Err(GlidError::invalid(
                "aesthetic_rating",
                format!("{} outside 0..=9", self.aesthetic_rating),
            ));
        }
        check_range("aesthetic_weight", self.aesthetic_weight, 0.0, 1.0)?;
        check_range("init_skip_fraction", self.init_skip_fraction, 0.0, 1.0)?;
        check_choice("batch_size", self.batch_size, &BATCH_SIZES)?;
        check_choice("width", self.width, &IMAGE_SIZES)?;
        check_choice("height", self.height, &IMAGE_SIZES)?;
        if !(-1..=MAX_SEED).contains(&self.seed) {
            return Err(GlidError::invalid(
                "seed",
                format!("{} outside -1..={MAX_SEED}", self.seed),
            ));
        }
        check_range("guidance_scale", self.guidance_scale, -20.0, 100.0)?;
        if !(15..=250).contains(&self.steps) {
            return Err(GlidError::invalid(
                "steps",
                format!("{} outside 15..=250", self.steps),
            ));
        }
        Ok(())
    }

    /// The seed to run with, drawing a fresh one for -1
    pub fn resolve_seed(&self) -> u64 {
        if self.seed < 0 {
            rand::rng().random_range(0..=u32::MAX as u64)
        } else {
            self.seed as u64
        }
    }

    /// Grid row length: the batch, or half of it from 6 up
    pub fn images_per_row(&self) -> usize {
        images_per_row(self.batch_size)
    }

    /// Latent spatial size `(h, w)`
    pub fn latent_size(&self) -> (usize, usize) {
        (self.height / 8, self.width / 8)
    }
}

pub fn images_per_row(batch_size: usize) -> usize {
    if batch_size >= 6 {
        batch_size / 2
    } else {
        batch_size
    }
}

/// Static properties of the loaded diffusion model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Training-time diffusion steps
    pub diffusion_steps: usize,
    pub noise_schedule: BetaSchedule,
    /// Feed the network timesteps on the 0..1000 scale
    pub rescale_timesteps: bool,
    /// CLIP projection width, `None` when the network takes no CLIP embedding
    pub clip_embed_dim: Option<usize>,
    pub latent_channels: usize,
    pub latent_scale: f64,
    /// Leading output channels that receive guidance
    pub eps_channels: usize,
    pub plms_order: usize,
    pub clip_denoised: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            diffusion_steps: 1000,
            noise_schedule: BetaSchedule::Linear,
            rescale_timesteps: true,
            clip_embed_dim: Some(768),
            latent_channels: 4,
            latent_scale: 0.18215,
            eps_channels: 3,
            plms_order: 2,
            clip_denoised: false,
        }
    }
}

impl ModelConfig {
    /// Load from a JSON file; missing keys take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, GlidError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
