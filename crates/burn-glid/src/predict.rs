//! The predict entry point
//!
//! [`Predictor::predict`] validates the input, builds conditioning, and returns
//! a [`PredictionStream`] that runs one sampler step per `next` call and writes
//! the current grid image after each step.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn_glid_convert::AestheticEmbeddings;
use burn_glid_samplers::{NoiseSchedule, PlmsConfig, PlmsSampleLoop, SampleState, SpacedSchedule};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::conditioning::{AestheticSteer, ConditioningRequest, assemble};
use crate::config::{ModelConfig, PredictInput};
use crate::error::GlidError;
use crate::grid::{GRID_PADDING, make_grid, save_grid};
use crate::guided::GuidedDenoiser;
use crate::init_image::{self, InitOptions};
use crate::models::{ClipTextEncoder, DenoisingNetwork, LatentAutoencoder, TextEncoder};
use crate::noise::{randn, seeded_rng};

pub const DEFAULT_OUTPUT_PATH: &str = "current.png";

/// Loaded networks and fixed model state shared by every predict call
pub struct InferenceContext<B: Backend> {
    network: Box<dyn DenoisingNetwork<B>>,
    text_encoder: Box<dyn TextEncoder<B>>,
    clip_encoder: Box<dyn ClipTextEncoder<B>>,
    autoencoder: Box<dyn LatentAutoencoder<B>>,
    aesthetic: AestheticEmbeddings,
    config: ModelConfig,
    base_schedule: NoiseSchedule,
    device: B::Device,
}

impl<B: Backend> InferenceContext<B> {
    pub fn new(
        network: impl DenoisingNetwork<B> + 'static,
        text_encoder: impl TextEncoder<B> + 'static,
        clip_encoder: impl ClipTextEncoder<B> + 'static,
        autoencoder: impl LatentAutoencoder<B> + 'static,
        aesthetic: AestheticEmbeddings,
        config: ModelConfig,
        device: B::Device,
    ) -> Self {
        let base_schedule = NoiseSchedule::named(config.noise_schedule, config.diffusion_steps);
        Self {
            network: Box::new(network),
            text_encoder: Box::new(text_encoder),
            clip_encoder: Box::new(clip_encoder),
            autoencoder: Box::new(autoencoder),
            aesthetic,
            config,
            base_schedule,
            device,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

/// One emitted frame: the grid at `path` now shows step `step`
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionFrame {
    /// Zero-based iteration
    pub step: usize,
    pub total_steps: usize,
    pub path: PathBuf,
}

/// Runs predict calls against an [`InferenceContext`]
pub struct Predictor<B: Backend> {
    context: InferenceContext<B>,
    output_path: PathBuf,
    show_progress: bool,
}

impl<B: Backend> Predictor<B> {
    pub fn new(context: InferenceContext<B>) -> Self {
        Self {
            context,
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            show_progress: false,
        }
    }

    /// Where each frame's grid is written
    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = path.into();
        self
    }

    /// Draw a terminal progress bar while streaming
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn context(&self) -> &InferenceContext<B> {
        &self.context
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Start a prediction
    ///
    /// Everything up to the first sampler step happens here; sampling itself is
    /// driven by iterating the returned stream.
    pub fn predict(&self, input: &PredictInput) -> Result<PredictionStream<'_, B>, GlidError> {
        input.validate()?;
        let ctx = &self.context;
        let config = &ctx.config;
        let device = &ctx.device;

        let seed = input.resolve_seed();
        let mut rng = seeded_rng(seed);
        debug!(seed, "seeded predict call");

        let schedule = SpacedSchedule::from_spec(
            &ctx.base_schedule,
            &input.steps.to_string(),
            config.rescale_timesteps,
        )?;

        let aesthetic = if input.aesthetic_rating == 0 {
            info!("Aesthetic rating 0, using the prompt CLIP embedding unmodified");
            None
        } else {
            info!(
                "Using aesthetic embedding {} with weight {}",
                input.aesthetic_rating, input.aesthetic_weight
            );
            Some(AestheticSteer {
                embedding: ctx.aesthetic.to_tensor::<B>(input.aesthetic_rating, device)?,
                weight: input.aesthetic_weight,
            })
        };

        let request = ConditioningRequest {
            prompt: &input.prompt,
            negative: &input.negative,
            batch_size: input.batch_size,
            latent_size: input.latent_size(),
            latent_channels: config.latent_channels,
            use_clip_embed: config.clip_embed_dim.is_some(),
        };
        let conditioning = assemble(
            ctx.text_encoder.as_ref(),
            ctx.clip_encoder.as_ref(),
            &request,
            aesthetic,
            device,
        )?;

        let init = init_image::prepare(
            ctx.autoencoder.as_ref(),
            input.init_image.as_deref(),
            &InitOptions {
                width: input.width,
                height: input.height,
                batch_size: input.batch_size,
                steps: schedule.num_timesteps(),
                skip_fraction: input.init_skip_fraction,
                latent_scale: config.latent_scale,
            },
            &mut rng,
            device,
        )?;

        let (h, w) = input.latent_size();
        let noise = randn::<B>(
            &mut rng,
            [input.batch_size * 2, config.latent_channels, h, w],
            device,
        );

        let model = GuidedDenoiser::new(
            ctx.network.as_ref(),
            conditioning,
            input.guidance_scale,
            config.eps_channels,
        );
        let sampler = PlmsSampleLoop::new(
            model,
            schedule,
            PlmsConfig {
                order: config.plms_order,
                clip_denoised: config.clip_denoised,
            },
            noise,
            init.latent,
            init.skip_timesteps,
        )?;

        let total_steps = sampler.total_steps();
        let progress = if self.show_progress {
            progress_bar(total_steps)
        } else {
            ProgressBar::hidden()
        };

        info!("Running diffusion...");
        Ok(PredictionStream {
            sampler,
            autoencoder: ctx.autoencoder.as_ref(),
            batch_size: input.batch_size,
            images_per_row: input.images_per_row(),
            latent_scale: config.latent_scale,
            output_path: self.output_path.clone(),
            total_steps,
            seed,
            progress,
            finished: false,
        })
    }
}

fn progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// Decode the first `batch_size` predicted latents into a `[3, H, W]` grid
///
/// Each latent is unscaled by `latent_scale` and decoded on its own; decoded
/// pixels are mapped from `[-1, 1]` to `[0, 1]`.
pub fn render_preview<B, A>(
    autoencoder: &A,
    pred_xstart: Tensor<B, 4>,
    batch_size: usize,
    images_per_row: usize,
    latent_scale: f64,
) -> Result<Tensor<B, 3>, GlidError>
where
    B: Backend,
    A: LatentAutoencoder<B> + ?Sized,
{
    let [_, c, h, w] = pred_xstart.dims();
    let mut decoded = Vec::with_capacity(batch_size);
    for i in 0..batch_size {
        let latent = pred_xstart.clone().slice([i..i + 1, 0..c, 0..h, 0..w]) / latent_scale;
        let image = autoencoder.decode(latent)?;
        if let Some(expected) = decoded.first().map(|t: &Tensor<B, 4>| t.dims()) {
            if image.dims() != expected {
                return Err(GlidError::invalid(
                    "decoded image",
                    format!("shape {:?} differs from {:?}", image.dims(), expected),
                ));
            }
        }
        decoded.push(((image + 1.0) / 2.0).clamp(0.0, 1.0));
    }
    let batch = Tensor::cat(decoded, 0);
    Ok(make_grid(batch, images_per_row, GRID_PADDING, 0.0))
}

type GuidedLoop<'a, B> = PlmsSampleLoop<B, GuidedDenoiser<'a, B, dyn DenoisingNetwork<B>>>;

/// Lazily sampled frames of one predict call
///
/// Each item runs one sampler step, decodes the conditional half of the
/// predicted clean latents, and overwrites the grid PNG. After an error the
/// stream ends. Dropping it early leaves the last written grid in place.
pub struct PredictionStream<'a, B: Backend> {
    sampler: GuidedLoop<'a, B>,
    autoencoder: &'a dyn LatentAutoencoder<B>,
    batch_size: usize,
    images_per_row: usize,
    latent_scale: f64,
    output_path: PathBuf,
    total_steps: usize,
    seed: u64,
    progress: ProgressBar,
    finished: bool,
}

impl<B: Backend> PredictionStream<'_, B> {
    /// The seed this call runs with
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    fn render(&self, state: &SampleState<B>) -> Result<Tensor<B, 3>, GlidError> {
        render_preview(
            self.autoencoder,
            state.pred_xstart.clone(),
            self.batch_size,
            self.images_per_row,
            self.latent_scale,
        )
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.progress.finish_and_clear();
        }
    }
}

impl<B: Backend> Iterator for PredictionStream<'_, B> {
    type Item = Result<PredictionFrame, GlidError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let state = match self.sampler.next() {
            Some(Ok(state)) => state,
            Some(Err(e)) => {
                self.finish();
                return Some(Err(e.into()));
            }
            None => {
                self.finish();
                info!("Finished generating with seed {}", self.seed);
                return None;
            }
        };

        let frame = self.render(&state).and_then(|grid| {
            save_grid(grid, &self.output_path)?;
            Ok(PredictionFrame {
                step: state.iteration,
                total_steps: self.total_steps,
                path: self.output_path.clone(),
            })
        });
        match frame {
            Ok(frame) => {
                self.progress.inc(1);
                Some(Ok(frame))
            }
            Err(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            (0, Some(0))
        } else {
            self.sampler.size_hint()
        }
    }
}
