//! Optional image initialization

use std::path::Path;

use burn::prelude::*;
use image::DynamicImage;
use image::imageops::FilterType;
use rand::rngs::StdRng;
use tracing::{info, warn};

use crate::error::GlidError;
use crate::models::LatentAutoencoder;
use crate::noise::randn;

/// Skip fraction used when an init image comes with a fraction of 0
pub const DEFAULT_INIT_SKIP_FRACTION: f64 = 0.5;

/// Starting latent and the number of sampler steps it replaces
#[derive(Debug, Clone)]
pub struct InitLatent<B: Backend> {
    /// `[2*batch, 4, h, w]`, already scaled
    pub latent: Option<Tensor<B, 4>>,
    pub skip_timesteps: usize,
}

impl<B: Backend> InitLatent<B> {
    pub fn none() -> Self {
        Self {
            latent: None,
            skip_timesteps: 0,
        }
    }
}

/// Parameters for [`prepare`]
#[derive(Debug, Clone, Copy)]
pub struct InitOptions {
    pub width: usize,
    pub height: usize,
    pub batch_size: usize,
    /// Respaced sampler steps
    pub steps: usize,
    pub skip_fraction: f64,
    pub latent_scale: f64,
}

/// The skip fraction to run with, overriding 0 when an image is given
pub fn effective_skip_fraction(has_image: bool, skip_fraction: f64) -> f64 {
    if !has_image {
        0.0
    } else if skip_fraction == 0.0 {
        warn!(
            "init_skip_fraction must be > 0.0 when using an init image, overriding to {}",
            DEFAULT_INIT_SKIP_FRACTION
        );
        DEFAULT_INIT_SKIP_FRACTION
    } else {
        skip_fraction
    }
}

/// `floor(steps * fraction)`
pub fn skip_steps(steps: usize, skip_fraction: f64) -> usize {
    (steps as f64 * skip_fraction).floor() as usize
}

/// Resize to `width x height` and map to a `[1, 3, H, W]` tensor in `[-1, 1]`
pub fn image_to_tensor<B: Backend>(
    image: &DynamicImage,
    width: usize,
    height: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let resized = image
        .resize_exact(width as u32, height as u32, FilterType::Lanczos3)
        .to_rgb8();
    let data: Vec<f32> = resized.into_raw().into_iter().map(|v| v as f32).collect();
    let hwc = Tensor::<B, 3>::from_data(TensorData::new(data, [height, width, 3]), device);
    let chw = hwc.permute([2, 0, 1]) / 255.0;
    (chw.clamp(0.0, 1.0) * 2.0 - 1.0).unsqueeze::<4>()
}

/// Encode `image` to a scaled latent replicated across the doubled batch
pub fn encode_init<B, A>(
    autoencoder: &A,
    image: &DynamicImage,
    options: &InitOptions,
    rng: &mut StdRng,
    device: &B::Device,
) -> Result<Tensor<B, 4>, GlidError>
where
    B: Backend,
    A: LatentAutoencoder<B> + ?Sized,
{
    let pixels = image_to_tensor::<B>(image, options.width, options.height, device);
    let posterior = autoencoder.encode(pixels)?;
    let noise = randn::<B>(rng, posterior.mean.dims(), device);
    let latent = posterior.sample(noise) * options.latent_scale;
    Ok(latent.repeat_dim(0, options.batch_size * 2))
}

/// Build the starting latent, or nothing when there is no init image
pub fn prepare<B, A>(
    autoencoder: &A,
    init_image: Option<&Path>,
    options: &InitOptions,
    rng: &mut StdRng,
    device: &B::Device,
) -> Result<InitLatent<B>, GlidError>
where
    B: Backend,
    A: LatentAutoencoder<B> + ?Sized,
{
    let Some(path) = init_image else {
        return Ok(InitLatent::none());
    };

    let skip_fraction = effective_skip_fraction(true, options.skip_fraction);
    info!(
        "Loading initial image {} with init_skip_fraction: {}",
        path.display(),
        skip_fraction
    );
    // Format comes from the file header, not the extension
    let image = image::ImageReader::open(path)?.with_guessed_format()?.decode()?;
    let latent = encode_init(autoencoder, &image, options, rng, device)?;

    Ok(InitLatent {
        latent: Some(latent),
        skip_timesteps: skip_steps(options.steps, skip_fraction),
    })
}
