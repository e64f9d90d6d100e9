//! Network interfaces the predictor is built around
//!
//! The pretrained networks are opaque to the pipeline; it only relies on the
//! tensor shapes documented on each trait.

use burn::prelude::*;

use crate::error::CollaboratorError;

/// Conditioning passed to every denoiser call
///
/// Rows `0..batch` are conditional, rows `batch..2*batch` unconditional.
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    /// BERT context `[2*batch, seq, dim]`
    pub context: Tensor<B, 3>,
    /// CLIP text embedding `[2*batch, dim]`, absent when the network has no CLIP projection
    pub clip_embed: Option<Tensor<B, 2>>,
    /// Spatial image conditioning `[2*batch, 4, h, w]`
    pub image_embed: Tensor<B, 4>,
}

impl<B: Backend> Conditioning<B> {
    /// Rows in the doubled batch
    pub fn batch_size(&self) -> usize {
        self.context.dims()[0]
    }
}

/// Posterior returned by the autoencoder's encoder
#[derive(Debug, Clone)]
pub struct DiagonalGaussian<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub logvar: Tensor<B, 4>,
}

impl<B: Backend> DiagonalGaussian<B> {
    pub fn new(mean: Tensor<B, 4>, logvar: Tensor<B, 4>) -> Self {
        Self {
            mean,
            logvar: logvar.clamp(-30.0, 20.0),
        }
    }

    /// Reparameterized sample: `mean + std * noise`
    pub fn sample(self, noise: Tensor<B, 4>) -> Tensor<B, 4> {
        let std = (self.logvar * 0.5).exp();
        self.mean + std * noise
    }

    pub fn mode(self) -> Tensor<B, 4> {
        self.mean
    }
}

/// The diffusion U-Net
pub trait DenoisingNetwork<B: Backend> {
    /// `x` is `[N, C, h, w]`, `timesteps` one float per row on the network's time scale
    fn forward(
        &self,
        x: Tensor<B, 4>,
        timesteps: Tensor<B, 1>,
        cond: &Conditioning<B>,
    ) -> Result<Tensor<B, 4>, CollaboratorError>;
}

/// BERT-style context encoder
pub trait TextEncoder<B: Backend> {
    /// Returns `[texts.len(), seq, dim]`
    fn encode(&self, texts: &[String]) -> Result<Tensor<B, 3>, CollaboratorError>;
}

/// CLIP text tower
pub trait ClipTextEncoder<B: Backend> {
    /// Returns `[texts.len(), dim]`; over-long prompts are truncated
    fn encode_text(&self, texts: &[String]) -> Result<Tensor<B, 2>, CollaboratorError>;
}

/// KL autoencoder between pixel space `[-1, 1]` and the 1/8 latent space
pub trait LatentAutoencoder<B: Backend> {
    /// `image` is `[1, 3, H, W]`
    fn encode(&self, image: Tensor<B, 4>) -> Result<DiagonalGaussian<B>, CollaboratorError>;

    /// `latent` is `[1, 4, H/8, W/8]` (unscaled); returns `[1, 3, H, W]`
    fn decode(&self, latent: Tensor<B, 4>) -> Result<Tensor<B, 4>, CollaboratorError>;
}
