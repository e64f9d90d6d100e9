//! Classifier-free guided model call

use burn::prelude::*;
use burn_glid_samplers::{DenoiseFn, SamplerError, apply_guidance, duplicate_halves, split_halves};

use crate::models::{Conditioning, DenoisingNetwork};

/// Wraps a [`DenoisingNetwork`] so one forward pass yields guided noise
///
/// The first half of the incoming batch is duplicated and run against the full
/// `[cond; uncond]` conditioning. The leading `eps_channels` of the output are
/// guided and copied back into both halves; trailing channels pass through.
pub struct GuidedDenoiser<'a, B: Backend, N: ?Sized> {
    network: &'a N,
    conditioning: Conditioning<B>,
    guidance_scale: f64,
    eps_channels: usize,
}

impl<'a, B: Backend, N: DenoisingNetwork<B> + ?Sized> GuidedDenoiser<'a, B, N> {
    pub fn new(
        network: &'a N,
        conditioning: Conditioning<B>,
        guidance_scale: f64,
        eps_channels: usize,
    ) -> Self {
        Self {
            network,
            conditioning,
            guidance_scale,
            eps_channels,
        }
    }

    pub fn conditioning(&self) -> &Conditioning<B> {
        &self.conditioning
    }
}

impl<B: Backend, N: DenoisingNetwork<B> + ?Sized> DenoiseFn<B> for GuidedDenoiser<'_, B, N> {
    fn denoise(&self, x_t: Tensor<B, 4>, timesteps: Tensor<B, 1>) -> Result<Tensor<B, 4>, SamplerError> {
        let (half, _) = split_halves(x_t)?;
        let combined = duplicate_halves(half);
        let [in_n, _, in_h, in_w] = combined.dims();

        let output = self
            .network
            .forward(combined, timesteps, &self.conditioning)
            .map_err(|e| SamplerError::Model(Box::new(e)))?;

        let [n, c, h, w] = output.dims();
        if [n, h, w] != [in_n, in_h, in_w] {
            return Err(SamplerError::Model(
                format!(
                    "network returned {:?} for input [{in_n}, _, {in_h}, {in_w}]",
                    output.dims()
                )
                .into(),
            ));
        }
        let k = self.eps_channels;
        if k == 0 || k > c {
            return Err(SamplerError::Model(
                format!("network returned {c} channels, cannot guide the first {k}").into(),
            ));
        }

        let eps = output.clone().slice([0..n, 0..k, 0..h, 0..w]);
        let (cond_eps, uncond_eps) = split_halves(eps)?;
        let eps = duplicate_halves(apply_guidance(uncond_eps, cond_eps, self.guidance_scale));

        if k == c {
            return Ok(eps);
        }
        let rest = output.slice([0..n, k..c, 0..h, 0..w]);
        Ok(Tensor::cat(vec![eps, rest], 1))
    }
}
