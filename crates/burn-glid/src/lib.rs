//! burn-glid: guided latent diffusion prediction on Burn
//!
//! Text-to-image sampling conditioned on BERT context and CLIP text
//! embeddings, with aesthetic steering, classifier-free guidance, an optional
//! init image, and a progressive PLMS sampler that writes a grid image after
//! every step.
//!
//! The pretrained networks are supplied by the caller through the traits in
//! [`models`]; this crate owns the orchestration around them.
//!
//! # Backend Selection
//!
//! - `ndarray`: CPU backend (default)
//! - `tch`: PyTorch backend via libtorch
//! - `wgpu`: WebGPU backend
//! - `cuda`: Native CUDA backend
//!
//! # Example
//!
//! ```ignore
//! use burn_glid::{InferenceContext, ModelConfig, PredictInput, Predictor};
//! use burn_glid::convert::AestheticEmbeddings;
//!
//! let device = burn_glid::backends::default_device();
//! let aesthetic = AestheticEmbeddings::from_npy_dir("aesthetic-predictor/vit_l_14_embeddings")?;
//! let context = InferenceContext::new(unet, bert, clip, vae, aesthetic, ModelConfig::default(), device);
//! let predictor = Predictor::new(context).with_progress(true);
//!
//! let input = PredictInput { prompt: "a red apple".into(), seed: 42, ..Default::default() };
//! for frame in predictor.predict(&input)? {
//!     println!("step {} -> {}", frame?.step, predictor.output_path().display());
//! }
//! ```

pub mod backends;
pub mod conditioning;
pub mod config;
pub mod error;
pub mod fusion;
pub mod grid;
pub mod guided;
pub mod init_image;
pub mod models;
pub mod noise;
pub mod predict;

pub use burn_glid_convert as convert;
pub use burn_glid_samplers as samplers;

pub use config::{ModelConfig, PredictInput, images_per_row};
pub use error::{CollaboratorError, GlidError};
pub use fusion::fuse;
pub use guided::GuidedDenoiser;
pub use models::{ClipTextEncoder, Conditioning, DenoisingNetwork, DiagonalGaussian, LatentAutoencoder, TextEncoder};
pub use predict::{InferenceContext, PredictionFrame, PredictionStream, Predictor};
