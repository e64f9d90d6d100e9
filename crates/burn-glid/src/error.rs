use std::error::Error as StdError;

use burn_glid_convert::ConvertError;
use burn_glid_samplers::SamplerError;
use thiserror::Error;

/// Failure inside one of the injected networks
#[derive(Error, Debug)]
#[error("{collaborator} failed: {source}")]
pub struct CollaboratorError {
    pub collaborator: &'static str,
    #[source]
    pub source: Box<dyn StdError + Send + Sync>,
}

impl CollaboratorError {
    pub fn new(
        collaborator: &'static str,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            collaborator,
            source: source.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum GlidError {
    #[error("invalid input `{field}`: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("CLIP embedding has {prompt} dims but aesthetic embedding has {aesthetic}")]
    EmbeddingDimMismatch { prompt: usize, aesthetic: usize },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("Conversion error: {0}")]
    Convert(#[from] ConvertError),

    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GlidError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}
