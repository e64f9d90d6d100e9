use thiserror::Error;

/// Errors raised while building a schedule or running the sample loop
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("invalid timestep respacing {spec:?}: {reason}")]
    InvalidRespacing { spec: String, reason: String },

    #[error("PLMS order must be in 1..=4, got {0}")]
    InvalidOrder(usize),

    #[error("guided batch must be even, got {0}")]
    OddBatch(usize),

    #[error("model returned {actual} channels, expected {expected} or {}", expected * 2)]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("denoising model failed: {0}")]
    Model(#[source] Box<dyn std::error::Error + Send + Sync>),
}
