//! Embedding and Weight File Readers
//!
//! - [`read_npy`] - numpy `.npy` arrays (f16/f32/f64, little-endian)
//! - [`SafeTensorFile`] - memory-mapped safetensors files
//! - [`AestheticEmbeddings`] - the per-rating CLIP steering vectors
//!
//! ```ignore
//! use burn_glid_convert::AestheticEmbeddings;
//!
//! let table = AestheticEmbeddings::from_npy_dir("aesthetic-predictor/vit_l_14_embeddings")?;
//! let embed = table.to_tensor::<Backend>(9, &device)?; // [1, 768]
//! ```

pub mod aesthetic;
pub mod error;
pub mod loader;
pub mod npy;

pub use aesthetic::{AestheticEmbeddings, MAX_RATING, MIN_RATING};
pub use error::ConvertError;
pub use loader::SafeTensorFile;
pub use npy::{NpyArray, read_npy};
