//! Aesthetic steering embeddings
//!
//! One CLIP-space vector per aesthetic rating, mixed into the prompt's CLIP
//! embedding before sampling.

use std::path::Path;

use burn::prelude::*;

use crate::error::ConvertError;
use crate::loader::SafeTensorFile;
use crate::npy::{NpyArray, read_npy};

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 9;

const NUM_RATINGS: usize = (MAX_RATING - MIN_RATING + 1) as usize;

/// Embedding table indexed by rating 1..=9
#[derive(Debug, Clone)]
pub struct AestheticEmbeddings {
    dim: usize,
    vectors: Vec<Vec<f32>>,
}

fn tensor_name(rating: u8) -> String {
    format!("rating{rating}")
}

/// Accepts `[D]` or `[1, D]`
fn flatten_vector(name: &str, shape: &[usize], data: Vec<f32>) -> Result<Vec<f32>, ConvertError> {
    match shape {
        [_] | [1, _] => Ok(data),
        _ => Err(ConvertError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![1, data.len()],
            actual: shape.to_vec(),
        }),
    }
}

impl AestheticEmbeddings {
    /// Build from nine vectors ordered by rating
    pub fn from_vectors(vectors: Vec<Vec<f32>>) -> Result<Self, ConvertError> {
        if vectors.len() != NUM_RATINGS {
            return Err(ConvertError::ShapeMismatch {
                name: "aesthetic table".to_string(),
                expected: vec![NUM_RATINGS],
                actual: vec![vectors.len()],
            });
        }
        let dim = vectors[0].len();
        for (i, v) in vectors.iter().enumerate() {
            if v.len() != dim || dim == 0 {
                return Err(ConvertError::ShapeMismatch {
                    name: tensor_name(MIN_RATING + i as u8),
                    expected: vec![dim],
                    actual: vec![v.len()],
                });
            }
        }
        Ok(Self { dim, vectors })
    }

    /// Load `rating1.npy` .. `rating9.npy` from a directory
    pub fn from_npy_dir<P: AsRef<Path>>(dir: P) -> Result<Self, ConvertError> {
        let dir = dir.as_ref();
        let mut vectors = Vec::with_capacity(NUM_RATINGS);
        for rating in MIN_RATING..=MAX_RATING {
            let name = tensor_name(rating);
            let NpyArray { shape, data } = read_npy(dir.join(format!("{name}.npy")))?;
            vectors.push(flatten_vector(&name, &shape, data)?);
        }
        tracing::debug!(dir = %dir.display(), "loaded aesthetic embeddings");
        Self::from_vectors(vectors)
    }

    /// Load tensors `rating1` .. `rating9` from a safetensors file
    pub fn from_safetensors<P: AsRef<Path>>(path: P) -> Result<Self, ConvertError> {
        let file = SafeTensorFile::open(path)?;
        let mut vectors = Vec::with_capacity(NUM_RATINGS);
        for rating in MIN_RATING..=MAX_RATING {
            let name = tensor_name(rating);
            let (shape, data) = file.read_f32(&name)?;
            vectors.push(flatten_vector(&name, &shape, data)?);
        }
        Self::from_vectors(vectors)
    }

    /// Embedding dimensionality
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, rating: u8) -> Result<&[f32], ConvertError> {
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(ConvertError::InvalidRating(rating));
        }
        Ok(&self.vectors[(rating - MIN_RATING) as usize])
    }

    /// The embedding for `rating` as a `[1, D]` tensor
    pub fn to_tensor<B: Backend>(
        &self,
        rating: u8,
        device: &B::Device,
    ) -> Result<Tensor<B, 2>, ConvertError> {
        let v = self.get(rating)?;
        Ok(Tensor::from_data(TensorData::new(v.to_vec(), [1, self.dim]), device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npy::tests::encode_f32;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn table(dim: usize) -> Vec<Vec<f32>> {
        (1..=9).map(|r| vec![r as f32; dim]).collect()
    }

    #[test]
    fn test_get_by_rating() {
        let t = AestheticEmbeddings::from_vectors(table(4)).unwrap();
        assert_eq!(t.dim(), 4);
        assert_eq!(t.get(1).unwrap(), &[1.0; 4]);
        assert_eq!(t.get(9).unwrap(), &[9.0; 4]);
        assert!(matches!(t.get(0), Err(ConvertError::InvalidRating(0))));
        assert!(matches!(t.get(10), Err(ConvertError::InvalidRating(10))));
    }

    #[test]
    fn test_ragged_table_rejected() {
        let mut vectors = table(4);
        vectors[3].push(0.0);
        assert!(matches!(
            AestheticEmbeddings::from_vectors(vectors),
            Err(ConvertError::ShapeMismatch { .. })
        ));
        assert!(AestheticEmbeddings::from_vectors(table(4)[..8].to_vec()).is_err());
    }

    #[test]
    fn test_from_npy_dir() {
        let dir = tempfile::tempdir().unwrap();
        for rating in 1..=9u8 {
            let bytes = encode_f32(&[1, 3], &[rating as f32, 0.0, -(rating as f32)]);
            std::fs::write(dir.path().join(format!("rating{rating}.npy")), bytes).unwrap();
        }
        let t = AestheticEmbeddings::from_npy_dir(dir.path()).unwrap();
        assert_eq!(t.dim(), 3);
        assert_eq!(t.get(7).unwrap(), &[7.0, 0.0, -7.0]);

        let tensor = t.to_tensor::<TestBackend>(7, &Default::default()).unwrap();
        assert_eq!(tensor.dims(), [1, 3]);
    }

    #[test]
    fn test_missing_npy_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AestheticEmbeddings::from_npy_dir(dir.path()),
            Err(ConvertError::Io(_))
        ));
    }

    #[test]
    fn test_from_safetensors() {
        use safetensors::{Dtype, tensor::TensorView};

        let dir = tempfile::tempdir().unwrap();
        let buffers: Vec<(String, Vec<u8>)> = (1..=9u8)
            .map(|r| {
                let bytes = [r as f32, 1.0].iter().flat_map(|v| v.to_le_bytes()).collect();
                (format!("rating{r}"), bytes)
            })
            .collect();
        let views: Vec<(&str, TensorView)> = buffers
            .iter()
            .map(|(name, bytes)| {
                (name.as_str(), TensorView::new(Dtype::F32, vec![2], bytes).unwrap())
            })
            .collect();
        let path = dir.path().join("aesthetic.safetensors");
        safetensors::serialize_to_file(views, &None, &path).unwrap();

        let t = AestheticEmbeddings::from_safetensors(&path).unwrap();
        assert_eq!(t.get(5).unwrap(), &[5.0, 1.0]);
    }
}
