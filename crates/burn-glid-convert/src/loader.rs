//! Load tensors from .safetensors files

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use burn::prelude::*;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{Dtype, SafeTensors};

use crate::error::ConvertError;

struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

/// A memory-mapped safetensors file
pub struct SafeTensorFile {
    mmap: Mmap,
    tensors: HashMap<String, TensorInfo>,
}

impl SafeTensorFile {
    /// Open a safetensors file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ConvertError> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and owned by the returned value
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let base = mmap.as_ptr() as usize;
        let mut tensors = HashMap::new();
        {
            let st = SafeTensors::deserialize(&mmap)?;
            for (name, view) in st.tensors() {
                let start = view.data().as_ptr() as usize - base;
                tensors.insert(
                    name.to_string(),
                    TensorInfo {
                        dtype: view.dtype(),
                        shape: view.shape().to_vec(),
                        start,
                        end: start + view.data().len(),
                    },
                );
            }
        }

        tracing::debug!(tensors = tensors.len(), "opened safetensors file");
        Ok(Self { mmap, tensors })
    }

    /// List all tensor names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    /// Read a tensor to host memory as f32, converting from fp16/bf16/f64
    pub fn read_f32(&self, name: &str) -> Result<(Vec<usize>, Vec<f32>), ConvertError> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| ConvertError::TensorNotFound(name.to_string()))?;
        let data = &self.mmap[info.start..info.end];

        // mmap data may be unaligned
        let floats: Vec<f32> = match info.dtype {
            Dtype::F32 => data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F64 => data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect(),
            Dtype::F16 => data
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            Dtype::BF16 => data
                .chunks_exact(2)
                .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            dtype => return Err(ConvertError::UnsupportedDtype(format!("{dtype:?}"))),
        };

        Ok((info.shape.clone(), floats))
    }

    /// Load a tensor as f32 onto `device`
    pub fn load_f32<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, ConvertError> {
        let (shape, floats) = self.read_f32(name)?;
        let dims: [usize; D] = shape.clone().try_into().map_err(|_| ConvertError::ShapeMismatch {
            name: name.to_string(),
            expected: vec![0; D],
            actual: shape,
        })?;
        Ok(Tensor::from_data(TensorData::new(floats, dims), device))
    }
}
