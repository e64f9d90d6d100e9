//! Reader for numpy `.npy` files
//!
//! Only what embedding tables need: C-ordered, little-endian float arrays,
//! returned as f32 on the host.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use half::f16;

use crate::error::ConvertError;

const NPY_MAGIC_STRING: &[u8] = b"\x93NUMPY";
const MAX_HEADER_LEN: usize = 64 * 1024;

/// A dense array read from a `.npy` file
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NpyArray {
    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Descr {
    F16,
    F32,
    F64,
}

#[derive(Debug, PartialEq)]
struct Header {
    descr: Descr,
    fortran_order: bool,
    shape: Vec<usize>,
}

fn read_header<R: Read>(reader: &mut R) -> Result<String, ConvertError> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if magic != NPY_MAGIC_STRING {
        return Err(ConvertError::Npy("magic string mismatch".to_string()));
    }
    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    let header_len = match version[0] {
        1 => reader.read_u16::<LittleEndian>()? as usize,
        2 | 3 => reader.read_u32::<LittleEndian>()? as usize,
        other => return Err(ConvertError::Npy(format!("unsupported version {other}"))),
    };
    if header_len > MAX_HEADER_LEN {
        return Err(ConvertError::Npy(format!(
            "header length {header_len} exceeds {MAX_HEADER_LEN} bytes"
        )));
    }
    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header)?;
    Ok(String::from_utf8_lossy(&header).into_owned())
}

impl Header {
    // Header is a python dict literal, e.g.
    // {'descr': '<f4', 'fortran_order': False, 'shape': (1, 768), }
    fn parse(header: &str) -> Result<Self, ConvertError> {
        let header =
            header.trim_matches(|c: char| c == '{' || c == '}' || c == ',' || c.is_whitespace());

        let mut parts = Vec::new();
        let mut start = 0usize;
        let mut depth = 0i32;
        for (index, c) in header.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                ',' if depth == 0 => {
                    parts.push(&header[start..index]);
                    start = index + 1;
                }
                _ => {}
            }
        }
        parts.push(&header[start..]);

        let mut fields: HashMap<&str, &str> = HashMap::new();
        for part in parts.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once(':')
                .ok_or_else(|| ConvertError::Npy(format!("unable to parse header {header}")))?;
            let key = key.trim_matches(|c: char| c == '\'' || c.is_whitespace());
            let value = value.trim_matches(|c: char| c == '\'' || c.is_whitespace());
            fields.insert(key, value);
        }

        let fortran_order = match fields.get("fortran_order").copied() {
            None | Some("False") => false,
            Some("True") => true,
            Some(other) => {
                return Err(ConvertError::Npy(format!("unknown fortran_order {other}")));
            }
        };

        let descr = match fields.get("descr").copied() {
            None => return Err(ConvertError::Npy("no descr in header".to_string())),
            Some(descr) if descr.starts_with('>') => {
                return Err(ConvertError::UnsupportedDtype(format!("big-endian {descr}")));
            }
            Some(descr) => match descr.trim_matches(|c: char| c == '=' || c == '<' || c == '|') {
                "e" | "f2" => Descr::F16,
                "f" | "f4" => Descr::F32,
                "d" | "f8" => Descr::F64,
                other => return Err(ConvertError::UnsupportedDtype(other.to_string())),
            },
        };

        let shape = match fields.get("shape").copied() {
            None => return Err(ConvertError::Npy("no shape in header".to_string())),
            Some(shape) => {
                let shape = shape.trim_matches(|c: char| c == '(' || c == ')' || c == ',');
                if shape.is_empty() {
                    vec![]
                } else {
                    shape
                        .split(',')
                        .map(|v| v.trim().parse::<usize>())
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| ConvertError::Npy(format!("bad shape {shape}: {e}")))?
                }
            }
        };

        Ok(Header {
            descr,
            fortran_order,
            shape,
        })
    }
}

/// Read an npy array from any reader
pub fn parse_npy<R: Read>(reader: &mut R) -> Result<NpyArray, ConvertError> {
    let header = Header::parse(&read_header(reader)?)?;
    if header.fortran_order && header.shape.len() > 1 {
        return Err(ConvertError::Npy("fortran order not supported".to_string()));
    }

    let count = header
        .shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| ConvertError::Npy(format!("shape {:?} overflows", header.shape)))?;
    let data = match header.descr {
        Descr::F16 => {
            let mut bits = vec![0u16; count];
            reader.read_u16_into::<LittleEndian>(&mut bits)?;
            bits.into_iter().map(|b| f16::from_bits(b).to_f32()).collect()
        }
        Descr::F32 => {
            let mut data = vec![0f32; count];
            reader.read_f32_into::<LittleEndian>(&mut data)?;
            data
        }
        Descr::F64 => {
            let mut data = vec![0f64; count];
            reader.read_f64_into::<LittleEndian>(&mut data)?;
            data.into_iter().map(|v| v as f32).collect()
        }
    };

    Ok(NpyArray {
        shape: header.shape,
        data,
    })
}

/// Read a `.npy` file
pub fn read_npy<P: AsRef<Path>>(path: P) -> Result<NpyArray, ConvertError> {
    let mut reader = BufReader::new(File::open(path)?);
    parse_npy(&mut reader)
}
