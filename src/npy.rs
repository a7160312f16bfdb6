//! Minimal reader/writer for NumPy `.npy` files holding 2-D little-endian
//! float32 arrays in C order.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const ALIGNMENT: usize = 64;
const DESCR: &str = "<f4";

#[derive(Debug, thiserror::Error)]
pub enum NpyError {
    #[error("I/O error on {0}: {1}")]
    IoError(PathBuf, std::io::Error),
    #[error("{0} is not an npy file")]
    BadMagic(PathBuf),
    #[error("Unsupported npy version {0}.{1}")]
    UnsupportedVersion(u8, u8),
    #[error("Malformed npy header: {0}")]
    BadHeader(String),
    #[error("Unsupported npy array: {0}")]
    Unsupported(String),
    #[error("Expected {expected} data bytes, found {found}")]
    TruncatedData { expected: usize, found: usize },
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
}

fn header_text(shape: (usize, usize)) -> Vec<u8> {
    let dict = format!(
        "{{'descr': '{DESCR}', 'fortran_order': False, 'shape': ({}, {}), }}",
        shape.0, shape.1
    );
    // magic + version + u16 length prefix
    let preamble = MAGIC.len() + 2 + 2;
    let unpadded = preamble + dict.len() + 1;
    let padding = (ALIGNMENT - unpadded % ALIGNMENT) % ALIGNMENT;
    let mut header = dict.into_bytes();
    header.extend(std::iter::repeat_n(b' ', padding));
    header.push(b'\n');
    header
}

pub fn write_f32_array(path: &Path, array: &Array2<f32>) -> Result<(), NpyError> {
    let io_error = |e| NpyError::IoError(path.to_path_buf(), e);
    let header = header_text(array.dim());
    let header_len = u16::try_from(header.len())
        .map_err(|_| NpyError::BadHeader(format!("header of {} bytes is too long", header.len())))?;

    let mut out = BufWriter::new(File::create(path).map_err(io_error)?);
    out.write_all(MAGIC).map_err(io_error)?;
    out.write_all(&[1, 0]).map_err(io_error)?;
    out.write_all(&header_len.to_le_bytes()).map_err(io_error)?;
    out.write_all(&header).map_err(io_error)?;
    // Iteration is in logical (row-major) order regardless of memory layout
    for value in array.iter() {
        out.write_all(&value.to_le_bytes()).map_err(io_error)?;
    }
    out.flush().map_err(io_error)?;
    Ok(())
}

/// Pulls the raw text of `'key': value` out of a header dict.
fn header_field<'a>(header: &'a str, key: &str) -> Result<&'a str, NpyError> {
    let needle = format!("'{key}':");
    let start = header.find(&needle)
        .ok_or_else(|| NpyError::BadHeader(format!("missing {key}")))? + needle.len();
    let rest = header[start..].trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')').map(|i| i + 1)
    } else {
        rest.find([',', '}'])
    }.ok_or_else(|| NpyError::BadHeader(format!("unterminated {key}")))?;
    Ok(rest[..end].trim())
}

fn parse_shape(text: &str) -> Result<Vec<usize>, NpyError> {
    text.trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|e| NpyError::BadHeader(format!("shape {text}: {e}"))))
        .collect()
}

pub fn read_f32_array(path: &Path) -> Result<Array2<f32>, NpyError> {
    let io_error = |e| NpyError::IoError(path.to_path_buf(), e);
    let mut input = BufReader::new(File::open(path).map_err(io_error)?);

    let mut preamble = [0u8; 8];
    input.read_exact(&mut preamble).map_err(io_error)?;
    if &preamble[..6] != MAGIC {
        return Err(NpyError::BadMagic(path.to_path_buf()));
    }
    let header_len = match (preamble[6], preamble[7]) {
        (1, 0) => {
            let mut len = [0u8; 2];
            input.read_exact(&mut len).map_err(io_error)?;
            u16::from_le_bytes(len) as usize
        }
        (2, 0) | (3, 0) => {
            let mut len = [0u8; 4];
            input.read_exact(&mut len).map_err(io_error)?;
            u32::from_le_bytes(len) as usize
        }
        (major, minor) => return Err(NpyError::UnsupportedVersion(major, minor)),
    };
    let mut header = vec![0u8; header_len];
    input.read_exact(&mut header).map_err(io_error)?;
    let header = String::from_utf8(header).map_err(|e| NpyError::BadHeader(e.to_string()))?;

    let descr = header_field(&header, "descr")?.trim_matches(|c| c == '\'' || c == '"');
    if descr != DESCR {
        return Err(NpyError::Unsupported(format!("dtype {descr}")));
    }
    if header_field(&header, "fortran_order")? != "False" {
        return Err(NpyError::Unsupported("fortran order".to_string()));
    }
    let shape = parse_shape(header_field(&header, "shape")?)?;
    let [rows, cols] = shape[..] else {
        return Err(NpyError::Unsupported(format!("rank {} array", shape.len())));
    };

    let mut data = vec![];
    input.read_to_end(&mut data).map_err(io_error)?;
    let expected = rows * cols * 4;
    if data.len() != expected {
        return Err(NpyError::TruncatedData { expected, found: data.len() });
    }
    let values = data.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
    Ok(Array2::from_shape_vec((rows, cols), values)?)
}
