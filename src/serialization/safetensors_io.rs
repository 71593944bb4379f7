//! Reading and writing the SafeTensors format.
//!
//! SafeTensors stores named tensors behind a JSON header. It cannot execute
//! code on load and maps directly onto `f32` buffers, which makes it the
//! format for model weights, optimizer moments and image datasets here.

use crate::asg::Value;
use ndarray::ArrayD;
use safetensors::serialize_to_file;
use safetensors::tensor::{SafeTensors, TensorView};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Tensor '{name}' has {actual} elements, shape {shape:?} needs {expected}")]
    ShapeMismatch { name: String, shape: Vec<usize>, expected: usize, actual: usize },

    #[error("Tensor '{0}' not found")]
    TensorNotFound(String),
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// Saves every `Value` of `tensors` as a little-endian F32 tensor.
///
/// Scalars are stored as 0-d tensors. Names are written in sorted order so
/// the same map always produces the same file.
///
/// ```rust,ignore
/// let mut weights = HashMap::new();
/// weights.insert("decoder.output.weight".to_string(), Value::Tensor(ArrayD::zeros(IxDyn(&[1, 64, 1, 1]))));
/// save_safetensors("model.safetensors", &weights)?;
/// ```
pub fn save_safetensors<P: AsRef<Path>>(path: P, tensors: &HashMap<String, Value>) -> Result<()> {
    let data_storage: BTreeMap<&str, (Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, value)| {
            let (shape, bytes) = match value {
                Value::Tensor(arr) => (arr.shape().to_vec(), arr.iter().flat_map(|x| x.to_le_bytes()).collect()),
                Value::ScalarF32(x) => (Vec::new(), x.to_le_bytes().to_vec()),
            };
            (name.as_str(), (shape, bytes))
        })
        .collect();

    let mut tensor_views: Vec<(&str, TensorView<'_>)> = Vec::with_capacity(data_storage.len());
    for (name, (shape, data)) in &data_storage {
        tensor_views.push((*name, TensorView::new(safetensors::Dtype::F32, shape.clone(), data)?));
    }

    serialize_to_file(tensor_views, &None, path.as_ref())?;
    Ok(())
}

/// Loads every tensor of a SafeTensors file. F64 tensors are narrowed to F32.
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Value>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut result = HashMap::new();
    for (name, tensor) in tensors.tensors() {
        let shape: Vec<usize> = tensor.shape().to_vec();
        let floats: Vec<f32> = match tensor.dtype() {
            safetensors::Dtype::F32 => tensor
                .data()
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            safetensors::Dtype::F64 => tensor
                .data()
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect(),
            other => return Err(SafeTensorsError::UnsupportedDtype(format!("{other:?}"))),
        };

        let actual = floats.len();
        let arr = ArrayD::from_shape_vec(ndarray::IxDyn(&shape), floats).map_err(|_| {
            SafeTensorsError::ShapeMismatch {
                name: name.clone(),
                expected: shape.iter().product(),
                shape: shape.clone(),
                actual,
            }
        })?;
        result.insert(name, Value::Tensor(arr));
    }
    Ok(result)
}

/// Loads one tensor by name.
pub fn load_tensor<P: AsRef<Path>>(path: P, name: &str) -> Result<Value> {
    let mut tensors = load_safetensors(path)?;
    tensors.remove(name).ok_or_else(|| SafeTensorsError::TensorNotFound(name.to_string()))
}

/// Names of the tensors stored in a file.
pub fn list_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    let mut names: Vec<String> = tensors.names().iter().map(|s| s.to_string()).collect();
    names.sort();
    Ok(names)
}
