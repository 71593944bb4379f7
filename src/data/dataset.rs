//! Датасеты изображений в памяти.

use super::DataError;
use crate::asg::Value;
use crate::serialization::{load_safetensors, save_safetensors};
use ndarray::{ArrayD, Axis};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Индексируемый источник образцов.
pub trait Dataset {
    type Item;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Option<Self::Item>;
}

/// Стек изображений `[N, C, H, W]` в памяти.
///
/// Клонирование дешевое: данные разделяются.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    images: Arc<ArrayD<f32>>,
}

impl ImageDataset {
    pub fn new(images: ArrayD<f32>) -> Result<Self, DataError> {
        if images.ndim() != 4 {
            return Err(DataError::InvalidShape(images.shape().to_vec()));
        }
        Ok(Self { images: Arc::new(images) })
    }

    /// Загружает тензор `key` из файла SafeTensors.
    pub fn from_safetensors<P: AsRef<Path>>(path: P, key: &str) -> Result<Self, DataError> {
        let mut tensors = load_safetensors(path)?;
        let value = tensors.remove(key).ok_or_else(|| DataError::MissingKey(key.to_string()))?;
        Self::new(value.into_array())
    }

    pub fn to_safetensors<P: AsRef<Path>>(&self, path: P, key: &str) -> Result<(), DataError> {
        let tensors = HashMap::from([(key.to_string(), Value::Tensor(self.images.as_ref().clone()))]);
        save_safetensors(path, &tensors)?;
        Ok(())
    }

    /// Форма одного образца, `[C, H, W]`.
    pub fn image_shape(&self) -> Vec<usize> {
        self.images.shape()[1..].to_vec()
    }

    pub fn images(&self) -> &ArrayD<f32> {
        &self.images
    }

    /// Собирает образцы по `indices` в один батч.
    pub fn get_batch(&self, indices: &[usize]) -> ArrayD<f32> {
        self.images.select(Axis(0), indices)
    }
}

impl Dataset for ImageDataset {
    type Item = ArrayD<f32>;

    fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    fn get(&self, index: usize) -> Option<Self::Item> {
        (index < self.len()).then(|| self.images.index_axis(Axis(0), index).to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn rejects_non_image_arrays() {
        assert!(matches!(ImageDataset::new(ArrayD::zeros(IxDyn(&[4, 8]))), Err(DataError::InvalidShape(_))));
    }

    #[test]
    fn batches_follow_indices() {
        let images = ArrayD::from_shape_fn(IxDyn(&[3, 1, 2, 2]), |idx| idx[0] as f32);
        let dataset = ImageDataset::new(images).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.image_shape(), vec![1, 2, 2]);
        let batch = dataset.get_batch(&[2, 0]);
        assert_eq!(batch.shape(), &[2, 1, 2, 2]);
        assert_eq!(batch[[0, 0, 1, 1]], 2.0);
        assert_eq!(batch[[1, 0, 0, 0]], 0.0);
        assert!(dataset.get(3).is_none());
    }

    #[test]
    fn safetensors_round_trip() {
        let path = std::env::temp_dir().join(format!("unet_dann_dataset_{}.safetensors", std::process::id()));
        let images = ArrayD::from_shape_fn(IxDyn(&[2, 1, 3, 3]), |idx| (idx[2] * 3 + idx[3]) as f32);
        ImageDataset::new(images.clone()).unwrap().to_safetensors(&path, "source").unwrap();

        let loaded = ImageDataset::from_safetensors(&path, "source").unwrap();
        assert_eq!(loaded.images(), &images);
        assert!(matches!(ImageDataset::from_safetensors(&path, "target"), Err(DataError::MissingKey(_))));
        std::fs::remove_file(&path).ok();
    }
}
