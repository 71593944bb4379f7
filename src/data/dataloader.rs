//! DataLoader - итерация по [`ImageDataset`] батчами.

use super::dataset::{Dataset, ImageDataset};
use super::sampler::{BatchSampler, RandomSampler, SequentialSampler};
use ndarray::ArrayD;
use std::cell::Cell;

/// Батч изображений и индексы образцов, из которых он собран.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: ArrayD<f32>,
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// DataLoader - итератор по датасету батчами.
///
/// С seed перемешивание воспроизводимо: проход `k` использует
/// перестановку из `seed + k`.
///
/// # Пример
///
/// ```rust,ignore
/// let loader = DataLoader::new(dataset, 32).shuffle(true).seed(0);
/// for batch in loader.iter() {
///     println!("Batch size: {}", batch.len());
/// }
/// ```
pub struct DataLoader {
    dataset: ImageDataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: Option<u64>,
    passes: Cell<u64>,
}

impl DataLoader {
    pub fn new(dataset: ImageDataset, batch_size: usize) -> Self {
        Self { dataset, batch_size: batch_size.max(1), shuffle: false, drop_last: false, seed: None, passes: Cell::new(0) }
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Отбрасывать последний неполный батч.
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            (n + self.batch_size - 1) / self.batch_size
        }
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &ImageDataset {
        &self.dataset
    }

    pub fn iter(&self) -> DataLoaderIterator<'_> {
        let pass = self.passes.get();
        self.passes.set(pass + 1);
        let n = self.dataset.len();
        let batch_sampler = if self.shuffle {
            let sampler = match self.seed {
                Some(seed) => RandomSampler::with_seed(n, seed.wrapping_add(pass)),
                None => RandomSampler::new(n),
            };
            BatchSamplerKind::Random(BatchSampler::new(sampler, self.batch_size, self.drop_last))
        } else {
            BatchSamplerKind::Sequential(BatchSampler::new(SequentialSampler::new(n), self.batch_size, self.drop_last))
        };
        DataLoaderIterator { dataset: &self.dataset, batch_sampler }
    }
}

enum BatchSamplerKind {
    Sequential(BatchSampler<SequentialSampler>),
    Random(BatchSampler<RandomSampler>),
}

impl Iterator for BatchSamplerKind {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            BatchSamplerKind::Sequential(s) => s.next(),
            BatchSamplerKind::Random(s) => s.next(),
        }
    }
}

pub struct DataLoaderIterator<'a> {
    dataset: &'a ImageDataset,
    batch_sampler: BatchSamplerKind,
}

impl<'a> Iterator for DataLoaderIterator<'a> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.batch_sampler.next()?;
        let images = self.dataset.get_batch(&indices);
        Some(Batch { images, indices })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn dataset(n: usize) -> ImageDataset {
        ImageDataset::new(ArrayD::from_shape_fn(IxDyn(&[n, 1, 2, 2]), |idx| idx[0] as f32)).unwrap()
    }

    #[test]
    fn test_dataloader_basic() {
        let loader = DataLoader::new(dataset(10), 3);
        assert_eq!(loader.num_batches(), 4);
        let batches: Vec<Batch> = loader.iter().collect();
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0].images.shape(), &[3, 1, 2, 2]);
        assert_eq!(batches[3].len(), 1);
    }

    #[test]
    fn test_dataloader_drop_last() {
        let loader = DataLoader::new(dataset(10), 3).drop_last(true);
        assert_eq!(loader.num_batches(), 3);
        assert!(loader.iter().all(|b| b.len() == 3));
    }

    #[test]
    fn seeded_shuffle_is_reproducible_and_varies_per_pass() {
        let a = DataLoader::new(dataset(16), 16).shuffle(true).seed(3);
        let b = DataLoader::new(dataset(16), 16).shuffle(true).seed(3);
        let first_a: Vec<usize> = a.iter().flat_map(|b| b.indices).collect();
        let first_b: Vec<usize> = b.iter().flat_map(|b| b.indices).collect();
        assert_eq!(first_a, first_b);

        let second_a: Vec<usize> = a.iter().flat_map(|b| b.indices).collect();
        assert_ne!(first_a, second_a);
        let mut sorted = second_a;
        sorted.sort_unstable();
        assert_eq!(sorted, (0..16).collect::<Vec<_>>());
    }
}
