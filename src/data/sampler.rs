//! Стратегии сэмплирования индексов для `DataLoader`.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Генератор индексов датасета.
pub trait Sampler: Iterator<Item = usize> {
    /// Количество индексов за один проход.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Последовательный сэмплер - индексы по порядку.
pub struct SequentialSampler {
    len: usize,
    current: usize,
}

impl SequentialSampler {
    pub fn new(len: usize) -> Self {
        Self { len, current: 0 }
    }
}

impl Iterator for SequentialSampler {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current < self.len {
            let idx = self.current;
            self.current += 1;
            Some(idx)
        } else {
            None
        }
    }
}

impl Sampler for SequentialSampler {
    fn len(&self) -> usize {
        self.len
    }
}

/// Случайный сэмплер - случайная перестановка индексов.
pub struct RandomSampler {
    indices: Vec<usize>,
    current: usize,
}

impl RandomSampler {
    pub fn new(len: usize) -> Self {
        let mut indices: Vec<usize> = (0..len).collect();
        indices.shuffle(&mut rand::thread_rng());
        Self { indices, current: 0 }
    }

    /// Перестановка с фиксированным seed для воспроизводимости.
    pub fn with_seed(len: usize, seed: u64) -> Self {
        let mut indices: Vec<usize> = (0..len).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
        Self { indices, current: 0 }
    }
}

impl Iterator for RandomSampler {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.indices.get(self.current).copied()?;
        self.current += 1;
        Some(idx)
    }
}

impl Sampler for RandomSampler {
    fn len(&self) -> usize {
        self.indices.len()
    }
}

/// Батч-сэмплер - группирует индексы в батчи.
pub struct BatchSampler<S: Sampler> {
    sampler: S,
    batch_size: usize,
    drop_last: bool,
}

impl<S: Sampler> BatchSampler<S> {
    /// `drop_last` отбрасывает последний неполный батч.
    pub fn new(sampler: S, batch_size: usize, drop_last: bool) -> Self {
        Self { sampler, batch_size: batch_size.max(1), drop_last }
    }

    pub fn num_batches(&self) -> usize {
        let n = self.sampler.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            (n + self.batch_size - 1) / self.batch_size
        }
    }
}

impl<S: Sampler> Iterator for BatchSampler<S> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<usize> = self.sampler.by_ref().take(self.batch_size).collect();
        if batch.is_empty() || (batch.len() < self.batch_size && self.drop_last) {
            return None;
        }
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_sampler() {
        let sampler = SequentialSampler::new(5);
        assert_eq!(sampler.collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_random_sampler_is_permutation_and_reproducible() {
        let mut a: Vec<usize> = RandomSampler::with_seed(10, 42).collect();
        let b: Vec<usize> = RandomSampler::with_seed(10, 42).collect();
        assert_eq!(a, b);
        a.sort_unstable();
        assert_eq!(a, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_batch_sampler() {
        let batches: Vec<Vec<usize>> = BatchSampler::new(SequentialSampler::new(10), 3, false).collect();
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[3], vec![9]);

        let sampler = BatchSampler::new(SequentialSampler::new(10), 3, true);
        assert_eq!(sampler.num_batches(), 3);
        assert_eq!(sampler.count(), 3);
    }
}
