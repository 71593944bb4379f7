//! Synthetic pair of visually shifted image domains.
//!
//! Both domains draw Gaussian blobs on a background. The source domain has
//! bright blobs on a dark background; the target domain shows the same kind
//! of scenes with damped, inverted contrast and additive noise. This is
//! enough of a domain shift for the domain classifier to pick up on, which
//! makes it useful for demos and end-to-end tests.

use super::dataset::ImageDataset;
use super::transforms::{Affine, Clamp, Compose, RandomNoise, Transform};
use super::DataError;
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BACKGROUND: f32 = 0.1;
const TARGET_SEED_OFFSET: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, PartialEq)]
pub struct DomainPair {
    /// Side length of the square images.
    pub size: usize,
    pub channels: usize,
    pub max_blobs: usize,
    /// Standard deviation of the target-domain noise.
    pub noise_std: f32,
    pub seed: u64,
}

impl DomainPair {
    pub fn new(size: usize, seed: u64) -> Self {
        Self { size, channels: 1, max_blobs: 3, noise_std: 0.05, seed }
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// `count` source images, `[count, C, size, size]`.
    pub fn source(&self, count: usize) -> Result<ImageDataset, DataError> {
        ImageDataset::new(self.blobs(count, self.seed))
    }

    /// `count` target images, drawn independently of the source images.
    pub fn target(&self, count: usize) -> Result<ImageDataset, DataError> {
        let seed = self.seed.wrapping_add(TARGET_SEED_OFFSET);
        let shift = Compose::new()
            .then(Affine { scale: -0.7, offset: 0.9 })
            .then(RandomNoise::new(self.noise_std)?.with_seed(seed))
            .then(Clamp { min: 0.0, max: 1.0 });
        ImageDataset::new(shift.apply(self.blobs(count, seed)))
    }

    pub fn generate(&self, count: usize) -> Result<(ImageDataset, ImageDataset), DataError> {
        Ok((self.source(count)?, self.target(count)?))
    }

    fn blobs(&self, count: usize, seed: u64) -> ArrayD<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let size = self.size;
        let mut images = ArrayD::from_elem(IxDyn(&[count, self.channels, size, size]), BACKGROUND);
        let min_radius = (size as f32 / 10.0).max(1.0);
        let max_radius = (size as f32 / 4.0).max(min_radius + 0.5);

        for n in 0..count {
            let blobs = rng.gen_range(1..=self.max_blobs.max(1));
            for _ in 0..blobs {
                let cy = rng.gen_range(0.0..size as f32);
                let cx = rng.gen_range(0.0..size as f32);
                let radius: f32 = rng.gen_range(min_radius..max_radius);
                let intensity: f32 = rng.gen_range(0.6..1.0);
                let denom = 2.0 * radius * radius;
                for y in 0..size {
                    for x in 0..size {
                        let d2 = (y as f32 - cy).powi(2) + (x as f32 - cx).powi(2);
                        let value = (BACKGROUND + intensity * (-d2 / denom).exp()).min(1.0);
                        for c in 0..self.channels {
                            let pixel = &mut images[[n, c, y, x]];
                            *pixel = pixel.max(value);
                        }
                    }
                }
            }
        }
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_have_expected_shape_and_range() {
        let (source, target) = DomainPair::new(16, 1).generate(5).unwrap();
        assert_eq!(source.images().shape(), &[5, 1, 16, 16]);
        assert_eq!(target.images().shape(), &[5, 1, 16, 16]);
        for v in source.images().iter().chain(target.images().iter()) {
            assert!((0.0..=1.0).contains(v));
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let a = DomainPair::new(8, 3).source(2).unwrap();
        let b = DomainPair::new(8, 3).source(2).unwrap();
        assert_eq!(a.images(), b.images());
        let c = DomainPair::new(8, 4).source(2).unwrap();
        assert_ne!(a.images(), c.images());
    }

    #[test]
    fn target_domain_is_shifted() {
        let (source, target) = DomainPair::new(16, 0).generate(8).unwrap();
        let source_mean = source.images().mean().unwrap();
        let target_mean = target.images().mean().unwrap();
        assert!(source_mean < 0.5, "{source_mean}");
        assert!(target_mean > 0.5, "{target_mean}");
    }
}
