//! Element-wise image transformations.

use super::DataError;
use ndarray::ArrayD;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub trait Transform {
    fn apply(&self, data: ArrayD<f32>) -> ArrayD<f32>;
}

/// Applies transformations in order.
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then<T: Transform + 'static>(mut self, transform: T) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }
}

impl Transform for Compose {
    fn apply(&self, data: ArrayD<f32>) -> ArrayD<f32> {
        self.transforms.iter().fold(data, |acc, t| t.apply(acc))
    }
}

/// `x * scale + offset`. A negative scale inverts the contrast.
pub struct Affine {
    pub scale: f32,
    pub offset: f32,
}

impl Transform for Affine {
    fn apply(&self, mut data: ArrayD<f32>) -> ArrayD<f32> {
        data.mapv_inplace(|x| x * self.scale + self.offset);
        data
    }
}

pub struct Clamp {
    pub min: f32,
    pub max: f32,
}

impl Transform for Clamp {
    fn apply(&self, mut data: ArrayD<f32>) -> ArrayD<f32> {
        data.mapv_inplace(|x| x.max(self.min).min(self.max));
        data
    }
}

/// Additive Gaussian noise. With a seed every call adds the same noise for
/// a given shape.
pub struct RandomNoise {
    distribution: Normal<f32>,
    seed: Option<u64>,
}

impl RandomNoise {
    pub fn new(std: f32) -> Result<Self, DataError> {
        if !(std.is_finite() && std >= 0.0) {
            return Err(DataError::InvalidParameter(format!("noise std must be finite and non-negative, got {std}")));
        }
        let distribution = Normal::new(0.0, std)
            .map_err(|e| DataError::InvalidParameter(format!("noise std {std}: {e}")))?;
        Ok(Self { distribution, seed: None })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Transform for RandomNoise {
    fn apply(&self, data: ArrayD<f32>) -> ArrayD<f32> {
        let noise = match self.seed {
            Some(seed) => ArrayD::random_using(data.raw_dim(), self.distribution, &mut StdRng::seed_from_u64(seed)),
            None => ArrayD::random(data.raw_dim(), self.distribution),
        };
        data + noise
    }
}
