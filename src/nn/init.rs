//! Parameter initializers.
//!
//! Defaults follow the usual convolutional-network conventions: weights and
//! biases are drawn from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, normalization
//! scales start at one and shifts at zero.

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    Constant(f32),
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    KaimingUniform { fan_in: usize },
}

impl Init {
    /// Draws a tensor of `shape`.
    pub fn sample<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> ArrayD<f32> {
        match *self {
            Init::Zeros => ArrayD::zeros(IxDyn(shape)),
            Init::Ones => ArrayD::ones(IxDyn(shape)),
            Init::Constant(v) => ArrayD::from_elem(IxDyn(shape), v),
            Init::KaimingUniform { fan_in } => {
                let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
                ArrayD::random_using(IxDyn(shape), Uniform::new_inclusive(-bound, bound), rng)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn kaiming_uniform_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let w = Init::KaimingUniform { fan_in: 9 }.sample(&[4, 1, 3, 3], &mut rng);
        assert_eq!(w.shape(), &[4, 1, 3, 3]);
        assert!(w.iter().all(|v| v.abs() <= 1.0 / 3.0));
        assert!(w.iter().any(|&v| v != w[[0, 0, 0, 0]]));
    }

    #[test]
    fn constants_fill() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Init::Ones.sample(&[1, 2, 1, 1], &mut rng).iter().all(|&v| v == 1.0));
        assert!(Init::Constant(0.5).sample(&[3], &mut rng).iter().all(|&v| v == 0.5));
    }
}
