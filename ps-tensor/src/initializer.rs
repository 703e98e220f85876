//! Row initializers for sparse tables, supplemented from
//! `original_source/kraken/ps/initializer/*` — the spec's `init_spec` field
//! names "kind + params" but the distillation doesn't enumerate the kinds.

use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

use crate::tensor::{DenseTensor, ElementType};

/// The initialization strategy for a freshly-created sparse row, or for a
/// dense table's initial value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    Constant(f32),
    Uniform { lower: f32, upper: f32 },
    Normal { mean: f32, stddev: f32 },
    XavierUniform { gain: f32 },
    XavierNormal { gain: f32 },
}

impl Initializer {
    /// Produce a freshly-initialized dense tensor of the given shape.
    ///
    /// Xavier variants treat the tensor's total element count as both
    /// fan-in and fan-out, since rows here are flat `[dimension]` vectors
    /// rather than 2-D weight matrices.
    pub fn initialize(&self, shape: Vec<i64>, dtype: ElementType) -> DenseTensor {
        let len = shape.iter().product::<i64>().max(0) as usize;
        let data = match self {
            Initializer::Constant(v) => vec![*v; len],
            Initializer::Uniform { lower, upper } => {
                let mut rng = rand::rngs::SmallRng::from_os_rng();
                let dist = Uniform::new(*lower, *upper).expect("valid uniform range");
                (0..len).map(|_| dist.sample(&mut rng)).collect()
            }
            Initializer::Normal { mean, stddev } => {
                let mut rng = rand::rngs::SmallRng::from_os_rng();
                let dist = Normal::new(*mean, *stddev).expect("valid normal params");
                (0..len).map(|_| dist.sample(&mut rng)).collect()
            }
            Initializer::XavierUniform { gain } => {
                let fan = len.max(1) as f32;
                let bound = gain * (6.0 / (fan + fan)).sqrt();
                let mut rng = rand::rngs::SmallRng::from_os_rng();
                let dist = Uniform::new(-bound, bound).expect("valid xavier bound");
                (0..len).map(|_| dist.sample(&mut rng)).collect()
            }
            Initializer::XavierNormal { gain } => {
                let fan = len.max(1) as f32;
                let std = gain * (2.0 / (fan + fan)).sqrt();
                let mut rng = rand::rngs::SmallRng::from_os_rng();
                let dist = Normal::new(0.0, std).expect("valid xavier std");
                (0..len).map(|_| dist.sample(&mut rng)).collect()
            }
        };
        DenseTensor::new(shape, dtype, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_fills_every_element() {
        let t = Initializer::Constant(0.5).initialize(vec![4], ElementType::F32);
        assert_eq!(t.data, vec![0.5, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn uniform_stays_in_bounds() {
        let t = Initializer::Uniform {
            lower: -1.0,
            upper: 1.0,
        }
        .initialize(vec![64], ElementType::F32);
        assert!(t.data.iter().all(|&x| (-1.0..1.0).contains(&x)));
    }
}
