//! Optional DCT (Deep Compressed Training) gradient compression: per table,
//! an error-feedback residual plus a magnitude threshold recomputed every
//! `life_span` steps, sparsifying the push gradient to the rows whose
//! magnitude clears the threshold.
//!
//! Grounded in `original_source/kraken/worker/dct_emitter.cc`'s
//! `DenseBag::MaybeToCoo`. That original selects individual scalar entries;
//! this crate's [`ps_tensor::CooTensor`] is row-sparse (it exists to mirror
//! a sparse *table*'s row layout), so selection here is per leading-dimension
//! row instead of per scalar: a row is kept whole once any element of it
//! clears `tau`. Everything else about the algorithm (residual accumulation,
//! periodic threshold recompute) is unchanged.

use ps_tensor::{CooTensor, DenseTensor, Tensor};

/// Below this many elements, compression isn't worth a COO round-trip's
/// overhead; matches the original's fixed `128`-element floor.
const MIN_COMPRESS_SIZE: usize = 128;

pub struct DctConfig {
    pub life_span: u64,
    pub eta: f32,
}

/// Per-table compression state: the accumulated residual of gradient mass
/// dropped by past rounds, the current magnitude threshold, and a step
/// counter gating threshold recomputation.
pub struct DenseBag {
    error_grad: DenseTensor,
    tau: f32,
    step: u64,
}

impl DenseBag {
    pub fn new(template: &DenseTensor) -> Self {
        DenseBag {
            error_grad: template.zero_like(),
            tau: 0.0,
            step: 0,
        }
    }

    fn row_len(shape: &[i64]) -> usize {
        shape.iter().skip(1).product::<i64>().max(1) as usize
    }

    fn row_count(shape: &[i64]) -> usize {
        shape.first().copied().unwrap_or(1).max(1) as usize
    }

    fn row_max_abs(data: &[f32], row_len: usize, row: usize) -> f32 {
        data[row * row_len..(row + 1) * row_len]
            .iter()
            .fold(0.0f32, |acc, &v| acc.max(v.abs()))
    }

    /// Sparsify `grad` against this bag's residual, possibly recomputing
    /// `tau`. Returns the dense gradient unchanged when it's too small to be
    /// worth compressing.
    pub fn maybe_to_coo(&mut self, cfg: &DctConfig, grad: &DenseTensor) -> Tensor {
        if grad.size() < MIN_COMPRESS_SIZE {
            return Tensor::Dense(grad.clone());
        }

        let f_grad = grad + &self.error_grad;
        let row_len = Self::row_len(&f_grad.shape);
        let rows = Self::row_count(&f_grad.shape);

        if cfg.life_span > 0 && self.step % cfg.life_span == 0 {
            let mut mags: Vec<f32> = (0..rows).map(|r| Self::row_max_abs(&f_grad.data, row_len, r)).collect();
            mags.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
            let k = ((rows as f32) * (1.0 - cfg.eta)).round().max(1.0) as usize;
            let idx = k.saturating_sub(1).min(rows.saturating_sub(1));
            self.tau = mags.get(idx).copied().unwrap_or(0.0);
        }
        self.step += 1;

        let mut indices = Vec::new();
        let mut kept_values = Vec::new();
        let mut residual = f_grad.clone();
        for r in 0..rows {
            if Self::row_max_abs(&f_grad.data, row_len, r) >= self.tau {
                indices.push(r as i64);
                kept_values.extend_from_slice(&f_grad.data[r * row_len..(r + 1) * row_len]);
                residual.data[r * row_len..(r + 1) * row_len].fill(0.0);
            }
        }
        self.error_grad = residual;

        if indices.len() == rows {
            return Tensor::Dense(f_grad);
        }
        let mut coo_shape = f_grad.shape.clone();
        coo_shape[0] = indices.len() as i64;
        Tensor::Coo(CooTensor {
            indices,
            values: DenseTensor::new(coo_shape, f_grad.dtype, kept_values),
            shape: f_grad.shape.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_tensor::ElementType;

    fn row_tensor(rows: i64, cols: i64, fill: impl Fn(usize) -> f32) -> DenseTensor {
        let mut data = Vec::new();
        for r in 0..rows as usize {
            for _ in 0..cols {
                data.push(fill(r));
            }
        }
        DenseTensor::new(vec![rows, cols], ElementType::F32, data)
    }

    #[test]
    fn small_gradients_pass_through_uncompressed() {
        let mut bag = DenseBag::new(&row_tensor(2, 2, |_| 0.0));
        let grad = row_tensor(2, 2, |_| 1.0);
        let cfg = DctConfig { life_span: 4, eta: 0.5 };
        assert!(matches!(bag.maybe_to_coo(&cfg, &grad), Tensor::Dense(_)));
    }

    #[test]
    fn large_gradients_with_skewed_rows_compress_to_coo() {
        let rows = 200i64;
        let cols = 4i64;
        let grad = row_tensor(rows, cols, |r| if r == 0 { 100.0 } else { 0.0001 * r as f32 });
        let mut bag = DenseBag::new(&row_tensor(rows, cols, |_| 0.0));
        let cfg = DctConfig { life_span: 1, eta: 0.95 };
        let out = bag.maybe_to_coo(&cfg, &grad);
        match out {
            Tensor::Coo(coo) => {
                assert!(coo.indices.len() < rows as usize);
                assert!(coo.indices.contains(&0));
            }
            Tensor::Dense(_) => panic!("expected compression to trigger"),
        }
    }

    #[test]
    fn residual_is_retained_for_rows_dropped_from_the_coo() {
        let rows = 200i64;
        let cols = 4i64;
        let grad = row_tensor(rows, cols, |r| if r == 0 { 100.0 } else { 0.0001 * r as f32 });
        let mut bag = DenseBag::new(&row_tensor(rows, cols, |_| 0.0));
        let cfg = DctConfig { life_span: 1, eta: 0.95 };
        let _ = bag.maybe_to_coo(&cfg, &grad);
        assert!(bag.error_grad.data.iter().any(|&v| v != 0.0));
    }
}
