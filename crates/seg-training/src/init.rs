//! Seeded parameter initialization.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use seg_core::{Error, Result};

/// Standard deviation of every convolution kernel
pub const KERNEL_STDDEV: f32 = 5e-2;

/// Draws `len` values from a normal distribution truncated at two standard
/// deviations. Values outside the band are resampled.
pub fn truncated_normal(len: usize, stddev: f32, seed: u64) -> Result<Vec<f32>> {
    let normal = Normal::new(0.0f32, stddev)
        .map_err(|e| Error::Model(format!("invalid init distribution: {}", e)))?;
    let bound = 2.0 * stddev;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(len);
    while values.len() < len {
        let v = normal.sample(&mut rng);
        if v.abs() <= bound {
            values.push(v);
        }
    }
    Ok(values)
}

/// Kernel tensor of the given shape filled from [`truncated_normal`].
pub fn seeded_kernel<B: Backend>(shape: [usize; 4], seed: u64, device: &B::Device) -> Result<Tensor<B, 4>> {
    let len = shape.iter().product();
    let values = truncated_normal(len, KERNEL_STDDEV, seed)?;
    Ok(Tensor::from_data(TensorData::new(values, shape), device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    #[test]
    fn test_same_seed_is_identical() {
        let a = truncated_normal(500, KERNEL_STDDEV, 100).unwrap();
        let b = truncated_normal(500, KERNEL_STDDEV, 100).unwrap();
        assert_eq!(a, b);
        let c = truncated_normal(500, KERNEL_STDDEV, 101).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_values_are_truncated() {
        let values = truncated_normal(10_000, KERNEL_STDDEV, 7).unwrap();
        assert!(values.iter().all(|v| v.abs() <= 2.0 * KERNEL_STDDEV));
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 5e-3);
    }

    #[test]
    fn test_seeded_kernel_shape() {
        let device = Default::default();
        let kernel = seeded_kernel::<NdArray<f32>>([4, 2, 3, 3], 1, &device).unwrap();
        assert_eq!(kernel.dims(), [4, 2, 3, 3]);
    }
}
