//! Backend aliases used by the binary and the tests.

use burn::backend::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};

/// CPU inference backend
pub type InferenceBackend = NdArray<f32>;

/// CPU training backend with automatic differentiation
pub type TrainingBackend = Autodiff<InferenceBackend>;

/// Device the CPU backends run on
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// Human readable backend name for log banners
pub fn backend_name() -> &'static str {
    "ndarray (CPU)"
}
