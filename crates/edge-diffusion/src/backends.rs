//! Backend support for edge-diffusion
//!
//! Enable the desired backend via feature flags:
//!
//! - `ndarray`: CPU backend using ndarray (default)
//! - `wgpu`: WebGPU backend (cross-platform GPU support)
//!
//! The backend only runs the sampling arithmetic (guidance, scheduler
//! updates, latent scaling). Model inference goes through
//! [`ModelSessions`](crate::ModelSessions).

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

/// Type alias for the default backend when using ndarray feature
#[cfg(feature = "ndarray")]
pub type DefaultBackend = NdArray;

/// Type alias for the default backend when using wgpu feature
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub type DefaultBackend = Wgpu;

/// Get the default device for the enabled backend
#[cfg(feature = "ndarray")]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

/// Get the default device for the enabled backend
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}

/// Names of the backends compiled into this build
pub fn enabled_backends() -> Vec<&'static str> {
    let mut names = Vec::new();
    if cfg!(feature = "ndarray") {
        names.push("ndarray");
    }
    if cfg!(feature = "wgpu") {
        names.push("wgpu");
    }
    names
}

#[cfg(test)]
mod tests {
    #[cfg(any(feature = "ndarray", feature = "wgpu"))]
    use super::*;

    #[test]
    #[cfg(any(feature = "ndarray", feature = "wgpu"))]
    fn test_default_device() {
        let _device = default_device();
        assert!(!enabled_backends().is_empty());
    }
}
