//! GPU capability probing.
//!
//! Programmatic dependent launch (PDL) is requested from kernels only on
//! devices with compute capability major >= 9.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::DispatchResult;

/// Compute capability major version that enables PDL.
pub const PDL_MIN_MAJOR: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceCapability {
    pub major: u32,
    pub minor: u32,
}

impl DeviceCapability {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// `sm_XY` number, e.g. 90 for Hopper.
    pub fn sm_version(self) -> u32 {
        self.major * 10 + self.minor
    }

    pub fn supports_pdl(self) -> bool {
        self.major >= PDL_MIN_MAJOR
    }
}

pub trait CapabilityProbe: Send + Sync {
    fn capability(&self, device_index: usize) -> DispatchResult<DeviceCapability>;
}

/// Reports the same capability for every device.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub DeviceCapability);

impl CapabilityProbe for FixedProbe {
    fn capability(&self, _device_index: usize) -> DispatchResult<DeviceCapability> {
        Ok(self.0)
    }
}

/// Queries the CUDA driver for the device's compute capability.
#[cfg(feature = "cuda")]
#[derive(Debug, Clone, Copy, Default)]
pub struct CudaProbe;

#[cfg(feature = "cuda")]
impl CapabilityProbe for CudaProbe {
    fn capability(&self, device_index: usize) -> DispatchResult<DeviceCapability> {
        use cudarc::driver::{sys, CudaContext};

        let ctx = CudaContext::new(device_index)?;
        let major = ctx.attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor = ctx.attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
        let cap = DeviceCapability::new(major as u32, minor as u32);
        log::debug!(
            "Detected GPU compute capability on cuda:{}: sm_{} (major={}, minor={})",
            device_index,
            cap.sm_version(),
            major,
            minor
        );
        Ok(cap)
    }
}

/// Probe used when none is supplied: the CUDA driver if compiled in.
#[cfg(feature = "cuda")]
pub fn default_probe() -> Box<dyn CapabilityProbe> {
    Box::new(CudaProbe)
}

#[cfg(not(feature = "cuda"))]
pub fn default_probe() -> Box<dyn CapabilityProbe> {
    Box::new(UnavailableProbe)
}

#[cfg(not(feature = "cuda"))]
struct UnavailableProbe;

#[cfg(not(feature = "cuda"))]
impl CapabilityProbe for UnavailableProbe {
    fn capability(&self, device_index: usize) -> DispatchResult<DeviceCapability> {
        Err(crate::error::DispatchError::Cuda(format!(
            "cannot probe cuda:{device_index}: built without the `cuda` feature"
        )))
    }
}

/// Caches probe results per device index.
pub struct CapabilityCache {
    probe: Box<dyn CapabilityProbe>,
    results: Mutex<HashMap<usize, DeviceCapability>>,
}

impl CapabilityCache {
    pub fn new(probe: Box<dyn CapabilityProbe>) -> Self {
        Self {
            probe,
            results: Mutex::new(HashMap::new()),
        }
    }

    pub fn capability(&self, device_index: usize) -> DispatchResult<DeviceCapability> {
        let mut results = self
            .results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cap) = results.get(&device_index) {
            return Ok(*cap);
        }
        let cap = self.probe.capability(device_index)?;
        results.insert(device_index, cap);
        Ok(cap)
    }

    pub fn enable_pdl(&self, device_index: usize) -> DispatchResult<bool> {
        Ok(self.capability(device_index)?.supports_pdl())
    }
}

impl std::fmt::Debug for CapabilityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityCache").finish_non_exhaustive()
    }
}
