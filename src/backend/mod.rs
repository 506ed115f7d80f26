use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::{bail, Result};

#[cfg(feature = "cuda")]
pub mod nvidia;

/// Lowest compute capability with native double-precision GEMM.
pub const DOUBLE_PRECISION_MIN_CAPABILITY: ComputeCapability = ComputeCapability {
    major: 1,
    minor: 3,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    pub fn element_size(self) -> u64 {
        match self {
            Self::Single => std::mem::size_of::<f32>() as u64,
            Self::Double => std::mem::size_of::<f64>() as u64,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Double => "double",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    pub fn supports_double(self) -> bool {
        self >= DOUBLE_PRECISION_MIN_CAPABILITY
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub index: usize,
    pub name: String,
    pub capability: ComputeCapability,
    pub memory_total_bytes: u64,
    pub memory_free_bytes: u64,
}

/// Column-major square operand kept on the host until upload.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMatrix {
    Single(Vec<f32>),
    Double(Vec<f64>),
}

impl HostMatrix {
    pub fn len(&self) -> usize {
        match self {
            Self::Single(values) => values.len(),
            Self::Double(values) => values.len(),
        }
    }
}

/// Enumerates accelerators and opens them on the calling thread.
pub trait AcceleratorPlatform: Sync {
    fn name(&self) -> &'static str;

    fn device_count(&self) -> Result<usize>;

    /// Binds `index` to the calling thread and returns a context owned by it.
    fn open(&self, index: usize) -> Result<Box<dyn AcceleratorDevice>>;
}

/// A device context exclusively owned by one burn worker. Dropping it
/// releases every device buffer and library handle it holds.
pub trait AcceleratorDevice {
    fn properties(&self) -> &DeviceProperties;

    /// Moves `a` and `b` to device memory and seeds `slots` result buffers
    /// with a copy of `a`.
    fn upload(
        &mut self,
        dimension: usize,
        a: &HostMatrix,
        b: &HostMatrix,
        slots: usize,
    ) -> Result<()>;

    /// Enqueues `C[slot] = A * B`.
    fn multiply(&mut self, slot: usize) -> Result<()>;

    fn synchronize(&mut self) -> Result<()>;
}

/// Platform used when the binary is built without an accelerator runtime.
pub struct HostOnlyPlatform;

impl AcceleratorPlatform for HostOnlyPlatform {
    fn name(&self) -> &'static str {
        "host-only"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(0)
    }

    fn open(&self, index: usize) -> Result<Box<dyn AcceleratorDevice>> {
        bail!("accelerator device {index} requested but kiln was built without an accelerator runtime")
    }
}

#[cfg(feature = "cuda")]
pub fn default_platform() -> Box<dyn AcceleratorPlatform + Send> {
    Box::new(nvidia::NvidiaPlatform)
}

#[cfg(not(feature = "cuda"))]
pub fn default_platform() -> Box<dyn AcceleratorPlatform + Send> {
    Box::new(HostOnlyPlatform)
}

#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub index: usize,
    pub name: String,
    pub precision: Precision,
    pub dimension: u64,
    pub iterations: u64,
    pub memory_total_bytes: u64,
    pub memory_free_bytes: u64,
    pub usable_bytes: u64,
    pub multiplies: Arc<AtomicU64>,
}

impl DeviceReport {
    /// Floating-point operations in one `dimension`-sized GEMM.
    pub fn flops_per_multiply(&self) -> f64 {
        let n = self.dimension as f64;
        2.0 * n * n * n
    }
}

#[derive(Debug, Clone)]
pub enum BurnEvent {
    Notice {
        message: String,
    },
    Warning {
        device: Option<usize>,
        message: String,
    },
    PrecisionDowngraded {
        device: usize,
        name: String,
        capability: ComputeCapability,
    },
    DeviceReady(DeviceReport),
    Error {
        device: usize,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_precision_requires_capability_1_3() {
        assert!(!ComputeCapability { major: 1, minor: 2 }.supports_double());
        assert!(ComputeCapability { major: 1, minor: 3 }.supports_double());
        assert!(ComputeCapability { major: 2, minor: 0 }.supports_double());
        assert!(!ComputeCapability { major: 0, minor: 9 }.supports_double());
    }

    #[test]
    fn element_sizes_match_float_widths() {
        assert_eq!(Precision::Single.element_size(), 4);
        assert_eq!(Precision::Double.element_size(), 8);
    }

    #[test]
    fn host_only_platform_reports_no_devices() {
        let platform = HostOnlyPlatform;
        assert_eq!(platform.device_count().expect("count should succeed"), 0);
        let err = match platform.open(0) {
            Ok(_) => panic!("host-only platform must not open devices"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("without an accelerator runtime"));
    }
}
