//! Device factory registry for runtime device creation and caching.
//!
//! A [`DeviceHandle`] bundles everything needed to build and run kernels on
//! one device: the backend's operations vector, a context and an allocator.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use skein_device::{Allocator, Buffer, BufferOptions, Context, CpuAllocator, DeviceSpec, KernelFlags, KernelOps};
use skein_dtype::DType;

use crate::devices::HostOps;
use crate::error::{Result, UnsupportedDeviceSnafu};
use crate::kernel::Kernel;

/// An opened device.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub spec: DeviceSpec,
    pub ops: Arc<dyn KernelOps>,
    pub context: Context,
    pub allocator: Arc<dyn Allocator>,
}

impl DeviceHandle {
    /// Lazily allocated buffer in this device's context.
    pub fn buffer(&self, dtype: DType, shape: Vec<usize>) -> Buffer {
        Buffer::new(Arc::clone(&self.allocator), &self.context, dtype, shape, BufferOptions::default())
    }

    /// Compile a kernel for this device.
    pub fn kernel(&self, sources: &[&str], name: &str, flags: KernelFlags) -> Result<Kernel> {
        Kernel::new(Arc::clone(&self.ops), &self.context, sources, name, flags)
    }
}

/// Factory function that opens a device for a given [`DeviceSpec`].
pub type DeviceFactory = Arc<dyn Fn(&DeviceSpec) -> Result<DeviceHandle> + Send + Sync>;

/// Registry of opened devices with caching and factory registration.
///
/// Uses `parking_lot::RwLock` with double-checked locking, so concurrent
/// lookups of a cached device only take the read lock and a device is opened
/// at most once.
///
/// ```ignore
/// let host = DEVICES.device(&DeviceSpec::Host)?;
/// let mut kernel = host.kernel(&[SRC], "fill", KernelFlags::empty())?;
/// ```
pub struct DeviceFactoryRegistry {
    devices: RwLock<HashMap<DeviceSpec, Arc<DeviceHandle>>>,
    /// Device type key ("HOST", "CUDA") -> factory.
    factories: RwLock<HashMap<String, DeviceFactory>>,
}

impl DeviceFactoryRegistry {
    /// Create a registry with the built-in factories registered.
    pub fn new() -> Self {
        let registry = Self { devices: RwLock::new(HashMap::new()), factories: RwLock::new(HashMap::new()) };

        registry.register_factory("HOST", Arc::new(open_host_from_env));

        #[cfg(feature = "cuda")]
        registry.register_factory("CUDA", Arc::new(open_cuda));

        registry
    }

    /// Register a factory for a device type (case-insensitive).
    pub fn register_factory(&self, device_type: &str, factory: DeviceFactory) {
        self.factories.write().insert(device_type.to_uppercase(), factory);
    }

    /// Get or open the device for `spec`.
    pub fn device(&self, spec: &DeviceSpec) -> Result<Arc<DeviceHandle>> {
        if let Some(dev) = self.devices.read().get(spec) {
            return Ok(Arc::clone(dev));
        }

        let mut devices = self.devices.write();
        if let Some(dev) = devices.get(spec) {
            return Ok(Arc::clone(dev));
        }

        let device_type = spec.base_type();
        let factory = self
            .factories
            .read()
            .get(device_type)
            .cloned()
            .ok_or_else(|| UnsupportedDeviceSnafu { device: device_type.to_string() }.build())?;

        let device = Arc::new(factory(spec)?);
        tracing::debug!(device = %spec, context.id = device.context.id(), "device opened");
        devices.insert(spec.clone(), Arc::clone(&device));
        Ok(device)
    }

    /// Parse a device string ("HOST", "CUDA:1") and open it.
    pub fn device_str(&self, device: &str) -> Result<Arc<DeviceHandle>> {
        self.device(&DeviceSpec::parse(device)?)
    }
}

impl Default for DeviceFactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Open a host device backed by `ops`.
pub fn open_host(ops: HostOps) -> DeviceHandle {
    let context = ops.create_context();
    DeviceHandle { spec: DeviceSpec::Host, ops: Arc::new(ops), context, allocator: Arc::new(CpuAllocator) }
}

fn open_host_from_env(_spec: &DeviceSpec) -> Result<DeviceHandle> {
    Ok(open_host(HostOps::from_env()))
}

#[cfg(feature = "cuda")]
fn open_cuda(spec: &DeviceSpec) -> Result<DeviceHandle> {
    let DeviceSpec::Cuda { device_id } = *spec else {
        return crate::error::InvalidDeviceSnafu { device: spec.to_string() }.fail();
    };
    let ops = crate::devices::CudaOps::new(device_id)?;
    let context = ops.create_context()?;
    let allocator = Arc::new(ops.allocator());
    Ok(DeviceHandle { spec: spec.clone(), ops: Arc::new(ops), context, allocator })
}

/// Global device registry, created on first use.
pub static DEVICES: Lazy<DeviceFactoryRegistry> = Lazy::new(DeviceFactoryRegistry::new);
