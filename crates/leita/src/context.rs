//! Compute device selection and the wgpu context behind device-resident
//! roaming arrays.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{LeitaError, LeitaResult};

/// Compute device requested by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Resolve to `Wgpu` when an adapter is available, otherwise `Cpu`.
    Auto,
    Cpu,
    Wgpu,
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Wgpu)
    }

    /// Resolves the request into a concrete device plus the context backing
    /// it. `Wgpu` without an adapter is an error; `Auto` falls back to CPU.
    pub fn resolve(self) -> LeitaResult<(Device, Option<Arc<WgpuContext>>)> {
        match self {
            Device::Cpu => Ok((Device::Cpu, None)),
            Device::Wgpu => {
                let context = WgpuContext::new()?;
                Ok((Device::Wgpu, Some(context)))
            }
            Device::Auto => match WgpuContext::new() {
                Ok(context) => {
                    debug!("auto device resolved to wgpu");
                    Ok((Device::Wgpu, Some(context)))
                }
                Err(_) => {
                    warn!("no wgpu adapter available, auto device resolved to cpu");
                    Ok((Device::Cpu, None))
                }
            },
        }
    }
}

/// Device, queue and adapter for one accelerator.
///
/// Nothing here launches kernels; the context exists so roaming arrays can
/// allocate storage buffers and run synchronous copies.
pub struct WgpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter: wgpu::Adapter,
    limits: wgpu::Limits,
}

impl WgpuContext {
    /// Acquires an adapter and device, blocking on the async wgpu calls.
    pub fn new() -> LeitaResult<Arc<Self>> {
        pollster::block_on(Self::request())
    }

    /// Whether any usable adapter exists on this machine.
    pub fn is_available() -> bool {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .is_ok()
    }

    async fn request() -> LeitaResult<Arc<Self>> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .map_err(|_| LeitaError::GpuUnavailable)?;

        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("leita_device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| LeitaError::AllocationFailed(e.to_string()))?;

        info!(
            "wgpu context initialized: adapter={}, max_buffer={:.2}GB",
            adapter.get_info().name,
            limits.max_buffer_size as f64 / 1_073_741_824.0
        );

        Ok(Arc::new(Self {
            device,
            queue,
            adapter,
            limits,
        }))
    }

    /// Largest buffer this device will allocate, in bytes.
    pub fn max_buffer_size(&self) -> u64 {
        self.limits.max_buffer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_methods() {
        assert!(Device::Cpu.is_cpu());
        assert!(!Device::Cpu.is_gpu());
        assert!(Device::Wgpu.is_gpu());
        assert!(!Device::Auto.is_cpu());
    }

    #[test]
    fn test_cpu_resolution_never_needs_adapter() {
        let (device, context) = Device::Cpu.resolve().unwrap();
        assert_eq!(device, Device::Cpu);
        assert!(context.is_none());
    }

    #[test]
    fn test_auto_resolution_always_succeeds() {
        let (device, context) = Device::Auto.resolve().unwrap();
        match device {
            Device::Wgpu => assert!(context.is_some()),
            Device::Cpu => assert!(context.is_none()),
            Device::Auto => panic!("auto must resolve to a concrete device"),
        }
    }
}
