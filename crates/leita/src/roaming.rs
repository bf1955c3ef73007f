//! Dual-resident buffers that roam between host and device memory.
//!
//! A `RoamingArray` owns at most one host vector and one device buffer and
//! copies across sides lazily, on first access from the other side. It is the
//! only type in the decoding core that touches the wgpu API; everything else
//! consumes plain slices.

use std::marker::PhantomData;
use std::sync::Arc;

use log::trace;
use wgpu::util::DeviceExt;

use crate::context::WgpuContext;
use crate::error::{LeitaError, LeitaResult};

/// Element types that may live in device buffers.
pub trait DeviceElem: bytemuck::Pod + Send + Sync + 'static {}

impl DeviceElem for f32 {}
impl DeviceElem for u32 {}
impl DeviceElem for half::f16 {}

/// A typed, fixed-length storage buffer on one device.
pub struct GpuArray<T> {
    buffer: Arc<wgpu::Buffer>,
    len: usize,
    context: Arc<WgpuContext>,
    _marker: PhantomData<T>,
}

impl<T: DeviceElem> GpuArray<T> {
    /// Uploads `data` into a fresh storage buffer.
    pub fn from_slice(
        context: &Arc<WgpuContext>,
        data: &[T],
        label: &str,
    ) -> LeitaResult<Self> {
        if data.is_empty() {
            return Err(LeitaError::AllocationFailed(
                "cannot allocate an empty device buffer".into(),
            ));
        }
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 > context.max_buffer_size() {
            return Err(LeitaError::AllocationFailed(format!(
                "{} bytes exceeds device max buffer size {}",
                bytes.len(),
                context.max_buffer_size()
            )));
        }

        let buffer = context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytes,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            });
        trace!("uploaded {} elements to device buffer '{}'", data.len(), label);

        Ok(Self {
            buffer: Arc::new(buffer),
            len: data.len(),
            context: context.clone(),
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn context(&self) -> &Arc<WgpuContext> {
        &self.context
    }

    /// Copies the buffer back to the host, blocking until the copy lands.
    pub fn read(&self) -> LeitaResult<Vec<T>> {
        let bytes = pollster::block_on(self.read_bytes())?;
        let logical = self.len * std::mem::size_of::<T>();
        Ok(bytemuck::pod_collect_to_vec(&bytes[..logical]))
    }

    async fn read_bytes(&self) -> LeitaResult<Vec<u8>> {
        let device = &self.context.device;
        let queue = &self.context.queue;
        let size = self.buffer.size();

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("leita_readback_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("leita_readback"),
        });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, size);
        queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        device
            .poll(wgpu::PollType::wait())
            .map_err(|e| LeitaError::DeviceTransfer(e.to_string()))?;

        rx.receive()
            .await
            .ok_or_else(|| LeitaError::DeviceTransfer("readback channel closed".into()))?
            .map_err(|e| LeitaError::DeviceTransfer(e.to_string()))?;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }
}

/// A buffer resident on the host, the device, or (after a read) both.
///
/// Exactly one side is the source of truth for writes: `set_host` /
/// `as_host_mut` invalidate the device side and vice versa. Reading across
/// sides fills the missing copy and keeps both valid until the next write.
pub struct RoamingArray<T: DeviceElem> {
    host: Option<Vec<T>>,
    device: Option<GpuArray<T>>,
    host_valid: bool,
    device_valid: bool,
    context: Option<Arc<WgpuContext>>,
}

impl<T: DeviceElem> RoamingArray<T> {
    /// An array whose authoritative copy lives on the host.
    pub fn from_host(data: Vec<T>) -> Self {
        Self {
            host: Some(data),
            device: None,
            host_valid: true,
            device_valid: false,
            context: None,
        }
    }

    /// An array whose authoritative copy lives on the device.
    pub fn from_device(array: GpuArray<T>) -> Self {
        let context = array.context().clone();
        Self {
            host: None,
            device: Some(array),
            host_valid: false,
            device_valid: true,
            context: Some(context),
        }
    }

    /// Attaches the context used to allocate a device side on demand.
    pub fn with_context(mut self, context: Arc<WgpuContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn len(&self) -> usize {
        if self.host_valid {
            self.host.as_ref().map_or(0, Vec::len)
        } else if self.device_valid {
            self.device.as_ref().map_or(0, GpuArray::len)
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declares the host side authoritative with new contents.
    pub fn set_host(&mut self, data: Vec<T>) {
        self.host = Some(data);
        self.host_valid = true;
        self.device = None;
        self.device_valid = false;
    }

    /// Declares the device side authoritative with a new buffer.
    pub fn set_device(&mut self, array: GpuArray<T>) {
        self.context = Some(array.context().clone());
        self.device = Some(array);
        self.device_valid = true;
        self.host_valid = false;
    }

    /// Host view, copying device->host first when the host side is stale.
    pub fn as_host(&mut self) -> LeitaResult<&[T]> {
        self.fill_host()?;
        Ok(self.host.as_deref().unwrap_or(&[]))
    }

    /// Mutable host view. The device side becomes stale.
    pub fn as_host_mut(&mut self) -> LeitaResult<&mut [T]> {
        self.fill_host()?;
        self.device = None;
        self.device_valid = false;
        Ok(self.host.as_deref_mut().unwrap_or(&mut []))
    }

    /// Device view, copying host->device first when the device side is
    /// stale. Requires a context when the array started host-side.
    pub fn as_device(&mut self) -> LeitaResult<&GpuArray<T>> {
        if !self.device_valid {
            if !self.host_valid {
                return Err(LeitaError::AllocationFailed(
                    "roaming array has no contents on either side".into(),
                ));
            }
            let context = self.context.clone().ok_or(LeitaError::GpuUnavailable)?;
            let host = self.host.as_ref().expect("host side marked valid");
            self.device = Some(GpuArray::from_slice(&context, host, "leita_roaming")?);
            self.device_valid = true;
        }
        Ok(self.device.as_ref().expect("device side marked valid"))
    }

    fn fill_host(&mut self) -> LeitaResult<()> {
        if !self.host_valid && self.device_valid {
            let data = self
                .device
                .as_ref()
                .expect("device side marked valid")
                .read()?;
            self.host = Some(data);
            self.host_valid = true;
        }
        Ok(())
    }
}

impl<T: DeviceElem> Default for RoamingArray<T> {
    fn default() -> Self {
        Self {
            host: None,
            device: None,
            host_valid: false,
            device_valid: false,
            context: None,
        }
    }
}
