//! Scope guards for runtime-owned buffers.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::{DeviceId, DeviceRuntime, decode_i32, decode_i64};
use crate::error::GqxResult;

/// Pinned host buffer owned by one `project()` call.
///
/// The release is registered the moment the allocation succeeds: dropping the
/// guard calls `host_free` exactly once, whether the scope ends normally, by
/// `?`, or by unwinding.
pub struct ScopedHostBuffer<'r, R: DeviceRuntime> {
    runtime: &'r R,
    buf: ManuallyDrop<R::HostBuf>,
    bytes: usize,
}

impl<'r, R: DeviceRuntime> ScopedHostBuffer<'r, R> {
    pub fn acquire(runtime: &'r R, bytes: usize) -> GqxResult<Self> {
        let buf = runtime.host_alloc(bytes)?;
        tracing::trace!(target: "gpu", bytes, "host buffer acquired");
        Ok(Self {
            runtime,
            buf: ManuallyDrop::new(buf),
            bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Enqueue a copy of the first `self.len()` bytes of `src` into this buffer.
    pub fn fill_from(
        &mut self,
        src: &R::DeviceBuf,
        stream: &R::Stream,
        device: DeviceId,
    ) -> GqxResult<()> {
        let bytes = self.bytes;
        self.runtime
            .async_copy_device_to_host(&mut self.buf, src, bytes, stream, device)
    }

    /// Contents as `i32`. Only valid after the populating stream was drained.
    pub fn read_i32(&self) -> GqxResult<Vec<i32>> {
        self.runtime.read_host(&self.buf, decode_i32)
    }

    /// Contents as `i64`. Only valid after the populating stream was drained.
    pub fn read_i64(&self) -> GqxResult<Vec<i64>> {
        self.runtime.read_host(&self.buf, decode_i64)
    }
}

impl<R: DeviceRuntime> Drop for ScopedHostBuffer<'_, R> {
    fn drop(&mut self) {
        // SAFETY: `buf` is never touched again after this point.
        let buf = unsafe { ManuallyDrop::take(&mut self.buf) };
        self.runtime.host_free(buf);
        tracing::trace!(target: "gpu", bytes = self.bytes, "host buffer released");
    }
}

/// Device allocation returned to its runtime on drop.
pub struct DeviceAllocation<R: DeviceRuntime> {
    runtime: Arc<R>,
    buf: ManuallyDrop<R::DeviceBuf>,
    bytes: usize,
    device: DeviceId,
}

impl<R: DeviceRuntime> DeviceAllocation<R> {
    /// Zero-filled device allocation.
    pub fn alloc(runtime: &Arc<R>, bytes: usize, device: DeviceId) -> GqxResult<Self> {
        let buf = runtime.device_alloc(bytes, device)?;
        Ok(Self::wrap(runtime, buf, bytes, device))
    }

    /// Device allocation initialised from host bytes.
    pub fn upload(runtime: &Arc<R>, data: &[u8], device: DeviceId) -> GqxResult<Self> {
        let buf = runtime.upload(data, device)?;
        Ok(Self::wrap(runtime, buf, data.len(), device))
    }

    fn wrap(runtime: &Arc<R>, buf: R::DeviceBuf, bytes: usize, device: DeviceId) -> Self {
        Self {
            runtime: Arc::clone(runtime),
            buf: ManuallyDrop::new(buf),
            bytes,
            device,
        }
    }

    pub fn buffer(&self) -> &R::DeviceBuf {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }
}

impl<R: DeviceRuntime> Drop for DeviceAllocation<R> {
    fn drop(&mut self) {
        // SAFETY: `buf` is never touched again after this point.
        let buf = unsafe { ManuallyDrop::take(&mut self.buf) };
        self.runtime.device_free(buf);
    }
}
