//! CUDA runtime backed by `cudarc`.

use cudarc::driver::{CudaContext, CudaSlice, CudaStream, PinnedHostSlice};
use dashmap::DashMap;
use std::sync::Arc;

use super::{DeviceId, DeviceRuntime};
use crate::error::{GqxError, GqxResult};

/// Driver-backed [`DeviceRuntime`].
pub struct CudaRuntime {
    /// Context used for pinned host allocations
    primary: Arc<CudaContext>,
    /// Lazily created per-device contexts
    contexts: DashMap<u32, Arc<CudaContext>>,
}

impl CudaRuntime {
    /// Open device `primary`. Returns None when no compatible device exists.
    pub fn try_new(primary: DeviceId) -> Option<Self> {
        let ctx = match CudaContext::new(primary.0 as usize) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(target: "gpu", device = primary.0, "CUDA init failed: {:?}", e);
                return None;
            }
        };
        let contexts = DashMap::new();
        contexts.insert(primary.0, Arc::clone(&ctx));
        tracing::info!(target: "gpu", device = primary.0, "CUDA runtime initialized");
        Some(Self {
            primary: ctx,
            contexts,
        })
    }

    fn context(&self, device: DeviceId) -> GqxResult<Arc<CudaContext>> {
        if let Some(ctx) = self.contexts.get(&device.0) {
            return Ok(Arc::clone(&ctx));
        }
        let ctx = CudaContext::new(device.0 as usize)
            .map_err(|e| GqxError::Gpu(format!("failed to open {}: {:?}", device, e)))?;
        self.contexts.insert(device.0, Arc::clone(&ctx));
        Ok(ctx)
    }
}

impl DeviceRuntime for CudaRuntime {
    type DeviceBuf = CudaSlice<u8>;
    type HostBuf = PinnedHostSlice<u8>;
    type Stream = Arc<CudaStream>;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn create_stream(&self, device: DeviceId) -> GqxResult<Arc<CudaStream>> {
        self.context(device)?
            .new_stream()
            .map_err(|e| GqxError::Gpu(format!("stream creation failed: {:?}", e)))
    }

    fn destroy_stream(&self, stream: Arc<CudaStream>) {
        drop(stream);
    }

    fn device_alloc(&self, bytes: usize, device: DeviceId) -> GqxResult<CudaSlice<u8>> {
        self.context(device)?
            .default_stream()
            .alloc_zeros::<u8>(bytes)
            .map_err(|e| GqxError::alloc(format!("device buffer ({:?})", e), bytes))
    }

    fn device_free(&self, buf: CudaSlice<u8>) {
        drop(buf);
    }

    fn upload(&self, data: &[u8], device: DeviceId) -> GqxResult<CudaSlice<u8>> {
        let stream = self.context(device)?.default_stream();
        let slice = stream
            .clone_htod(data)
            .map_err(|e| GqxError::Gpu(format!("CUDA HTOD copy failed: {:?}", e)))?;
        stream
            .synchronize()
            .map_err(|e| GqxError::SyncFailure {
                device: device.0,
                message: format!("{:?}", e),
            })?;
        Ok(slice)
    }

    fn host_alloc(&self, bytes: usize) -> GqxResult<PinnedHostSlice<u8>> {
        // SAFETY: the buffer is only read after the stream that fills it is drained.
        unsafe { self.primary.alloc_pinned::<u8>(bytes) }
            .map_err(|e| GqxError::alloc(format!("pinned host buffer ({:?})", e), bytes))
    }

    fn host_free(&self, buf: PinnedHostSlice<u8>) {
        drop(buf);
    }

    fn async_copy_device_to_host(
        &self,
        dst: &mut PinnedHostSlice<u8>,
        src: &CudaSlice<u8>,
        bytes: usize,
        stream: &Arc<CudaStream>,
        device: DeviceId,
    ) -> GqxResult<()> {
        if bytes > src.len() || bytes > dst.len() {
            return Err(GqxError::CopyFailure(format!(
                "copy of {bytes} bytes exceeds source ({}) or destination ({})",
                src.len(),
                dst.len()
            )));
        }
        let view = src.slice(0..bytes);
        stream
            .memcpy_dtoh(&view, dst)
            .map_err(|e| GqxError::CopyFailure(format!("{} DTOH enqueue: {:?}", device, e)))
    }

    fn wait_for_stream(&self, stream: &Arc<CudaStream>, device: DeviceId) -> GqxResult<()> {
        stream.synchronize().map_err(|e| GqxError::SyncFailure {
            device: device.0,
            message: format!("{:?}", e),
        })
    }

    fn read_host<T>(&self, buf: &PinnedHostSlice<u8>, f: impl FnOnce(&[u8]) -> T) -> GqxResult<T> {
        let bytes = buf
            .as_slice()
            .map_err(|e| GqxError::Gpu(format!("pinned buffer not readable: {:?}", e)))?;
        Ok(f(bytes))
    }
}
