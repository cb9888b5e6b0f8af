//! Simulated device runtime.
//!
//! Device and pinned host memory are plain host allocations. Every stream is
//! a FIFO of deferred operations that run only when the stream is drained,
//! which makes "read before drain" observable instead of silently racy.
//! Faults can be armed per operation kind and every allocation, copy and
//! drain is counted.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::{DeviceId, DeviceRuntime};
use crate::error::{GqxError, GqxResult};

/// Failure points that can be armed on a [`SimulatedDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `host_alloc` returns an allocation failure
    HostAlloc,
    /// `device_alloc` / `upload` return an allocation failure
    DeviceAlloc,
    /// `async_copy_device_to_host` refuses to enqueue
    CopyEnqueue,
    /// Copies enqueue fine but fail when the stream executes them
    CopyInFlight,
    /// `wait_for_stream` reports a fault after draining
    Sync,
}

/// Accounting snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub host_allocs: usize,
    pub host_frees: usize,
    /// Requested size of every successful host allocation, in order
    pub host_alloc_sizes: Vec<usize>,
    pub live_host_buffers: usize,
    pub device_allocs: usize,
    pub device_frees: usize,
    pub live_device_buffers: usize,
    pub copies_enqueued: usize,
    pub bytes_device_to_host: usize,
    pub kernels_enqueued: usize,
    pub drains: usize,
    pub ops_executed: usize,
    pub double_frees: usize,
}

/// Device-side allocation.
pub struct SimDeviceBuffer {
    id: u64,
    device: DeviceId,
    data: Arc<RwLock<Vec<u8>>>,
}

impl SimDeviceBuffer {
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Handle for deferred stream operations that outlive the borrow.
    pub fn shared(&self) -> Arc<RwLock<Vec<u8>>> {
        Arc::clone(&self.data)
    }
}

/// Pinned host allocation.
pub struct SimHostBuffer {
    id: u64,
    data: Arc<Mutex<Vec<u8>>>,
    /// Copies enqueued into this buffer that have not executed yet
    pending: Arc<AtomicUsize>,
}

type PendingOp = Box<dyn FnOnce() -> GqxResult<()> + Send>;

/// FIFO of deferred operations bound to one device.
pub struct SimStream {
    id: u64,
    device: DeviceId,
    queue: Mutex<VecDeque<PendingOp>>,
}

impl SimStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Operations enqueued but not yet executed.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Host-memory stand-in for a GPU.
pub struct SimulatedDevice {
    device_count: u32,
    next_id: AtomicU64,
    faults: Mutex<HashSet<Fault>>,
    stats: Mutex<SimStats>,
    live_host: Mutex<HashSet<u64>>,
    live_device: Mutex<HashSet<u64>>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// Single-device runtime.
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    pub fn with_devices(device_count: u32) -> Self {
        Self {
            device_count,
            next_id: AtomicU64::new(1),
            faults: Mutex::new(HashSet::new()),
            stats: Mutex::new(SimStats::default()),
            live_host: Mutex::new(HashSet::new()),
            live_device: Mutex::new(HashSet::new()),
        }
    }

    /// Arm a fault; it stays armed until [`clear_faults`](Self::clear_faults).
    pub fn inject_fault(&self, fault: Fault) {
        self.faults.lock().insert(fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    pub fn stats(&self) -> SimStats {
        let mut stats = self.stats.lock().clone();
        stats.live_host_buffers = self.live_host.lock().len();
        stats.live_device_buffers = self.live_device.lock().len();
        stats
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = SimStats::default();
    }

    /// Enqueue an arbitrary device operation (kernel launch) on `stream`.
    pub fn enqueue<F>(&self, stream: &SimStream, device: DeviceId, op: F) -> GqxResult<()>
    where
        F: FnOnce() -> GqxResult<()> + Send + 'static,
    {
        if stream.device != device {
            return Err(GqxError::InvalidArguments(format!(
                "stream {} belongs to {}, not {}",
                stream.id, stream.device, device
            )));
        }
        stream.queue.lock().push_back(Box::new(op));
        self.stats.lock().kernels_enqueued += 1;
        Ok(())
    }

    fn armed(&self, fault: Fault) -> bool {
        self.faults.lock().contains(&fault)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_device(&self, device: DeviceId) -> GqxResult<()> {
        if device.0 >= self.device_count {
            return Err(GqxError::InvalidArguments(format!(
                "{} does not exist ({} device(s))",
                device, self.device_count
            )));
        }
        Ok(())
    }

    fn new_device_buffer(&self, data: Vec<u8>, device: DeviceId) -> GqxResult<SimDeviceBuffer> {
        self.check_device(device)?;
        if self.armed(Fault::DeviceAlloc) {
            return Err(GqxError::alloc("device buffer", data.len()));
        }
        let id = self.next_id();
        self.live_device.lock().insert(id);
        self.stats.lock().device_allocs += 1;
        Ok(SimDeviceBuffer {
            id,
            device,
            data: Arc::new(RwLock::new(data)),
        })
    }
}

impl DeviceRuntime for SimulatedDevice {
    type DeviceBuf = SimDeviceBuffer;
    type HostBuf = SimHostBuffer;
    type Stream = SimStream;

    fn name(&self) -> &'static str {
        "simulated"
    }

    fn create_stream(&self, device: DeviceId) -> GqxResult<SimStream> {
        self.check_device(device)?;
        Ok(SimStream {
            id: self.next_id(),
            device,
            queue: Mutex::new(VecDeque::new()),
        })
    }

    fn destroy_stream(&self, stream: SimStream) {
        let dropped = stream.queue.lock().len();
        if dropped > 0 {
            tracing::warn!(target: "gpu", stream = stream.id, dropped, "stream destroyed with pending operations");
        }
    }

    fn device_alloc(&self, bytes: usize, device: DeviceId) -> GqxResult<SimDeviceBuffer> {
        self.new_device_buffer(vec![0u8; bytes], device)
    }

    fn device_free(&self, buf: SimDeviceBuffer) {
        if self.live_device.lock().remove(&buf.id) {
            self.stats.lock().device_frees += 1;
        } else {
            self.stats.lock().double_frees += 1;
        }
    }

    fn upload(&self, data: &[u8], device: DeviceId) -> GqxResult<SimDeviceBuffer> {
        self.new_device_buffer(data.to_vec(), device)
    }

    fn host_alloc(&self, bytes: usize) -> GqxResult<SimHostBuffer> {
        if self.armed(Fault::HostAlloc) {
            return Err(GqxError::alloc("pinned host buffer", bytes));
        }
        let id = self.next_id();
        self.live_host.lock().insert(id);
        let mut stats = self.stats.lock();
        stats.host_allocs += 1;
        stats.host_alloc_sizes.push(bytes);
        Ok(SimHostBuffer {
            id,
            data: Arc::new(Mutex::new(vec![0u8; bytes])),
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn host_free(&self, buf: SimHostBuffer) {
        if self.live_host.lock().remove(&buf.id) {
            self.stats.lock().host_frees += 1;
        } else {
            self.stats.lock().double_frees += 1;
        }
    }

    fn async_copy_device_to_host(
        &self,
        dst: &mut SimHostBuffer,
        src: &SimDeviceBuffer,
        bytes: usize,
        stream: &SimStream,
        device: DeviceId,
    ) -> GqxResult<()> {
        if self.armed(Fault::CopyEnqueue) {
            return Err(GqxError::CopyFailure(format!(
                "could not enqueue {bytes} byte copy on stream {}",
                stream.id
            )));
        }
        if src.device != device || stream.device != device {
            return Err(GqxError::CopyFailure(format!(
                "device mismatch: source on {}, stream on {}, requested {}",
                src.device, stream.device, device
            )));
        }
        let src_len = src.len();
        let dst_len = dst.data.lock().len();
        if bytes > src_len || bytes > dst_len {
            return Err(GqxError::CopyFailure(format!(
                "copy of {bytes} bytes exceeds source ({src_len}) or destination ({dst_len})"
            )));
        }

        let fail_in_flight = self.armed(Fault::CopyInFlight);
        let src_data = src.shared();
        let dst_data = Arc::clone(&dst.data);
        let pending = Arc::clone(&dst.pending);
        pending.fetch_add(1, Ordering::AcqRel);

        stream.queue.lock().push_back(Box::new(move || {
            pending.fetch_sub(1, Ordering::AcqRel);
            if fail_in_flight {
                return Err(GqxError::CopyFailure(format!(
                    "device-to-host copy of {bytes} bytes failed in flight"
                )));
            }
            let src = src_data.read();
            dst_data.lock()[..bytes].copy_from_slice(&src[..bytes]);
            Ok(())
        }));

        let mut stats = self.stats.lock();
        stats.copies_enqueued += 1;
        stats.bytes_device_to_host += bytes;
        Ok(())
    }

    fn wait_for_stream(&self, stream: &SimStream, device: DeviceId) -> GqxResult<()> {
        self.stats.lock().drains += 1;
        if stream.device != device {
            return Err(GqxError::SyncFailure {
                device: device.0,
                message: format!("stream {} belongs to {}", stream.id, stream.device),
            });
        }

        let ops: Vec<PendingOp> = stream.queue.lock().drain(..).collect();
        let mut executed = 0;
        let mut outcome = Ok(());
        for op in ops {
            executed += 1;
            if let Err(e) = op() {
                // Remaining operations are discarded with the failed stream state.
                outcome = Err(GqxError::SyncFailure {
                    device: device.0,
                    message: e.to_string(),
                });
                break;
            }
        }
        self.stats.lock().ops_executed += executed;
        outcome?;

        if self.armed(Fault::Sync) {
            return Err(GqxError::SyncFailure {
                device: device.0,
                message: "injected stream fault".to_string(),
            });
        }
        Ok(())
    }

    fn read_host<T>(&self, buf: &SimHostBuffer, f: impl FnOnce(&[u8]) -> T) -> GqxResult<T> {
        if buf.pending.load(Ordering::Acquire) > 0 {
            return Err(GqxError::InvalidOperation {
                message: "host buffer read before its stream was drained".to_string(),
                context: format!("host buffer {}", buf.id),
            });
        }
        let data = buf.data.lock();
        Ok(f(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{decode_i32, encode_i32};

    const D0: DeviceId = DeviceId(0);

    #[test]
    fn copy_lands_only_after_drain() {
        let sim = SimulatedDevice::new();
        let stream = sim.create_stream(D0).unwrap();
        let src = sim.upload(&encode_i32(&[3, 7, 11]), D0).unwrap();
        let mut dst = sim.host_alloc(12).unwrap();

        sim.async_copy_device_to_host(&mut dst, &src, 12, &stream, D0)
            .unwrap();
        assert_eq!(stream.pending(), 1);
        assert!(sim.read_host(&dst, |_| ()).is_err());

        sim.wait_for_stream(&stream, D0).unwrap();
        assert_eq!(sim.read_host(&dst, decode_i32).unwrap(), vec![3, 7, 11]);
        assert_eq!(sim.stats().bytes_device_to_host, 12);
    }

    #[test]
    fn operations_run_in_enqueue_order() {
        let sim = SimulatedDevice::new();
        let stream = sim.create_stream(D0).unwrap();
        let buf = sim.device_alloc(4, D0).unwrap();
        let shared = buf.shared();
        sim.enqueue(&stream, D0, move || {
            shared.write().copy_from_slice(&9i32.to_le_bytes());
            Ok(())
        })
        .unwrap();

        let mut dst = sim.host_alloc(4).unwrap();
        sim.async_copy_device_to_host(&mut dst, &buf, 4, &stream, D0)
            .unwrap();
        sim.wait_for_stream(&stream, D0).unwrap();
        assert_eq!(sim.read_host(&dst, decode_i32).unwrap(), vec![9]);
    }

    #[test]
    fn oversized_copy_is_rejected() {
        let sim = SimulatedDevice::new();
        let stream = sim.create_stream(D0).unwrap();
        let src = sim.device_alloc(4, D0).unwrap();
        let mut dst = sim.host_alloc(8).unwrap();
        let err = sim
            .async_copy_device_to_host(&mut dst, &src, 8, &stream, D0)
            .unwrap_err();
        assert!(matches!(err, GqxError::CopyFailure(_)));
        assert_eq!(sim.stats().copies_enqueued, 0);
    }

    #[test]
    fn in_flight_failure_surfaces_at_drain() {
        let sim = SimulatedDevice::new();
        sim.inject_fault(Fault::CopyInFlight);
        let stream = sim.create_stream(D0).unwrap();
        let src = sim.device_alloc(4, D0).unwrap();
        let mut dst = sim.host_alloc(4).unwrap();
        sim.async_copy_device_to_host(&mut dst, &src, 4, &stream, D0)
            .unwrap();
        let err = sim.wait_for_stream(&stream, D0).unwrap_err();
        assert!(matches!(err, GqxError::SyncFailure { .. }));
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn double_free_is_counted() {
        let sim = SimulatedDevice::new();
        let buf = sim.host_alloc(4).unwrap();
        let twin = SimHostBuffer {
            id: buf.id,
            data: Arc::clone(&buf.data),
            pending: Arc::clone(&buf.pending),
        };
        sim.host_free(buf);
        sim.host_free(twin);
        let stats = sim.stats();
        assert_eq!(stats.host_frees, 1);
        assert_eq!(stats.double_frees, 1);
    }

    #[test]
    fn unknown_device_is_rejected() {
        let sim = SimulatedDevice::with_devices(2);
        assert!(sim.create_stream(DeviceId(1)).is_ok());
        assert!(sim.create_stream(DeviceId(2)).is_err());
        assert!(sim.device_alloc(4, DeviceId(5)).is_err());
    }
}
