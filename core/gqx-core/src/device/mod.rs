//! Device runtime boundary: allocators, streams and device↔host copies.
//!
//! The executors never talk to a driver directly; they go through
//! [`DeviceRuntime`]. Two implementations exist:
//!
//! - [`SimulatedDevice`]: host-memory device with FIFO streams that execute
//!   at drain time. Always available; used as the test double.
//! - `CudaRuntime`: `cudarc` backend behind the `gpu` feature.
//!
//! Buffers handed out by the runtime are wrapped in scope guards
//! ([`ScopedHostBuffer`], [`DeviceAllocation`]) that return them to the
//! runtime exactly once, on every exit path.

mod guard;
pub mod sim;

#[cfg(feature = "gpu")]
pub mod cuda;

use crate::error::GqxResult;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use guard::{DeviceAllocation, ScopedHostBuffer};
pub use sim::{Fault, SimStats, SimulatedDevice};

#[cfg(feature = "gpu")]
pub use cuda::CudaRuntime;

/// Width in bytes of one index-vector entry (signed 32-bit row id).
pub const INDEX_WIDTH: usize = std::mem::size_of::<i32>();

/// Device ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// Driver surface the batch executors depend on.
///
/// Copies are asynchronous: `async_copy_device_to_host` only enqueues, and the
/// destination may be read only after `wait_for_stream` on the same stream has
/// returned `Ok`. Operations on one stream complete in enqueue order.
pub trait DeviceRuntime: Send + Sync {
    /// Device-resident allocation
    type DeviceBuf: Send + Sync;
    /// Pinned host allocation usable as an async copy target
    type HostBuf: Send;
    /// Ordered queue of asynchronous operations on one device
    type Stream: Send + Sync;

    fn name(&self) -> &'static str;

    fn create_stream(&self, device: DeviceId) -> GqxResult<Self::Stream>;

    fn destroy_stream(&self, stream: Self::Stream);

    fn device_alloc(&self, bytes: usize, device: DeviceId) -> GqxResult<Self::DeviceBuf>;

    fn device_free(&self, buf: Self::DeviceBuf);

    /// Synchronous host→device copy into a fresh allocation.
    fn upload(&self, data: &[u8], device: DeviceId) -> GqxResult<Self::DeviceBuf>;

    fn host_alloc(&self, bytes: usize) -> GqxResult<Self::HostBuf>;

    fn host_free(&self, buf: Self::HostBuf);

    /// Enqueue a copy of the first `bytes` of `src` into `dst`. Returns immediately.
    fn async_copy_device_to_host(
        &self,
        dst: &mut Self::HostBuf,
        src: &Self::DeviceBuf,
        bytes: usize,
        stream: &Self::Stream,
        device: DeviceId,
    ) -> GqxResult<()>;

    /// Block until every operation enqueued on `stream` has finished.
    /// Surfaces any fault raised by those operations.
    fn wait_for_stream(&self, stream: &Self::Stream, device: DeviceId) -> GqxResult<()>;

    /// Borrow the bytes of a host buffer.
    fn read_host<T>(&self, buf: &Self::HostBuf, f: impl FnOnce(&[u8]) -> T) -> GqxResult<T>;
}

/// Decode little-endian `i32` values.
pub fn decode_i32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Decode little-endian `i64` values.
pub fn decode_i64(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(c);
            i64::from_le_bytes(raw)
        })
        .collect()
}

/// Encode `i32` values as little-endian bytes.
pub fn encode_i32(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Encode `i64` values as little-endian bytes.
pub fn encode_i64(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
