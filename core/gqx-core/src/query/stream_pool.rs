use dashmap::DashMap;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::Arc;

use crate::device::{DeviceId, DeviceRuntime};
use crate::error::GqxResult;

/// Stream owner key. `None` is the device's shared stream.
pub type StreamKey = (Option<u64>, DeviceId);

/// A runtime stream that is destroyed when its last holder drops it.
pub struct PooledStream<R: DeviceRuntime> {
    runtime: Arc<R>,
    stream: ManuallyDrop<R::Stream>,
    key: StreamKey,
}

impl<R: DeviceRuntime> PooledStream<R> {
    pub fn key(&self) -> StreamKey {
        self.key
    }
}

impl<R: DeviceRuntime> Deref for PooledStream<R> {
    type Target = R::Stream;

    fn deref(&self) -> &R::Stream {
        &self.stream
    }
}

impl<R: DeviceRuntime> Drop for PooledStream<R> {
    fn drop(&mut self) {
        // SAFETY: `stream` is never touched again after this point.
        let stream = unsafe { ManuallyDrop::take(&mut self.stream) };
        self.runtime.destroy_stream(stream);
        tracing::trace!(target: "gpu", query = ?self.key.0, device = %self.key.1, "stream destroyed");
    }
}

/// Registry of live streams, one per (query, device).
///
/// Queries with a dedicated stream never drain each other's work. The shared
/// stream of a device lives until it is released or the pool is dropped.
pub struct StreamPool<R: DeviceRuntime> {
    runtime: Arc<R>,
    streams: DashMap<StreamKey, Arc<PooledStream<R>>>,
}

impl<R: DeviceRuntime> StreamPool<R> {
    pub fn new(runtime: Arc<R>) -> Self {
        Self {
            runtime,
            streams: DashMap::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    /// Stream for `key`, created on first use.
    pub fn acquire(&self, key: StreamKey) -> GqxResult<Arc<PooledStream<R>>> {
        let entry = self.streams.entry(key).or_try_insert_with(|| {
            let stream = self.runtime.create_stream(key.1)?;
            tracing::debug!(target: "gpu", query = ?key.0, device = %key.1, "stream created");
            GqxResult::Ok(Arc::new(PooledStream {
                runtime: Arc::clone(&self.runtime),
                stream: ManuallyDrop::new(stream),
                key,
            }))
        })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Forget `key`. The stream is destroyed once every holder let go of it.
    pub fn release(&self, key: StreamKey) {
        self.streams.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
