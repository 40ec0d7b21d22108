//! Response allocator protocol.
//!
//! The engine asks for output memory through an [`AllocatorSession`], one per
//! inference call. The session serves pre-allocated buffers supplied with the
//! request first and routes everything else to the installed
//! [`ResponseAllocator`] strategy.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::{Error, MemoryLocation, Result};

/// Opaque per-buffer value handed back to `release`.
pub type BufferContext = Box<dyn Any + Send + Sync>;

#[derive(Clone, Copy, Debug)]
pub struct AllocationRequest<'a> {
    pub tensor_name: &'a str,
    pub byte_size: usize,
    pub preferred: MemoryLocation,
}

#[derive(Clone, Copy, Debug)]
pub struct StartContext<'a> {
    pub model_name: &'a str,
    pub request_id: &'a str,
}

/// Memory handed to the engine for one output. `location` is where the
/// buffer actually lives, which may differ from the preferred location.
pub struct OutputBuffer {
    pub data: BytesMut,
    pub context: Option<BufferContext>,
    pub location: MemoryLocation,
}

impl OutputBuffer {
    pub fn new(data: BytesMut, location: MemoryLocation) -> Self {
        Self {
            data,
            context: None,
            location,
        }
    }

    pub fn with_context(mut self, context: BufferContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("byte_size", &self.data.len())
            .field("has_context", &self.context.is_some())
            .field("location", &self.location)
            .finish()
    }
}

/// Output buffer allocation strategy. The engine may call into one instance
/// from several threads for distinct in-flight requests.
pub trait ResponseAllocator: Send + Sync {
    fn allocate(&self, request: &AllocationRequest<'_>) -> Result<OutputBuffer>;

    fn release(&self, buffer: OutputBuffer) -> Result<()>;

    /// Called once per response before its first allocation.
    fn start(&self, _ctx: &StartContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Host memory only, whatever the engine prefers.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuAllocator;

impl ResponseAllocator for CpuAllocator {
    fn allocate(&self, request: &AllocationRequest<'_>) -> Result<OutputBuffer> {
        trace!(
            tensor = request.tensor_name,
            byte_size = request.byte_size,
            preferred = %request.preferred,
            "allocating output in CPU memory"
        );
        Ok(OutputBuffer::new(
            BytesMut::zeroed(request.byte_size),
            MemoryLocation::cpu(),
        ))
    }

    fn release(&self, buffer: OutputBuffer) -> Result<()> {
        trace!(byte_size = buffer.byte_size(), "releasing CPU output");
        drop(buffer);
        Ok(())
    }
}

pub type AllocateFn = dyn Fn(&AllocationRequest<'_>) -> Result<OutputBuffer> + Send + Sync;
pub type ReleaseFn = dyn Fn(OutputBuffer) -> Result<()> + Send + Sync;
pub type StartFn = dyn Fn(&StartContext<'_>) -> Result<()> + Send + Sync;

/// A strategy assembled from optional callbacks. Any callback left unset
/// falls back to [`CpuAllocator`]; an unset start does nothing.
#[derive(Clone, Default)]
pub struct CustomAllocator {
    allocate: Option<Arc<AllocateFn>>,
    release: Option<Arc<ReleaseFn>>,
    start: Option<Arc<StartFn>>,
}

impl CustomAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allocate<F>(mut self, f: F) -> Self
    where
        F: Fn(&AllocationRequest<'_>) -> Result<OutputBuffer> + Send + Sync + 'static,
    {
        self.allocate = Some(Arc::new(f));
        self
    }

    pub fn with_release<F>(mut self, f: F) -> Self
    where
        F: Fn(OutputBuffer) -> Result<()> + Send + Sync + 'static,
    {
        self.release = Some(Arc::new(f));
        self
    }

    pub fn with_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&StartContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.start = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for CustomAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomAllocator")
            .field("allocate", &self.allocate.is_some())
            .field("release", &self.release.is_some())
            .field("start", &self.start.is_some())
            .finish()
    }
}

impl ResponseAllocator for CustomAllocator {
    fn allocate(&self, request: &AllocationRequest<'_>) -> Result<OutputBuffer> {
        match &self.allocate {
            Some(f) => f(request),
            None => CpuAllocator.allocate(request),
        }
    }

    fn release(&self, buffer: OutputBuffer) -> Result<()> {
        match &self.release {
            Some(f) => f(buffer),
            None => CpuAllocator.release(buffer),
        }
    }

    fn start(&self, ctx: &StartContext<'_>) -> Result<()> {
        match &self.start {
            Some(f) => f(ctx),
            None => Ok(()),
        }
    }
}

/// A buffer the engine writes one output into.
#[derive(Debug)]
pub struct AllocatedOutput {
    buffer: OutputBuffer,
    preallocated: bool,
}

impl AllocatedOutput {
    pub fn data(&self) -> &[u8] {
        &self.buffer.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.data
    }

    pub fn location(&self) -> MemoryLocation {
        self.buffer.location
    }

    pub fn is_preallocated(&self) -> bool {
        self.preallocated
    }
}

/// Per-call allocation state: the strategy in force plus any pre-allocated
/// destinations keyed by output name.
pub struct AllocatorSession {
    strategy: Arc<dyn ResponseAllocator>,
    preallocated: Mutex<HashMap<String, OutputBuffer>>,
    model_name: String,
    request_id: String,
}

impl AllocatorSession {
    pub fn new(strategy: Arc<dyn ResponseAllocator>) -> Self {
        Self {
            strategy,
            preallocated: Mutex::new(HashMap::new()),
            model_name: String::new(),
            request_id: String::new(),
        }
    }

    pub fn with_identity(mut self, model_name: &str, request_id: &str) -> Self {
        self.model_name = model_name.to_string();
        self.request_id = request_id.to_string();
        self
    }

    pub fn with_preallocated(
        self,
        tensor_name: impl Into<String>,
        data: BytesMut,
        location: MemoryLocation,
    ) -> Self {
        self.preallocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tensor_name.into(), OutputBuffer::new(data, location));
        self
    }

    pub fn start(&self) -> Result<()> {
        self.strategy.start(&StartContext {
            model_name: &self.model_name,
            request_id: &self.request_id,
        })
    }

    pub fn allocate(
        &self,
        tensor_name: &str,
        byte_size: usize,
        preferred: MemoryLocation,
    ) -> Result<AllocatedOutput> {
        let hint = self
            .preallocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tensor_name);

        if let Some(mut buffer) = hint {
            if buffer.data.len() < byte_size {
                return Err(Error::invalid_argument(format!(
                    "pre-allocated buffer for output '{tensor_name}' holds {} bytes, \
                     {byte_size} required",
                    buffer.data.len()
                )));
            }
            buffer.data.truncate(byte_size);
            debug!(tensor = tensor_name, byte_size, "using pre-allocated output buffer");
            return Ok(AllocatedOutput {
                buffer,
                preallocated: true,
            });
        }

        let mut buffer = self.strategy.allocate(&AllocationRequest {
            tensor_name,
            byte_size,
            preferred,
        })?;
        if buffer.data.len() < byte_size {
            let err = Error::engine(format!(
                "allocator returned {} bytes for output '{tensor_name}', {byte_size} required",
                buffer.data.len()
            ));
            if let Err(release_err) = self.strategy.release(buffer) {
                warn!(
                    tensor = tensor_name,
                    error = %release_err,
                    "failed to release undersized output buffer"
                );
            }
            return Err(err);
        }
        buffer.data.truncate(byte_size);
        Ok(AllocatedOutput {
            buffer,
            preallocated: false,
        })
    }

    /// Takes back every pre-allocated buffer the engine has not claimed.
    pub fn drain_preallocated(&self) -> Vec<(String, OutputBuffer)> {
        self.preallocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect()
    }

    /// Pre-allocated buffers belong to the caller and never reach the
    /// strategy's release.
    pub fn release(&self, output: AllocatedOutput) -> Result<()> {
        if output.preallocated {
            return Ok(());
        }
        self.strategy.release(output.buffer)
    }
}

impl fmt::Debug for AllocatorSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorSession")
            .field("model_name", &self.model_name)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn cpu_allocator_never_relocates() {
        let buf = CpuAllocator
            .allocate(&AllocationRequest {
                tensor_name: "y",
                byte_size: 16,
                preferred: MemoryLocation::gpu(1),
            })
            .unwrap();
        assert_eq!(buf.location, MemoryLocation::cpu());
        assert_eq!(buf.byte_size(), 16);
    }

    #[test]
    fn unset_callbacks_fall_back_to_cpu() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let alloc = CustomAllocator::new().with_release(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let session = AllocatorSession::new(Arc::new(alloc));
        session.start().unwrap();
        let out = session.allocate("y", 8, MemoryLocation::cpu()).unwrap();
        assert_eq!(out.data().len(), 8);
        session.release(out).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn custom_allocate_reports_actual_location() {
        let alloc = CustomAllocator::new().with_allocate(|req| {
            Ok(OutputBuffer::new(BytesMut::zeroed(req.byte_size), MemoryLocation::cpu_pinned())
                .with_context(Box::new(req.tensor_name.to_string())))
        });
        let session = AllocatorSession::new(Arc::new(alloc));
        let out = session.allocate("y", 4, MemoryLocation::gpu(0)).unwrap();
        assert_eq!(out.location(), MemoryLocation::cpu_pinned());
    }

    #[test]
    fn preallocated_buffer_is_used_and_not_released_to_strategy() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let alloc = CustomAllocator::new().with_release(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let session = AllocatorSession::new(Arc::new(alloc)).with_preallocated(
            "y",
            BytesMut::zeroed(32),
            MemoryLocation::cpu(),
        );
        let out = session.allocate("y", 12, MemoryLocation::cpu()).unwrap();
        assert!(out.is_preallocated());
        assert_eq!(out.data().len(), 12);
        session.release(out).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn undersized_preallocated_buffer_fails() {
        let session = AllocatorSession::new(Arc::new(CpuAllocator)).with_preallocated(
            "y",
            BytesMut::zeroed(2),
            MemoryLocation::cpu(),
        );
        let err = session.allocate("y", 4, MemoryLocation::cpu()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn undersized_strategy_buffer_is_released() {
        let allocated = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let (a, r) = (allocated.clone(), released.clone());
        let alloc = CustomAllocator::new()
            .with_allocate(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(OutputBuffer::new(BytesMut::zeroed(2), MemoryLocation::cpu()))
            })
            .with_release(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        let session = AllocatorSession::new(Arc::new(alloc));
        let err = session.allocate("y", 8, MemoryLocation::cpu()).unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
        assert_eq!(allocated.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_failure_keeps_the_allocation_error() {
        let alloc = CustomAllocator::new()
            .with_allocate(|_| Ok(OutputBuffer::new(BytesMut::zeroed(1), MemoryLocation::cpu())))
            .with_release(|_| Err(Error::engine("pool is gone")));
        let session = AllocatorSession::new(Arc::new(alloc));
        let err = session.allocate("y", 4, MemoryLocation::cpu()).unwrap_err();
        assert!(err.to_string().contains("1 bytes for output 'y'"));
    }

    #[test]
    fn failing_allocate_propagates() {
        let alloc = CustomAllocator::new()
            .with_allocate(|req| Err(Error::engine(format!("no memory for {}", req.tensor_name))));
        let session = AllocatorSession::new(Arc::new(alloc));
        assert!(session.allocate("y", 4, MemoryLocation::cpu()).is_err());
    }
}
