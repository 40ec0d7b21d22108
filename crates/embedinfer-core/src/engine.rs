//! The boundary to the embedded inference engine.
//!
//! An engine hands out native request objects, runs them asynchronously and
//! reports completion through a callback invoked exactly once per request.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::{AllocatorSession, DataType, MemoryLocation, ModelConfig, RepositoryIndex, Result};

pub const REQUEST_FLAG_SEQUENCE_START: u32 = 1;
pub const REQUEST_FLAG_SEQUENCE_END: u32 = 1 << 1;

/// Engine version-selection policy sentinel.
pub const LATEST_MODEL_VERSION: i64 = -1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum CorrelationId {
    #[default]
    None,
    Uint(u64),
    Str(String),
}

impl CorrelationId {
    pub fn is_set(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Invoked once when the engine frees a native request.
pub type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Invoked once when a request completes, with the response or the reason
/// no response could be produced.
pub type CompletionCallback<R> = Box<dyn FnOnce(Result<R>) + Send + 'static>;

pub trait Engine: Send + Sync + 'static {
    type Request: NativeRequest;
    type Response: NativeResponse;

    fn name(&self) -> &'static str;

    /// Loads, or reloads, a model.
    fn load_model(&self, name: &str) -> Result<()>;

    /// Unloading a model that is not loaded succeeds.
    fn unload_model(&self, name: &str) -> Result<()>;

    fn model_index(&self) -> Result<Vec<RepositoryIndex>>;

    fn model_is_ready(&self, name: &str, version: i64) -> Result<bool>;

    fn model_config(&self, name: &str, version: i64) -> Result<ModelConfig>;

    /// Metrics in text exposition format.
    fn metrics(&self) -> Result<String>;

    fn new_request(&self, model: &str, version: i64) -> Result<Self::Request>;

    /// Takes ownership of `request`. A synchronous error means the engine
    /// has already dropped it and `on_complete` will never run.
    fn infer_async(
        &self,
        request: Self::Request,
        allocator: Arc<AllocatorSession>,
        on_complete: CompletionCallback<Self::Response>,
    ) -> Result<()>;
}

pub trait NativeRequest: Send + 'static {
    fn set_id(&mut self, id: &str) -> Result<()>;
    fn set_correlation_id(&mut self, id: CorrelationId) -> Result<()>;
    fn set_flags(&mut self, flags: u32) -> Result<()>;
    fn set_priority(&mut self, priority: u64) -> Result<()>;
    fn set_timeout_micros(&mut self, timeout: u64) -> Result<()>;
    fn set_release_callback(&mut self, callback: ReleaseCallback) -> Result<()>;
    fn add_input(&mut self, name: &str, data_type: DataType, shape: &[i64]) -> Result<()>;
    fn append_input_data(&mut self, name: &str, data: Bytes, location: MemoryLocation)
        -> Result<()>;
    fn add_requested_output(&mut self, name: &str) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl ParameterValue {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "BOOL",
            Self::Int(_) => "INT",
            Self::String(_) => "STRING",
            Self::Bytes(_) => "BYTES",
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResponseParameter {
    pub name: String,
    pub value: ParameterValue,
}

/// An output as the engine reports it; `data` points into response-owned
/// memory.
#[derive(Clone, Copy, Debug)]
pub struct RawOutput<'a> {
    pub name: &'a str,
    pub data_type: DataType,
    pub shape: &'a [i64],
    pub data: &'a [u8],
    pub location: MemoryLocation,
}

/// A completed response. Dropping it returns every output buffer to the
/// allocator session that produced it.
pub trait NativeResponse: Send + Sync + 'static {
    /// Set when the engine flagged the response itself as failed.
    fn error(&self) -> Option<String>;
    fn model(&self) -> (&str, i64);
    fn id(&self) -> &str;
    fn parameter_count(&self) -> usize;
    fn parameter(&self, index: usize) -> Result<ResponseParameter>;
    fn output_count(&self) -> usize;
    fn output(&self, index: usize) -> Result<RawOutput<'_>>;
}
