use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use embedinfer_core::{
    AllocatorSession, CorrelationId, CpuAllocator, Engine, Error, ModelConfig, ModelReadyState,
    NativeRequest, NativeResponse, RepositoryIndex, ResponseAllocator, Result, Tensor,
    REQUEST_FLAG_SEQUENCE_END, REQUEST_FLAG_SEQUENCE_START,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::completion::{Completion, InferFuture};
use crate::registry::ResponseRegistry;
use crate::request::{InferOptions, InferRequest};
use crate::result::InferResult;

/// Drives an embedded engine: readiness checks, request submission and
/// result materialization.
///
/// Completed responses are retained until [`Server::clear_completed`] or
/// until the server is dropped, whichever comes first.
pub struct Server<E: Engine> {
    engine: E,
    registry: Arc<ResponseRegistry>,
    default_allocator: Arc<dyn ResponseAllocator>,
    live_requests: Arc<AtomicUsize>,
}

impl<E: Engine> Server<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            registry: Arc::new(ResponseRegistry::new()),
            default_allocator: Arc::new(CpuAllocator),
            live_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allocator used by requests that do not bring their own.
    pub fn with_default_allocator(mut self, allocator: Arc<dyn ResponseAllocator>) -> Self {
        self.default_allocator = allocator;
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn load_model(&self, name: &str) -> Result<()> {
        self.engine.load_model(name)?;
        info!(model = %name, engine = self.engine.name(), "model loaded");
        Ok(())
    }

    pub fn unload_model(&self, name: &str) -> Result<()> {
        self.engine.unload_model(name)?;
        info!(model = %name, engine = self.engine.name(), "model unloaded");
        Ok(())
    }

    pub fn model_index(&self) -> Result<Vec<RepositoryIndex>> {
        self.engine.model_index()
    }

    /// Names of the models the repository index reports as ready.
    pub fn loaded_models(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .engine
            .model_index()?
            .into_iter()
            .filter(|m| m.state == ModelReadyState::Ready)
            .map(|m| m.name)
            .collect())
    }

    pub fn model_config(&self, name: &str, version: i64) -> Result<ModelConfig> {
        self.engine.model_config(name, version)
    }

    pub fn metrics(&self) -> Result<String> {
        self.engine.metrics()
    }

    /// Native requests created by this server that the engine has not freed yet.
    pub fn live_requests(&self) -> usize {
        self.live_requests.load(Ordering::SeqCst)
    }

    pub fn completed_responses(&self) -> usize {
        self.registry.len()
    }

    /// Releases every retained response. Results still held by callers keep
    /// their own response alive.
    pub fn clear_completed(&self) -> usize {
        self.registry.clear_completed()
    }

    /// Submits `request` and returns a future for its result.
    ///
    /// Everything up to the engine accepting the request happens here and
    /// fails synchronously; any native request built on the way is freed
    /// before returning. After this returns `Ok`, errors arrive through the
    /// future only.
    pub fn async_infer(&self, request: &mut InferRequest) -> Result<InferFuture> {
        if request.is_submitted() {
            return Err(Error::invalid_argument(
                "request has already been submitted; reset it before reuse",
            ));
        }
        let options = request.options().clone();
        let model = options.model_name.as_str();
        let version = options.model_version;

        if !self.is_ready(model, version) {
            return Err(Error::ModelNotReady {
                model: model.to_string(),
                version,
            });
        }

        let inputs = self.resolve_inputs(model, version, request.inputs())?;

        let mut native = self.engine.new_request(model, version)?;
        self.live_requests.fetch_add(1, Ordering::SeqCst);
        let live = self.live_requests.clone();
        if let Err(err) = native.set_release_callback(Box::new(move || {
            live.fetch_sub(1, Ordering::SeqCst);
        })) {
            self.live_requests.fetch_sub(1, Ordering::SeqCst);
            return Err(err);
        }

        let correlation = request.correlation();
        if let Err(err) = configure(&mut native, &options, correlation, &inputs, request) {
            warn!(model = %model, error = %err, "failed to build native request");
            drop(native);
            return Err(err);
        }

        let strategy = options
            .allocator
            .clone()
            .unwrap_or_else(|| self.default_allocator.clone());
        let session = request.take_output_buffers().into_iter().fold(
            AllocatorSession::new(strategy).with_identity(model, &options.request_id),
            |session, (name, buffer)| session.with_preallocated(name, buffer.data, buffer.location),
        );
        let session = Arc::new(session);

        let (tx, rx) = oneshot::channel::<Completion>();
        let completion_model = model.to_string();
        let on_complete = Box::new(move |outcome: Result<E::Response>| {
            let outcome = outcome.map(|r| Arc::new(r) as Arc<dyn NativeResponse>);
            if tx.send(outcome).is_err() {
                debug!(model = %completion_model, "result future dropped before completion");
            }
        });

        if let Err(err) = self.engine.infer_async(native, session.clone(), on_complete) {
            warn!(model = %model, error = %err, "engine rejected request");
            request.restore_output_buffers(session.drain_preallocated());
            return Err(err);
        }

        request.mark_submitted();
        debug!(
            model = %model,
            version,
            id = %options.request_id,
            inputs = inputs.len(),
            "request submitted"
        );
        Ok(InferFuture::new(rx, self.registry.clone(), model.to_string()))
    }

    pub async fn infer(&self, request: &mut InferRequest) -> Result<InferResult> {
        self.async_infer(request)?.await
    }

    /// Runs `request` and copies every output out of the engine response.
    pub async fn infer_to_buffers(
        &self,
        request: &mut InferRequest,
    ) -> Result<HashMap<String, Bytes>> {
        let result = self.infer(request).await?.into_result()?;
        let mut buffers = HashMap::new();
        for name in result.output_names() {
            buffers.insert(name.to_string(), Bytes::copy_from_slice(result.raw_data(name)?));
        }
        Ok(buffers)
    }

    /// Builds a request from `inputs` and runs it.
    pub async fn infer_with(
        &self,
        options: InferOptions,
        inputs: Vec<Tensor>,
    ) -> Result<InferResult> {
        let mut request = InferRequest::new(options)?;
        for input in inputs {
            request.add_input(input)?;
        }
        self.infer(&mut request).await
    }

    fn is_ready(&self, model: &str, version: i64) -> bool {
        if model.is_empty() {
            return false;
        }
        match self.engine.model_is_ready(model, version) {
            Ok(ready) => ready,
            Err(err) => {
                debug!(model = %model, version, error = %err, "readiness query failed");
                false
            }
        }
    }

    /// Fills in type and shape from the model configuration where the
    /// caller left them unset. The configuration is fetched at most once.
    fn resolve_inputs(&self, model: &str, version: i64, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let mut config: Option<ModelConfig> = None;
        let mut resolved = Vec::with_capacity(inputs.len());
        for input in inputs {
            let mut tensor = input.clone();
            if tensor.needs_resolution() {
                if config.is_none() {
                    config = Some(self.engine.model_config(model, version).map_err(|e| {
                        Error::ConfigLookup {
                            model: model.to_string(),
                            input: tensor.name.clone(),
                            reason: e.to_string(),
                        }
                    })?);
                }
                if let Some(cfg) = &config {
                    let (data_type, shape) = cfg.resolve_input(&tensor.name)?;
                    if !tensor.data_type.is_resolved() {
                        tensor.data_type = data_type;
                    }
                    if tensor.shape.is_empty() {
                        tensor.shape = shape;
                    }
                }
            }
            tensor.check_consistency()?;
            resolved.push(tensor);
        }
        Ok(resolved)
    }
}

impl<E: Engine> Drop for Server<E> {
    fn drop(&mut self) {
        let released = self.registry.clear_completed();
        if released > 0 {
            debug!(released, "server dropped with retained responses");
        }
    }
}

fn configure<R: NativeRequest>(
    native: &mut R,
    options: &InferOptions,
    correlation: &CorrelationId,
    inputs: &[Tensor],
    request: &InferRequest,
) -> Result<()> {
    if !options.request_id.is_empty() {
        native.set_id(&options.request_id)?;
    }

    let mut flags = 0;
    if options.sequence_start {
        flags |= REQUEST_FLAG_SEQUENCE_START;
    }
    if options.sequence_end {
        flags |= REQUEST_FLAG_SEQUENCE_END;
    }
    if correlation.is_set() {
        native.set_correlation_id(correlation.clone())?;
        native.set_flags(flags)?;
    } else if flags != 0 {
        warn!(
            model = %options.model_name,
            "sequence flags ignored on a request without a correlation id"
        );
    }

    native.set_priority(options.priority)?;
    native.set_timeout_micros(options.timeout_micros)?;

    for input in inputs {
        native.add_input(&input.name, input.data_type, input.shape.as_slice())?;
        native.append_input_data(&input.name, input.data.clone(), input.location)?;
    }
    for output in request.outputs() {
        native.add_requested_output(&output.name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use embedinfer_core::{
        CompletionCallback, DataType, MemoryLocation, ModelTensorConfig, RawOutput,
        ReleaseCallback, ResponseParameter,
    };

    use super::*;

    /// What the engine saw on a native request when it was submitted.
    #[derive(Clone, Debug, Default, PartialEq)]
    struct Seen {
        id: Option<String>,
        correlation: CorrelationId,
        flags: Option<u32>,
        priority: u64,
        timeout_micros: u64,
        inputs: Vec<String>,
        outputs: Vec<String>,
    }

    #[derive(Default)]
    struct RecordingRequest {
        seen: Seen,
        release: Option<ReleaseCallback>,
    }

    impl Drop for RecordingRequest {
        fn drop(&mut self) {
            if let Some(release) = self.release.take() {
                release();
            }
        }
    }

    impl NativeRequest for RecordingRequest {
        fn set_id(&mut self, id: &str) -> Result<()> {
            self.seen.id = Some(id.to_string());
            Ok(())
        }

        fn set_correlation_id(&mut self, id: CorrelationId) -> Result<()> {
            self.seen.correlation = id;
            Ok(())
        }

        fn set_flags(&mut self, flags: u32) -> Result<()> {
            self.seen.flags = Some(flags);
            Ok(())
        }

        fn set_priority(&mut self, priority: u64) -> Result<()> {
            self.seen.priority = priority;
            Ok(())
        }

        fn set_timeout_micros(&mut self, timeout: u64) -> Result<()> {
            self.seen.timeout_micros = timeout;
            Ok(())
        }

        fn set_release_callback(&mut self, callback: ReleaseCallback) -> Result<()> {
            self.release = Some(callback);
            Ok(())
        }

        fn add_input(&mut self, name: &str, _: DataType, _: &[i64]) -> Result<()> {
            self.seen.inputs.push(name.to_string());
            Ok(())
        }

        fn append_input_data(&mut self, _: &str, _: Bytes, _: MemoryLocation) -> Result<()> {
            Ok(())
        }

        fn add_requested_output(&mut self, name: &str) -> Result<()> {
            self.seen.outputs.push(name.to_string());
            Ok(())
        }
    }

    struct NoResponse;

    impl NativeResponse for NoResponse {
        fn error(&self) -> Option<String> {
            None
        }
        fn model(&self) -> (&str, i64) {
            ("recorder", 1)
        }
        fn id(&self) -> &str {
            ""
        }
        fn parameter_count(&self) -> usize {
            0
        }
        fn parameter(&self, index: usize) -> Result<ResponseParameter> {
            Err(Error::engine(format!("no parameter {index}")))
        }
        fn output_count(&self) -> usize {
            0
        }
        fn output(&self, index: usize) -> Result<RawOutput<'_>> {
            Err(Error::engine(format!("no output {index}")))
        }
    }

    /// Keeps a copy of every submitted request and fails its completion.
    #[derive(Default)]
    struct RecordingEngine {
        submitted: Arc<Mutex<Vec<Seen>>>,
    }

    impl Engine for RecordingEngine {
        type Request = RecordingRequest;
        type Response = NoResponse;

        fn name(&self) -> &'static str {
            "recorder"
        }

        fn load_model(&self, _: &str) -> Result<()> {
            Ok(())
        }

        fn unload_model(&self, _: &str) -> Result<()> {
            Ok(())
        }

        fn model_index(&self) -> Result<Vec<RepositoryIndex>> {
            Ok(Vec::new())
        }

        fn model_is_ready(&self, _: &str, _: i64) -> Result<bool> {
            Ok(true)
        }

        fn model_config(&self, name: &str, _: i64) -> Result<ModelConfig> {
            Ok(ModelConfig {
                name: name.to_string(),
                max_batch_size: 0,
                inputs: vec![ModelTensorConfig::new("INPUT0", DataType::Fp32, &[2])],
                outputs: vec![ModelTensorConfig::new("OUTPUT0", DataType::Fp32, &[2])],
            })
        }

        fn metrics(&self) -> Result<String> {
            Ok(String::new())
        }

        fn new_request(&self, _: &str, _: i64) -> Result<RecordingRequest> {
            Ok(RecordingRequest::default())
        }

        fn infer_async(
            &self,
            request: RecordingRequest,
            _: Arc<AllocatorSession>,
            on_complete: CompletionCallback<NoResponse>,
        ) -> Result<()> {
            self.submitted.lock().unwrap().push(request.seen.clone());
            drop(request);
            on_complete(Err(Error::engine("recorded only")));
            Ok(())
        }
    }

    fn submit(options: InferOptions) -> Seen {
        let server = Server::new(RecordingEngine::default());
        let mut request = InferRequest::new(options).unwrap();
        request.add_input_slice("INPUT0", &[1.0f32, 2.0], &[]).unwrap();
        request.add_output_name("OUTPUT0").unwrap();

        let future = server.async_infer(&mut request).unwrap();
        assert!(future.wait().is_err());
        assert_eq!(server.live_requests(), 0);

        let mut submitted = server.engine().submitted.lock().unwrap();
        submitted.pop().unwrap()
    }

    #[test]
    fn integer_correlation_and_request_options_reach_the_engine() {
        let seen = submit(
            InferOptions::new("recorder")
                .with_request_id("r-1")
                .with_correlation_id(7)
                .with_sequence(true, false)
                .with_priority(3)
                .with_timeout_micros(500),
        );
        assert_eq!(
            seen,
            Seen {
                id: Some("r-1".to_string()),
                correlation: CorrelationId::Uint(7),
                flags: Some(REQUEST_FLAG_SEQUENCE_START),
                priority: 3,
                timeout_micros: 500,
                inputs: vec!["INPUT0".to_string()],
                outputs: vec!["OUTPUT0".to_string()],
            }
        );
    }

    #[test]
    fn string_correlation_carries_both_sequence_flags() {
        let seen = submit(
            InferOptions::new("recorder")
                .with_correlation_id_str("session-a")
                .with_sequence(true, true),
        );
        assert_eq!(seen.correlation, CorrelationId::Str("session-a".to_string()));
        assert_eq!(
            seen.flags,
            Some(REQUEST_FLAG_SEQUENCE_START | REQUEST_FLAG_SEQUENCE_END)
        );
        assert_eq!(seen.id, None);
    }

    #[test]
    fn correlation_without_sequence_sets_empty_flags() {
        let seen = submit(InferOptions::new("recorder").with_correlation_id(9));
        assert_eq!(seen.correlation, CorrelationId::Uint(9));
        assert_eq!(seen.flags, Some(0));
    }

    #[test]
    fn sequence_flags_need_a_correlation_id() {
        let seen = submit(InferOptions::new("recorder").with_sequence(true, true));
        assert_eq!(seen.correlation, CorrelationId::None);
        assert_eq!(seen.flags, None);
        assert_eq!(seen.priority, 0);
        assert_eq!(seen.timeout_micros, 0);
    }
}
