use std::fmt;
use std::sync::Arc;

use embedinfer_core::{
    CorrelationId, DataType, Error, MemoryLocation, OutputBuffer, RequestedOutput,
    ResponseAllocator, Result, Tensor, TensorElement, LATEST_MODEL_VERSION,
};

/// Per-request options. Everything except `model_name` has a neutral default.
#[derive(Clone)]
pub struct InferOptions {
    pub model_name: String,
    /// `-1` lets the engine pick the version.
    pub model_version: i64,
    /// Echoed back in the response when non-empty.
    pub request_id: String,
    /// Integer correlation id; 0 means none. Mutually exclusive with
    /// `correlation_id_str`.
    pub correlation_id: u64,
    pub correlation_id_str: String,
    pub sequence_start: bool,
    pub sequence_end: bool,
    /// 0 uses the model's default priority; lower non-zero values win.
    pub priority: u64,
    /// Advisory engine timeout; 0 disables it.
    pub timeout_micros: u64,
    /// Output allocation strategy for this request, kept alive by the
    /// request and by every response it produces.
    pub allocator: Option<Arc<dyn ResponseAllocator>>,
}

impl InferOptions {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            model_version: LATEST_MODEL_VERSION,
            request_id: String::new(),
            correlation_id: 0,
            correlation_id_str: String::new(),
            sequence_start: false,
            sequence_end: false,
            priority: 0,
            timeout_micros: 0,
            allocator: None,
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.model_version = version;
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    pub fn with_correlation_id(mut self, id: u64) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn with_correlation_id_str(mut self, id: impl Into<String>) -> Self {
        self.correlation_id_str = id.into();
        self
    }

    pub fn with_sequence(mut self, start: bool, end: bool) -> Self {
        self.sequence_start = start;
        self.sequence_end = end;
        self
    }

    pub fn with_priority(mut self, priority: u64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_micros(mut self, timeout: u64) -> Self {
        self.timeout_micros = timeout;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn ResponseAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn correlation(&self) -> Result<CorrelationId> {
        match (self.correlation_id, self.correlation_id_str.is_empty()) {
            (0, true) => Ok(CorrelationId::None),
            (id, true) => Ok(CorrelationId::Uint(id)),
            (0, false) => Ok(CorrelationId::Str(self.correlation_id_str.clone())),
            (id, false) => Err(Error::invalid_argument(format!(
                "correlation id {id} and correlation id string '{}' are mutually exclusive",
                self.correlation_id_str
            ))),
        }
    }
}

impl fmt::Debug for InferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferOptions")
            .field("model_name", &self.model_name)
            .field("model_version", &self.model_version)
            .field("request_id", &self.request_id)
            .field("correlation_id", &self.correlation_id)
            .field("correlation_id_str", &self.correlation_id_str)
            .field("sequence_start", &self.sequence_start)
            .field("sequence_end", &self.sequence_end)
            .field("priority", &self.priority)
            .field("timeout_micros", &self.timeout_micros)
            .field("custom_allocator", &self.allocator.is_some())
            .finish()
    }
}

/// Inputs, requested outputs and options for one inference call.
///
/// A request is submitted at most once; [`InferRequest::reset`] clears the
/// tensors (keeping the options) so the object can be filled and submitted
/// again. Not safe to submit from several threads at once.
#[derive(Debug)]
pub struct InferRequest {
    options: InferOptions,
    correlation: CorrelationId,
    inputs: Vec<Tensor>,
    outputs: Vec<RequestedOutput>,
    submitted: bool,
}

impl InferRequest {
    pub fn new(options: InferOptions) -> Result<Self> {
        let correlation = options.correlation()?;
        Ok(Self {
            options,
            correlation,
            inputs: Vec::new(),
            outputs: Vec::new(),
            submitted: false,
        })
    }

    pub fn options(&self) -> &InferOptions {
        &self.options
    }

    pub fn model_name(&self) -> &str {
        &self.options.model_name
    }

    pub fn correlation(&self) -> &CorrelationId {
        &self.correlation
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&Tensor> {
        self.inputs.iter().find(|t| t.name == name)
    }

    pub fn outputs(&self) -> &[RequestedOutput] {
        &self.outputs
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.submitted {
            return Err(Error::invalid_argument(
                "request has already been submitted; reset it before reuse",
            ));
        }
        Ok(())
    }

    pub fn add_input(&mut self, input: Tensor) -> Result<()> {
        self.ensure_mutable()?;
        if input.name.is_empty() {
            return Err(Error::invalid_argument("input name must not be empty"));
        }
        if self.input(&input.name).is_some() {
            return Err(Error::invalid_argument(format!(
                "input '{}' has already been added",
                input.name
            )));
        }
        if input.byte_size() == 0 {
            return Err(Error::invalid_argument(format!(
                "input '{}' has a zero byte size",
                input.name
            )));
        }
        self.inputs.push(input);
        Ok(())
    }

    /// Adds typed elements. An empty `shape` is resolved from the model
    /// configuration at submission.
    pub fn add_input_slice<T: TensorElement>(
        &mut self,
        name: &str,
        values: &[T],
        shape: &[i64],
    ) -> Result<()> {
        self.add_input_elements(name, values, shape, None, None)
    }

    /// Like [`InferRequest::add_input_slice`], with the element type and
    /// memory location overridable. An overriding type must have the same
    /// element width as `T`, so FP16 data goes in as `u16` bit patterns.
    pub fn add_input_elements<T: TensorElement>(
        &mut self,
        name: &str,
        values: &[T],
        shape: &[i64],
        data_type: Option<DataType>,
        location: Option<MemoryLocation>,
    ) -> Result<()> {
        let mut tensor = Tensor::from_slice(name, values).with_shape(shape);
        if let Some(data_type) = data_type {
            if data_type.element_size() != Some(std::mem::size_of::<T>()) {
                return Err(Error::invalid_argument(format!(
                    "input '{name}' cannot hold {} elements as {data_type}",
                    T::DATA_TYPE
                )));
            }
            tensor = tensor.with_data_type(data_type);
        }
        if let Some(location) = location {
            tensor = tensor.with_location(location);
        }
        self.add_input(tensor)
    }

    /// Serializes `items` as a `BYTES` tensor owned by this request.
    pub fn add_input_strings<I, S>(&mut self, name: &str, items: I, shape: &[i64]) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.ensure_mutable()?;
        self.add_input(Tensor::from_strings(name, items)?.with_shape(shape))
    }

    /// Without any requested outputs the engine returns every output the
    /// model declares.
    pub fn add_output(&mut self, output: RequestedOutput) -> Result<()> {
        self.ensure_mutable()?;
        if output.name.is_empty() {
            return Err(Error::invalid_argument("output name must not be empty"));
        }
        if self.outputs.iter().any(|o| o.name == output.name) {
            return Err(Error::invalid_argument(format!(
                "output '{}' has already been requested",
                output.name
            )));
        }
        self.outputs.push(output);
        Ok(())
    }

    pub fn add_output_name(&mut self, name: &str) -> Result<()> {
        self.add_output(RequestedOutput::new(name))
    }

    /// Clears inputs and outputs; options stay as they are.
    pub fn reset(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
        self.submitted = false;
    }

    pub(crate) fn take_output_buffers(&mut self) -> Vec<(String, OutputBuffer)> {
        self.outputs
            .iter_mut()
            .filter_map(|o| {
                let location = o.location;
                o.buffer
                    .take()
                    .filter(|b| !b.is_empty())
                    .map(|b| (o.name.clone(), OutputBuffer::new(b, location)))
            })
            .collect()
    }

    pub(crate) fn restore_output_buffers(&mut self, buffers: Vec<(String, OutputBuffer)>) {
        for (name, buffer) in buffers {
            if let Some(output) = self.outputs.iter_mut().find(|o| o.name == name) {
                output.buffer = Some(buffer.data);
                output.location = buffer.location;
            }
        }
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.submitted = true;
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn request() -> InferRequest {
        InferRequest::new(InferOptions::new("simple")).unwrap()
    }

    #[test]
    fn duplicate_input_leaves_request_unchanged() {
        let mut req = request();
        req.add_input_slice("INPUT0", &[1i32, 2], &[2]).unwrap();
        let err = req.add_input_slice("INPUT0", &[3i32, 4, 5], &[3]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(req.inputs().len(), 1);
        assert_eq!(req.inputs()[0].byte_size(), 8);
    }

    #[test]
    fn zero_byte_input_is_rejected() {
        let mut req = request();
        let err = req.add_input(Tensor::new("x", Vec::new())).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(req.add_input_strings("s", Vec::<&str>::new(), &[]).is_err());
        assert!(req.inputs().is_empty());
    }

    #[test]
    fn string_input_is_encoded_and_owned() {
        let mut req = request();
        let owned = vec!["ab".to_string(), "c".to_string()];
        req.add_input_strings("TEXT", &owned, &[2]).unwrap();
        drop(owned);
        let t = req.input("TEXT").unwrap();
        assert_eq!(t.data_type, DataType::Bytes);
        assert_eq!(t.byte_size(), 4 + 2 + 4 + 1);
    }

    #[test]
    fn element_type_and_location_can_be_overridden() {
        let mut req = request();
        let half_ones = [0x3c00u16; 4];
        let gpu = Some(MemoryLocation::gpu(1));
        req.add_input_elements("H", &half_ones, &[4], Some(DataType::Fp16), gpu).unwrap();
        let t = req.input("H").unwrap();
        assert_eq!(t.data_type, DataType::Fp16);
        assert_eq!(t.location, MemoryLocation::gpu(1));
        assert_eq!(t.byte_size(), 8);
        t.check_consistency().unwrap();

        req.add_input_elements("P", &[1.0f32], &[1], None, Some(MemoryLocation::cpu_pinned()))
            .unwrap();
        assert_eq!(req.input("P").unwrap().data_type, DataType::Fp32);
    }

    #[test]
    fn overriding_type_must_match_element_width() {
        let mut req = request();
        let err = req
            .add_input_elements("H", &[1.0f32], &[1], Some(DataType::Fp16), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(req.add_input_elements("S", &[1u8], &[1], Some(DataType::Bytes), None).is_err());
        assert!(req.inputs().is_empty());
    }

    #[test]
    fn conflicting_correlation_ids_are_rejected() {
        let opts = InferOptions::new("m")
            .with_correlation_id(7)
            .with_correlation_id_str("seq-7");
        assert!(matches!(InferRequest::new(opts), Err(Error::InvalidArgument(_))));

        let req = InferRequest::new(InferOptions::new("m").with_correlation_id_str("s")).unwrap();
        assert_eq!(req.correlation(), &CorrelationId::Str("s".to_string()));
    }

    #[test]
    fn reset_clears_tensors_but_keeps_options() {
        let mut req = InferRequest::new(InferOptions::new("m").with_request_id("r1")).unwrap();
        req.add_input_slice("x", &[1.0f32], &[1]).unwrap();
        req.add_output_name("y").unwrap();
        req.mark_submitted();
        assert!(req.add_input_slice("z", &[1.0f32], &[1]).is_err());

        req.reset();
        assert!(req.inputs().is_empty());
        assert!(req.outputs().is_empty());
        assert!(!req.is_submitted());
        assert_eq!(req.options().request_id, "r1");
        req.add_input_slice("z", &[1.0f32], &[1]).unwrap();
    }

    #[test]
    fn duplicate_output_is_rejected() {
        let mut req = request();
        req.add_output_name("y").unwrap();
        assert!(req.add_output_name("y").is_err());
    }

    #[test]
    fn output_buffers_round_trip_through_take_and_restore() {
        let mut req = request();
        let hinted =
            RequestedOutput::new("y").with_buffer(BytesMut::zeroed(8), MemoryLocation::cpu());
        req.add_output(hinted).unwrap();
        req.add_output_name("z").unwrap();
        let taken = req.take_output_buffers();
        assert_eq!(taken.len(), 1);
        assert!(req.outputs()[0].buffer.is_none());
        req.restore_output_buffers(taken);
        assert_eq!(req.outputs()[0].buffer.as_ref().map(|b| b.len()), Some(8));
    }
}
