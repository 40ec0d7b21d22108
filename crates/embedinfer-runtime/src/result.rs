use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use embedinfer_core::{
    decode_utf8_strings, DataType, Error, MemoryLocation, NativeResponse, ParameterValue,
    ResponseParameter, Result, Shape, Tensor,
};
use serde_json::{json, Map, Value};

#[derive(Clone, Debug)]
struct OutputEntry {
    data_type: DataType,
    shape: Shape,
    location: MemoryLocation,
    /// Position in the engine's output list.
    index: usize,
}

/// A borrowed output. The bytes live in the engine response, which the
/// owning [`InferResult`] keeps alive; call [`OutputView::to_tensor`] to
/// hold on to the data past the result.
#[derive(Clone, Copy, Debug)]
pub struct OutputView<'a> {
    pub name: &'a str,
    pub data_type: DataType,
    pub shape: &'a [i64],
    pub data: &'a [u8],
    pub location: MemoryLocation,
}

impl OutputView<'_> {
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn to_tensor(&self) -> Tensor {
        Tensor::new(self.name, Bytes::copy_from_slice(self.data))
            .with_data_type(self.data_type)
            .with_shape(self.shape)
            .with_location(self.location)
    }
}

/// The structured outcome of one inference call.
pub struct InferResult {
    model_name: String,
    model_version: i64,
    id: String,
    parameters: Vec<ResponseParameter>,
    outputs: BTreeMap<String, OutputEntry>,
    error: Option<Error>,
    response: Option<Arc<dyn NativeResponse>>,
}

impl InferResult {
    /// Builds a result from a completed engine response. A response-level
    /// error yields a failed result with no outputs; a malformed response
    /// (bad parameter or output index) is an `Err`.
    pub(crate) fn materialize(response: Arc<dyn NativeResponse>) -> Result<Self> {
        let (model_name, model_version) = {
            let (name, version) = response.model();
            (name.to_string(), version)
        };
        let id = response.id().to_string();

        if let Some(message) = response.error() {
            return Ok(Self {
                model_name,
                model_version,
                id,
                parameters: Vec::new(),
                outputs: BTreeMap::new(),
                error: Some(Error::Response(message)),
                response: None,
            });
        }

        let mut parameters = Vec::with_capacity(response.parameter_count());
        for idx in 0..response.parameter_count() {
            let param = response.parameter(idx)?;
            if let ParameterValue::Bytes(_) = param.value {
                return Err(Error::UnsupportedParameterType(param.name));
            }
            parameters.push(param);
        }

        let mut outputs = BTreeMap::new();
        for index in 0..response.output_count() {
            let raw = response.output(index)?;
            outputs.insert(
                raw.name.to_string(),
                OutputEntry {
                    data_type: raw.data_type,
                    shape: Shape::from_slice(raw.shape),
                    location: raw.location,
                    index,
                },
            );
        }

        Ok(Self {
            model_name,
            model_version,
            id,
            parameters,
            outputs,
            error: None,
            response: Some(response),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn model_version(&self) -> String {
        self.model_version.to_string()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parameters(&self) -> &[ResponseParameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    pub fn output(&self, name: &str) -> Result<OutputView<'_>> {
        let missing = || Error::invalid_argument(format!("result has no output named '{name}'"));
        let entry = self.outputs.get(name).ok_or_else(missing)?;
        let response = self.response.as_ref().ok_or_else(missing)?;
        let raw = response.output(entry.index)?;
        Ok(OutputView {
            name: raw.name,
            data_type: entry.data_type,
            shape: raw.shape,
            data: raw.data,
            location: entry.location,
        })
    }

    pub fn shape(&self, name: &str) -> Result<&[i64]> {
        self.outputs
            .get(name)
            .map(|e| e.shape.as_slice())
            .ok_or_else(|| Error::invalid_argument(format!("result has no output named '{name}'")))
    }

    pub fn data_type(&self, name: &str) -> Result<DataType> {
        self.outputs
            .get(name)
            .map(|e| e.data_type)
            .ok_or_else(|| Error::invalid_argument(format!("result has no output named '{name}'")))
    }

    pub fn raw_data(&self, name: &str) -> Result<&[u8]> {
        Ok(self.output(name)?.data)
    }

    pub fn string_data(&self, name: &str) -> Result<Vec<String>> {
        let view = self.output(name)?;
        if view.data_type != DataType::Bytes {
            return Err(Error::invalid_argument(format!(
                "output '{name}' has data type {}, string data requires BYTES",
                view.data_type
            )));
        }
        decode_utf8_strings(view.data)
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Turns a failed result into its error.
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Empty when the request succeeded.
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    /// Diagnostic JSON. Not a stable format.
    pub fn debug_string(&self) -> String {
        let mut doc = Map::new();
        if !self.id.is_empty() {
            doc.insert("id".to_string(), Value::from(self.id.clone()));
        }
        doc.insert("model_name".to_string(), Value::from(self.model_name.clone()));
        doc.insert("model_version".to_string(), Value::from(self.model_version()));

        if !self.parameters.is_empty() {
            let params: Map<String, Value> = self
                .parameters
                .iter()
                .map(|p| {
                    let value = match &p.value {
                        ParameterValue::Bool(v) => Value::from(*v),
                        ParameterValue::Int(v) => Value::from(*v),
                        ParameterValue::String(v) => Value::from(v.clone()),
                        ParameterValue::Bytes(v) => Value::from(format!("<{} bytes>", v.len())),
                    };
                    (p.name.clone(), value)
                })
                .collect();
            doc.insert("parameters".to_string(), Value::Object(params));
        }

        let outputs: Vec<Value> = self
            .outputs
            .iter()
            .map(|(name, e)| {
                json!({
                    "name": name,
                    "datatype": e.data_type.as_str(),
                    "shape": e.shape.as_slice(),
                })
            })
            .collect();
        doc.insert("outputs".to_string(), Value::Array(outputs));

        Value::Object(doc).to_string()
    }
}

impl fmt::Debug for InferResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferResult")
            .field("model_name", &self.model_name)
            .field("model_version", &self.model_version)
            .field("id", &self.id)
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .field("error", &self.error)
            .finish()
    }
}
