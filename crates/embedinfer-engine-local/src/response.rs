use std::sync::Arc;

use embedinfer_core::{
    AllocatedOutput, AllocatorSession, DataType, Error, MemoryLocation, NativeResponse, RawOutput,
    ResponseParameter, Result, Shape,
};
use tracing::warn;

use crate::stats::EngineStats;

struct ResponseOutput {
    name: String,
    data_type: DataType,
    shape: Shape,
    buffer: Option<AllocatedOutput>,
}

/// A completed response. Output memory comes from the request's allocator
/// session and goes back to it when the response is dropped.
pub struct LocalResponse {
    model: String,
    version: i64,
    id: String,
    error: Option<String>,
    parameters: Vec<ResponseParameter>,
    outputs: Vec<ResponseOutput>,
    session: Arc<AllocatorSession>,
    stats: Arc<EngineStats>,
}

impl LocalResponse {
    pub(crate) fn new(
        model: &str,
        version: i64,
        id: &str,
        session: Arc<AllocatorSession>,
        stats: Arc<EngineStats>,
    ) -> Self {
        stats.response_created();
        Self {
            model: model.to_string(),
            version,
            id: id.to_string(),
            error: None,
            parameters: Vec::new(),
            outputs: Vec::new(),
            session,
            stats,
        }
    }

    /// Marks the response failed. Outputs already written are released now.
    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.release_outputs();
    }

    pub(crate) fn set_parameters(&mut self, parameters: Vec<ResponseParameter>) {
        self.parameters = parameters;
    }

    /// Allocates through the session and copies `data` in.
    pub(crate) fn push_output(
        &mut self,
        name: &str,
        data_type: DataType,
        shape: &Shape,
        data: &[u8],
    ) -> Result<()> {
        let mut buffer = self
            .session
            .allocate(name, data.len(), MemoryLocation::cpu())?;
        buffer.data_mut()[..data.len()].copy_from_slice(data);
        self.outputs.push(ResponseOutput {
            name: name.to_string(),
            data_type,
            shape: shape.clone(),
            buffer: Some(buffer),
        });
        Ok(())
    }

    fn release_outputs(&mut self) {
        for output in self.outputs.drain(..) {
            let Some(buffer) = output.buffer else {
                continue;
            };
            if let Err(err) = self.session.release(buffer) {
                warn!(
                    model = %self.model,
                    output = %output.name,
                    error = %err,
                    "failed to release output buffer"
                );
            }
        }
    }
}

impl NativeResponse for LocalResponse {
    fn error(&self) -> Option<String> {
        self.error.clone()
    }

    fn model(&self) -> (&str, i64) {
        (&self.model, self.version)
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    fn parameter(&self, index: usize) -> Result<ResponseParameter> {
        self.parameters.get(index).cloned().ok_or_else(|| {
            Error::engine(format!(
                "parameter index {index} out of range ({} parameters)",
                self.parameters.len()
            ))
        })
    }

    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn output(&self, index: usize) -> Result<RawOutput<'_>> {
        let output = self.outputs.get(index).ok_or_else(|| {
            Error::engine(format!(
                "output index {index} out of range ({} outputs)",
                self.outputs.len()
            ))
        })?;
        let buffer = output
            .buffer
            .as_ref()
            .ok_or_else(|| Error::engine(format!("output '{}' was released", output.name)))?;
        Ok(RawOutput {
            name: &output.name,
            data_type: output.data_type,
            shape: output.shape.as_slice(),
            data: buffer.data(),
            location: buffer.location(),
        })
    }
}

impl Drop for LocalResponse {
    fn drop(&mut self) {
        self.release_outputs();
        self.stats.response_released();
    }
}
