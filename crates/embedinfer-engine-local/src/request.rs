use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use embedinfer_core::{
    CorrelationId, DataType, Error, MemoryLocation, ModelConfig, NativeRequest, ReleaseCallback,
    Result, Shape, Tensor,
};
use tracing::trace;

use crate::stats::EngineStats;

#[derive(Debug)]
struct InputSlot {
    name: String,
    data_type: DataType,
    shape: Shape,
    chunks: Vec<Bytes>,
    location: MemoryLocation,
}

/// A native request owned by [`crate::LocalEngine`]. Dropping it fires the
/// release callback, on every path.
pub struct LocalRequest {
    pub(crate) model: String,
    pub(crate) version: i64,
    pub(crate) id: String,
    pub(crate) correlation: CorrelationId,
    pub(crate) flags: u32,
    pub(crate) priority: u64,
    pub(crate) timeout_micros: u64,
    pub(crate) requested_outputs: Vec<String>,
    inputs: Vec<InputSlot>,
    config: Arc<ModelConfig>,
    release: Option<ReleaseCallback>,
    stats: Arc<EngineStats>,
}

impl LocalRequest {
    pub(crate) fn new(
        model: &str,
        version: i64,
        config: Arc<ModelConfig>,
        stats: Arc<EngineStats>,
    ) -> Self {
        stats.request_created();
        Self {
            model: model.to_string(),
            version,
            id: String::new(),
            correlation: CorrelationId::None,
            flags: 0,
            priority: 0,
            timeout_micros: 0,
            requested_outputs: Vec::new(),
            inputs: Vec::new(),
            config,
            release: None,
            stats,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Joins the appended chunks of every input into one tensor each.
    pub(crate) fn take_inputs(&mut self) -> Vec<Tensor> {
        self.inputs
            .drain(..)
            .map(|slot| {
                let data = match slot.chunks.len() {
                    1 => slot.chunks.into_iter().next().unwrap_or_default(),
                    _ => {
                        let mut joined = BytesMut::new();
                        for chunk in &slot.chunks {
                            joined.extend_from_slice(chunk);
                        }
                        joined.freeze()
                    }
                };
                Tensor::new(slot.name, data)
                    .with_data_type(slot.data_type)
                    .with_shape(slot.shape)
                    .with_location(slot.location)
            })
            .collect()
    }
}

impl NativeRequest for LocalRequest {
    fn set_id(&mut self, id: &str) -> Result<()> {
        self.id = id.to_string();
        Ok(())
    }

    fn set_correlation_id(&mut self, id: CorrelationId) -> Result<()> {
        self.correlation = id;
        Ok(())
    }

    fn set_flags(&mut self, flags: u32) -> Result<()> {
        self.flags = flags;
        Ok(())
    }

    fn set_priority(&mut self, priority: u64) -> Result<()> {
        self.priority = priority;
        Ok(())
    }

    fn set_timeout_micros(&mut self, timeout: u64) -> Result<()> {
        self.timeout_micros = timeout;
        Ok(())
    }

    fn set_release_callback(&mut self, callback: ReleaseCallback) -> Result<()> {
        self.release = Some(callback);
        Ok(())
    }

    fn add_input(&mut self, name: &str, data_type: DataType, shape: &[i64]) -> Result<()> {
        if !self.config.inputs.is_empty() && self.config.input(name).is_none() {
            return Err(Error::engine(format!(
                "unexpected inference input '{name}' for model '{}'",
                self.model
            )));
        }
        if self.inputs.iter().any(|s| s.name == name) {
            return Err(Error::engine(format!("input '{name}' already exists in request")));
        }
        self.inputs.push(InputSlot {
            name: name.to_string(),
            data_type,
            shape: Shape::from_slice(shape),
            chunks: Vec::new(),
            location: MemoryLocation::cpu(),
        });
        Ok(())
    }

    fn append_input_data(
        &mut self,
        name: &str,
        data: Bytes,
        location: MemoryLocation,
    ) -> Result<()> {
        let slot = self
            .inputs
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::engine(format!("input '{name}' has not been added")))?;
        trace!(input = name, byte_size = data.len(), %location, "appending input data");
        slot.location = location;
        slot.chunks.push(data);
        Ok(())
    }

    fn add_requested_output(&mut self, name: &str) -> Result<()> {
        if self.requested_outputs.iter().any(|o| o == name) {
            return Err(Error::engine(format!("output '{name}' already requested")));
        }
        self.requested_outputs.push(name.to_string());
        Ok(())
    }
}

impl Drop for LocalRequest {
    fn drop(&mut self) {
        self.stats.request_released();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn config() -> Arc<ModelConfig> {
        Arc::new(ModelConfig {
            name: "m".to_string(),
            max_batch_size: 0,
            inputs: vec![embedinfer_core::ModelTensorConfig::new("x", DataType::Uint8, &[-1])],
            outputs: Vec::new(),
        })
    }

    #[test]
    fn release_callback_fires_once_on_drop() {
        let stats = Arc::new(EngineStats::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut req = LocalRequest::new("m", 1, config(), stats.clone());
        req.set_release_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        drop(req);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().live_requests(), 0);
    }

    #[test]
    fn unknown_and_duplicate_inputs_are_rejected() {
        let mut req = LocalRequest::new("m", 1, config(), Arc::new(EngineStats::default()));
        assert!(req.add_input("nope", DataType::Uint8, &[1]).is_err());
        req.add_input("x", DataType::Uint8, &[2]).unwrap();
        assert!(req.add_input("x", DataType::Uint8, &[2]).is_err());
        assert!(req
            .append_input_data("y", Bytes::from_static(b"a"), MemoryLocation::cpu())
            .is_err());
    }

    #[test]
    fn chunks_are_joined() {
        let mut req = LocalRequest::new("m", 1, config(), Arc::new(EngineStats::default()));
        req.add_input("x", DataType::Uint8, &[3]).unwrap();
        req.append_input_data("x", Bytes::from_static(b"ab"), MemoryLocation::cpu()).unwrap();
        req.append_input_data("x", Bytes::from_static(b"c"), MemoryLocation::cpu()).unwrap();
        let inputs = req.take_inputs();
        assert_eq!(&inputs[0].data[..], b"abc");
        assert_eq!(inputs[0].shape.as_slice(), &[3]);
    }
}
