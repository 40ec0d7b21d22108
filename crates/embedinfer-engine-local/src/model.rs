use embedinfer_core::{Error, ModelConfig, ResponseParameter, Result, Tensor};

/// What one execution produced.
#[derive(Clone, Debug, Default)]
pub struct ModelOutput {
    pub outputs: Vec<Tensor>,
    pub parameters: Vec<ResponseParameter>,
}

impl ModelOutput {
    pub fn new(outputs: Vec<Tensor>) -> Self {
        Self {
            outputs,
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ResponseParameter) -> Self {
        self.parameters.push(parameter);
        self
    }
}

/// Object-safe model interface.
/// Keep it synchronous; the worker thread calls it directly.
pub trait LocalModel: Send + Sync {
    fn config(&self) -> &ModelConfig;

    /// Inputs arrive with type and shape resolved, in the order they were
    /// added to the request.
    fn execute(&self, inputs: &[Tensor]) -> Result<ModelOutput>;
}

pub fn find_input<'a>(inputs: &'a [Tensor], name: &str) -> Result<&'a Tensor> {
    inputs
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| Error::engine(format!("missing input '{name}'")))
}
