use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{DataType, Error, Result, Shape};

/// One `input`/`output` entry of a model configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTensorConfig {
    pub name: String,
    /// Configuration spelling, e.g. `TYPE_FP32`.
    pub data_type: String,
    #[serde(default)]
    pub dims: Vec<i64>,
}

impl ModelTensorConfig {
    pub fn new(name: impl Into<String>, data_type: DataType, dims: &[i64]) -> Self {
        let data_type = match data_type {
            DataType::Bytes => "TYPE_STRING".to_string(),
            other => format!("TYPE_{}", other.as_str()),
        };
        Self {
            name: name.into(),
            data_type,
            dims: dims.to_vec(),
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        DataType::from_config_str(&self.data_type)
    }
}

/// The parts of a model configuration this layer consults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Zero means the model declares no batching dimension.
    #[serde(default)]
    pub max_batch_size: i64,
    #[serde(default, rename = "input")]
    pub inputs: Vec<ModelTensorConfig>,
    #[serde(default, rename = "output")]
    pub outputs: Vec<ModelTensorConfig>,
}

impl ModelConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(format!("model config: {e}")))
    }

    pub fn input(&self, name: &str) -> Option<&ModelTensorConfig> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&ModelTensorConfig> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn supports_batching(&self) -> bool {
        self.max_batch_size > 0
    }

    /// Declared type and full shape of an input, with a leading batch
    /// dimension of 1 when the model batches.
    pub fn resolve_input(&self, input: &str) -> Result<(DataType, Shape)> {
        let lookup_err = |reason: String| Error::ConfigLookup {
            model: self.name.clone(),
            input: input.to_string(),
            reason,
        };
        let cfg = self
            .input(input)
            .ok_or_else(|| lookup_err("input is not declared by the model".to_string()))?;
        let dtype = cfg
            .data_type()
            .ok_or_else(|| lookup_err(format!("unrecognized data type '{}'", cfg.data_type)))?;

        let mut dims = Vec::with_capacity(cfg.dims.len() + 1);
        if self.supports_batching() {
            dims.push(1);
        }
        dims.extend_from_slice(&cfg.dims);
        Ok((dtype, Shape::from(dims)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelReadyState {
    Unknown,
    Ready,
    Unavailable,
    Loading,
    Unloading,
}

impl ModelReadyState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Ready => "READY",
            Self::Unavailable => "UNAVAILABLE",
            Self::Loading => "LOADING",
            Self::Unloading => "UNLOADING",
        }
    }
}

impl fmt::Display for ModelReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelReadyState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "UNKNOWN" => Self::Unknown,
            "READY" => Self::Ready,
            "UNAVAILABLE" => Self::Unavailable,
            "LOADING" => Self::Loading,
            "UNLOADING" => Self::Unloading,
            other => return Err(Error::invalid_argument(format!("unknown model state '{other}'"))),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryIndex {
    pub name: String,
    pub version: String,
    pub state: ModelReadyState,
}
