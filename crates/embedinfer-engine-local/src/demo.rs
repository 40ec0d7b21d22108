//! Small models that ship with the local engine.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use embedinfer_core::{
    decode_strings, encode_strings, DataType, Error, ModelConfig, ModelTensorConfig,
    ParameterValue, ResponseParameter, Result, Tensor,
};

use crate::engine::LocalEngine;
use crate::model::{find_input, LocalModel, ModelOutput};

/// Echoes input `i` back as `OUTPUT<i>`.
pub struct IdentityModel {
    config: ModelConfig,
}

impl IdentityModel {
    pub fn new(name: &str, data_type: DataType, dims: &[i64]) -> Self {
        Self {
            config: ModelConfig {
                name: name.to_string(),
                max_batch_size: 0,
                inputs: vec![ModelTensorConfig::new("INPUT0", data_type, dims)],
                outputs: vec![ModelTensorConfig::new("OUTPUT0", data_type, dims)],
            },
        }
    }
}

impl LocalModel for IdentityModel {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn execute(&self, inputs: &[Tensor]) -> Result<ModelOutput> {
        let outputs = inputs
            .iter()
            .enumerate()
            .map(|(i, t)| Tensor {
                name: format!("OUTPUT{i}"),
                ..t.clone()
            })
            .collect();
        Ok(ModelOutput::new(outputs))
    }
}

/// `OUTPUT0 = INPUT0 + INPUT1`, `OUTPUT1 = INPUT0 - INPUT1` over 16 INT32s.
pub struct AddSubModel {
    config: ModelConfig,
}

impl AddSubModel {
    pub const ELEMENTS: i64 = 16;

    pub fn new() -> Self {
        let dims = [Self::ELEMENTS];
        Self {
            config: ModelConfig {
                name: "add_sub".to_string(),
                max_batch_size: 0,
                inputs: vec![
                    ModelTensorConfig::new("INPUT0", DataType::Int32, &dims),
                    ModelTensorConfig::new("INPUT1", DataType::Int32, &dims),
                ],
                outputs: vec![
                    ModelTensorConfig::new("OUTPUT0", DataType::Int32, &dims),
                    ModelTensorConfig::new("OUTPUT1", DataType::Int32, &dims),
                ],
            },
        }
    }
}

impl Default for AddSubModel {
    fn default() -> Self {
        Self::new()
    }
}

fn int32_values(t: &Tensor) -> Result<Vec<i32>> {
    if t.data_type != DataType::Int32 || t.data.len() % 4 != 0 {
        return Err(Error::engine(format!(
            "input '{}' must be INT32, got {} with {} bytes",
            t.name,
            t.data_type,
            t.data.len()
        )));
    }
    Ok(t.data
        .chunks_exact(4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

impl LocalModel for AddSubModel {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn execute(&self, inputs: &[Tensor]) -> Result<ModelOutput> {
        let a = int32_values(find_input(inputs, "INPUT0")?)?;
        let b = int32_values(find_input(inputs, "INPUT1")?)?;
        if a.len() != b.len() {
            return Err(Error::engine(format!(
                "INPUT0 has {} elements, INPUT1 has {}",
                a.len(),
                b.len()
            )));
        }

        let mut sum = BytesMut::with_capacity(a.len() * 4);
        let mut diff = BytesMut::with_capacity(a.len() * 4);
        for (x, y) in a.iter().zip(&b) {
            sum.put_i32_le(x.wrapping_add(*y));
            diff.put_i32_le(x.wrapping_sub(*y));
        }
        let shape = [a.len() as i64];
        Ok(ModelOutput::new(vec![
            Tensor::new("OUTPUT0", sum.freeze())
                .with_data_type(DataType::Int32)
                .with_shape(shape),
            Tensor::new("OUTPUT1", diff.freeze())
                .with_data_type(DataType::Int32)
                .with_shape(shape),
        ]))
    }
}

/// Reverses every string element; declares a batch dimension.
pub struct StringReverseModel {
    config: ModelConfig,
}

impl StringReverseModel {
    pub fn new() -> Self {
        Self {
            config: ModelConfig {
                name: "string_reverse".to_string(),
                max_batch_size: 8,
                inputs: vec![ModelTensorConfig::new("INPUT0", DataType::Bytes, &[-1])],
                outputs: vec![ModelTensorConfig::new("OUTPUT0", DataType::Bytes, &[-1])],
            },
        }
    }
}

impl Default for StringReverseModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalModel for StringReverseModel {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn execute(&self, inputs: &[Tensor]) -> Result<ModelOutput> {
        let input = find_input(inputs, "INPUT0")?;
        let reversed: Vec<Vec<u8>> = decode_strings(&input.data)?
            .into_iter()
            .map(|el| match String::from_utf8(el) {
                Ok(s) => s.chars().rev().collect::<String>().into_bytes(),
                Err(e) => {
                    let mut raw = e.into_bytes();
                    raw.reverse();
                    raw
                }
            })
            .collect();
        let count = reversed.len() as i64;
        let output = Tensor::new("OUTPUT0", encode_strings(&reversed)?)
            .with_data_type(DataType::Bytes)
            .with_shape(input.shape.clone());
        Ok(ModelOutput::new(vec![output]).with_parameter(ResponseParameter {
            name: "element_count".to_string(),
            value: ParameterValue::Int(count),
        }))
    }
}

/// Registers `identity` (FP32), `add_sub` and `string_reverse`.
pub fn register_demo_models(engine: &LocalEngine) -> Result<()> {
    engine.register_model(Arc::new(IdentityModel::new("identity", DataType::Fp32, &[-1])))?;
    engine.register_model(Arc::new(AddSubModel::new()))?;
    engine.register_model(Arc::new(StringReverseModel::new()))?;
    Ok(())
}
