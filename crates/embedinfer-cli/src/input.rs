use anyhow::{bail, Context, Result};
use embedinfer_core::{DataType, ModelConfig, Tensor};

/// Splits `NAME=v1,v2,...`.
pub fn split_input(raw: &str) -> Result<(&str, &str)> {
    let (name, values) = raw
        .split_once('=')
        .with_context(|| format!("input '{raw}' is not NAME=VALUES"))?;
    if name.is_empty() {
        bail!("input '{raw}' has an empty name");
    }
    Ok((name, values))
}

/// Builds a tensor from comma-separated values, typed by the model's
/// declared input. Variable dimensions absorb the element count.
pub fn parse_input(config: &ModelConfig, raw: &str) -> Result<Tensor> {
    let (name, values) = split_input(raw)?;
    let declared = config
        .input(name)
        .with_context(|| format!("model '{}' has no input named '{name}'", config.name))?;
    let data_type = declared
        .data_type()
        .with_context(|| format!("input '{name}' has unsupported type {}", declared.data_type))?;
    let items: Vec<&str> = if values.is_empty() {
        Vec::new()
    } else {
        values.split(',').collect()
    };

    let tensor = match data_type {
        DataType::Bytes => Tensor::from_strings(name, &items)?,
        DataType::Bool => Tensor::from_slice(name, &parse_all::<bool>(name, &items)?),
        DataType::Uint8 => Tensor::from_slice(name, &parse_all::<u8>(name, &items)?),
        DataType::Uint16 => Tensor::from_slice(name, &parse_all::<u16>(name, &items)?),
        DataType::Uint32 => Tensor::from_slice(name, &parse_all::<u32>(name, &items)?),
        DataType::Uint64 => Tensor::from_slice(name, &parse_all::<u64>(name, &items)?),
        DataType::Int8 => Tensor::from_slice(name, &parse_all::<i8>(name, &items)?),
        DataType::Int16 => Tensor::from_slice(name, &parse_all::<i16>(name, &items)?),
        DataType::Int32 => Tensor::from_slice(name, &parse_all::<i32>(name, &items)?),
        DataType::Int64 => Tensor::from_slice(name, &parse_all::<i64>(name, &items)?),
        DataType::Fp32 => Tensor::from_slice(name, &parse_all::<f32>(name, &items)?),
        DataType::Fp64 => Tensor::from_slice(name, &parse_all::<f64>(name, &items)?),
        other => bail!("input '{name}' has type {other}, which the CLI cannot parse"),
    };

    Ok(tensor.with_shape(shape_for(config, &declared.dims, items.len())))
}

fn parse_all<T>(name: &str, items: &[&str]) -> Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    items
        .iter()
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("input '{name}': cannot parse '{v}': {e}"))
        })
        .collect()
}

fn shape_for(config: &ModelConfig, dims: &[i64], count: usize) -> Vec<i64> {
    let fixed: i64 = dims.iter().filter(|d| **d >= 0).product();
    let mut filled = false;
    let mut shape: Vec<i64> = dims
        .iter()
        .map(|&d| match d {
            d if d >= 0 => d,
            _ if !filled => {
                filled = true;
                count as i64 / fixed.max(1)
            }
            _ => 1,
        })
        .collect();
    if shape.is_empty() {
        shape.push(count as i64);
    }
    if config.supports_batching() {
        shape.insert(0, 1);
    }
    shape
}

#[cfg(test)]
mod tests {
    use embedinfer_core::ModelTensorConfig;

    use super::*;

    fn config(max_batch_size: i64, data_type: DataType, dims: &[i64]) -> ModelConfig {
        ModelConfig {
            name: "m".to_string(),
            max_batch_size,
            inputs: vec![ModelTensorConfig::new("INPUT0", data_type, dims)],
            outputs: Vec::new(),
        }
    }

    #[test]
    fn parses_typed_values() {
        let tensor = parse_input(&config(0, DataType::Int32, &[4]), "INPUT0=1,2,3,4").unwrap();
        assert_eq!(tensor.data_type, DataType::Int32);
        assert_eq!(tensor.shape.as_slice(), &[4]);
        assert_eq!(tensor.byte_size(), 16);
    }

    #[test]
    fn variable_dimension_takes_the_count() {
        let tensor = parse_input(&config(8, DataType::Bytes, &[-1]), "INPUT0=ab,c,def").unwrap();
        assert_eq!(tensor.shape.as_slice(), &[1, 3]);
        tensor.check_consistency().unwrap();
    }

    #[test]
    fn rejects_unknown_input_and_bad_values() {
        let cfg = config(0, DataType::Fp32, &[-1]);
        assert!(parse_input(&cfg, "OTHER=1").is_err());
        assert!(parse_input(&cfg, "INPUT0=1,x").is_err());
        assert!(parse_input(&cfg, "INPUT0").is_err());
    }
}
