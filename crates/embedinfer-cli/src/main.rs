mod cli;
mod input;
mod logging;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use embedinfer_core::{DataType, ServerOptions};
use embedinfer_engine_local::{register_demo_models, LocalEngine};
use embedinfer_runtime::{InferOptions, InferRequest, InferResult, Server};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut options = match &cli.config {
        Some(path) => ServerOptions::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ServerOptions::default(),
    };
    if let Some(workers) = cli.workers {
        options.worker_threads = workers;
        options.validate()?;
    }
    logging::init(&options.logging, cli.log.as_deref())?;

    let engine = LocalEngine::new(options)?;
    register_demo_models(&engine)?;
    let server = Server::new(engine);
    info!(
        models = ?server.loaded_models()?,
        "embedinfer ready"
    );

    match cli.command {
        Command::Index => print_index(&server),
        Command::Metrics => {
            print!("{}", server.metrics()?);
            Ok(())
        }
        Command::Load { model } => {
            server.load_model(&model)?;
            print_index(&server)
        }
        Command::Infer {
            model,
            version,
            id,
            inputs,
            outputs,
        } => infer(&server, model, version, id, &inputs, &outputs).await,
    }
}

fn print_index(server: &Server<LocalEngine>) -> Result<()> {
    for entry in server.model_index()? {
        println!("{}\t{}\t{}", entry.name, entry.version, entry.state);
    }
    Ok(())
}

async fn infer(
    server: &Server<LocalEngine>,
    model: String,
    version: i64,
    id: String,
    inputs: &[String],
    outputs: &[String],
) -> Result<()> {
    let config = server
        .model_config(&model, version)
        .with_context(|| format!("no configuration for model '{model}'"))?;

    let options = InferOptions::new(model).with_version(version).with_request_id(id);
    let mut request = InferRequest::new(options)?;
    for raw in inputs {
        request.add_input(input::parse_input(&config, raw)?)?;
    }
    for name in outputs {
        request.add_output_name(name)?;
    }

    let result = server.infer(&mut request).await?;
    if result.has_error() {
        bail!("inference failed: {}", result.error_message());
    }
    println!("{}", result.debug_string());
    for name in result.output_names() {
        println!("{name}: {}", render_output(&result, name)?);
    }
    server.clear_completed();
    Ok(())
}

fn render_output(result: &InferResult, name: &str) -> Result<String> {
    let data = result.raw_data(name)?;
    let joined = match result.data_type(name)? {
        DataType::Bytes => return Ok(format!("{:?}", result.string_data(name)?)),
        DataType::Int32 => join(words::<4>(data).map(i32::from_le_bytes)),
        DataType::Int64 => join(words::<8>(data).map(i64::from_le_bytes)),
        DataType::Fp32 => join(words::<4>(data).map(f32::from_le_bytes)),
        DataType::Fp64 => join(words::<8>(data).map(f64::from_le_bytes)),
        DataType::Uint8 => join(data.iter()),
        DataType::Bool => join(data.iter().map(|b| *b != 0)),
        other => format!("<{} bytes of {other}>", data.len()),
    };
    Ok(format!("[{joined}]"))
}

fn words<const N: usize>(data: &[u8]) -> impl Iterator<Item = [u8; N]> + '_ {
    data.chunks_exact(N).filter_map(|chunk| chunk.try_into().ok())
}

fn join<T: std::fmt::Display>(values: impl Iterator<Item = T>) -> String {
    values.map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
}
