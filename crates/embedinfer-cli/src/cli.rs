use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "embedinfer", version, about = "Embedded inference engine driver")]
pub struct Cli {
    /// Server options as JSON
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, overrides the configured logging levels (RUST_LOG syntax)
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Engine worker threads, overrides the config file
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the model repository index
    Index,

    /// Print engine metrics in text exposition format
    Metrics,

    /// Load a model and print the resulting index
    Load {
        /// Model name
        model: String,
    },

    /// Run one inference request
    Infer {
        /// Model name
        #[arg(long)]
        model: String,

        /// Model version (-1 lets the engine choose)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        version: i64,

        /// Request id echoed in the result
        #[arg(long, default_value = "")]
        id: String,

        /// Input as NAME=v1,v2,... (repeatable)
        #[arg(long = "input", required = true)]
        inputs: Vec<String>,

        /// Output to request (repeatable; default is every output)
        #[arg(long = "output")]
        outputs: Vec<String>,
    },
}
