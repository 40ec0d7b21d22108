use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Default,
    Iso8601,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// 0 keeps verbose logging off; 1 enables debug, 2 and above trace.
    pub verbose: u32,
    pub info: bool,
    pub warn: bool,
    pub error: bool,
    pub format: LogFormat,
    /// Append to this file instead of writing to stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            verbose: 0,
            info: true,
            warn: true,
            error: true,
            format: LogFormat::Default,
            log_file: None,
        }
    }
}

impl LoggingOptions {
    /// The most verbose level these options let through, as a filter
    /// directive.
    pub fn filter_directive(&self) -> &'static str {
        match self.verbose {
            0 if self.info => "info",
            0 if self.warn => "warn",
            0 if self.error => "error",
            0 => "off",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsOptions {
    pub allow_metrics: bool,
    pub allow_gpu_metrics: bool,
    pub allow_cpu_metrics: bool,
    pub metrics_interval_ms: u64,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            allow_metrics: true,
            allow_gpu_metrics: true,
            allow_cpu_metrics: true,
            metrics_interval_ms: 2000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub backend_name: String,
    pub setting: String,
    pub value: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelControlMode {
    /// Every known model is loaded when the engine starts.
    #[default]
    None,
    /// Models load only when asked to.
    Explicit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub server_id: String,
    pub model_repository_paths: Vec<String>,
    pub logging: LoggingOptions,
    pub metrics: MetricsOptions,
    pub backend_config: Vec<BackendConfig>,
    pub model_control_mode: ModelControlMode,
    pub disable_auto_complete_config: bool,
    pub worker_threads: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server_id: "embedinfer".to_string(),
            model_repository_paths: Vec::new(),
            logging: LoggingOptions::default(),
            metrics: MetricsOptions::default(),
            backend_config: Vec::new(),
            model_control_mode: ModelControlMode::None,
            disable_auto_complete_config: false,
            worker_threads: 2,
        }
    }
}

impl ServerOptions {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let options: Self =
            serde_json::from_str(raw).map_err(|e| Error::Config(format!("server options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_id.trim().is_empty() {
            return Err(Error::Config("server_id must not be empty".to_string()));
        }
        if self.worker_threads == 0 {
            return Err(Error::Config("worker_threads must be at least 1".to_string()));
        }
        if self.metrics.allow_metrics && self.metrics.metrics_interval_ms == 0 {
            return Err(Error::Config(
                "metrics_interval_ms must be positive when metrics are enabled".to_string(),
            ));
        }
        if let Some(bc) = self.backend_config.iter().find(|bc| bc.backend_name.is_empty()) {
            return Err(Error::Config(format!(
                "backend_config entry '{}' has no backend_name",
                bc.setting
            )));
        }
        Ok(())
    }

    /// Backend settings as `(setting, value)` pairs for one backend.
    pub fn backend_settings<'a>(
        &'a self,
        backend: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.backend_config
            .iter()
            .filter(move |bc| bc.backend_name == backend)
            .map(|bc| (bc.setting.as_str(), bc.value.as_str()))
    }
}
