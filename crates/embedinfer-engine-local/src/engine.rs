use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use embedinfer_core::{
    AllocatorSession, CompletionCallback, Engine, Error, ModelConfig, ModelControlMode,
    ModelReadyState, RepositoryIndex, Result, ServerOptions, LATEST_MODEL_VERSION,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::model::LocalModel;
use crate::request::LocalRequest;
use crate::response::LocalResponse;
use crate::scheduler::Scheduler;
use crate::stats::{EngineStats, ModelCounters, StatsSnapshot};
use crate::worker::{Job, Worker};

/// Every registered model serves exactly this version.
pub const LOCAL_MODEL_VERSION: i64 = 1;

struct ModelSlot {
    model: Arc<dyn LocalModel>,
    config: Arc<ModelConfig>,
    state: ModelReadyState,
}

/// An in-process engine that runs [`LocalModel`]s on a pool of worker
/// threads.
pub struct LocalEngine {
    options: ServerOptions,
    models: RwLock<BTreeMap<String, ModelSlot>>,
    scheduler: Scheduler,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<EngineStats>,
}

impl LocalEngine {
    pub fn new(options: ServerOptions) -> Result<Self> {
        options.validate()?;

        let mut worker_txs = Vec::with_capacity(options.worker_threads);
        let mut handles = Vec::with_capacity(options.worker_threads);
        for id in 0..options.worker_threads {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = Worker { id, inbox: rx };
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{id}", options.server_id))
                .spawn(move || worker.run())
                .map_err(|e| Error::engine(format!("failed to spawn worker thread: {e}")))?;
            worker_txs.push(tx);
            handles.push(handle);
        }

        for (setting, value) in options.backend_settings("local") {
            debug!(setting, value, "local engine backend setting");
        }
        info!(
            server_id = %options.server_id,
            workers = options.worker_threads,
            control_mode = ?options.model_control_mode,
            "local engine started"
        );

        Ok(Self {
            options,
            models: RwLock::new(BTreeMap::new()),
            scheduler: Scheduler::new(worker_txs),
            workers: handles,
            stats: Arc::new(EngineStats::default()),
        })
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Adds a model to the repository. It is served right away when the
    /// engine runs without explicit model control.
    pub fn register_model(&self, model: Arc<dyn LocalModel>) -> Result<()> {
        let config = model.config().clone();
        if config.name.is_empty() {
            return Err(Error::Config("model config has no name".to_string()));
        }
        if self.options.disable_auto_complete_config && config.inputs.is_empty() {
            return Err(Error::Config(format!(
                "model '{}' declares no inputs and config auto-completion is disabled",
                config.name
            )));
        }
        let state = match self.options.model_control_mode {
            ModelControlMode::None => ModelReadyState::Ready,
            ModelControlMode::Explicit => ModelReadyState::Unavailable,
        };
        let name = config.name.clone();
        debug!(model = %name, state = %state, "model registered");
        self.models_mut().insert(
            name,
            ModelSlot {
                model,
                config: Arc::new(config),
                state,
            },
        );
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn model_stats(&self, name: &str) -> ModelCounters {
        self.stats.model(name)
    }

    fn models(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ModelSlot>> {
        self.models.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn models_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, ModelSlot>> {
        self.models.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, name: &str, state: ModelReadyState) -> Result<()> {
        let mut models = self.models_mut();
        let slot = models.get_mut(name).ok_or_else(|| {
            Error::engine(format!("failed to load '{name}', no version is available"))
        })?;
        slot.state = state;
        Ok(())
    }
}

fn unknown_model(name: &str) -> Error {
    Error::engine(format!("request for unknown model: '{name}' is not found"))
}

fn version_matches(version: i64) -> bool {
    version == LATEST_MODEL_VERSION || version == LOCAL_MODEL_VERSION
}

impl Engine for LocalEngine {
    type Request = LocalRequest;
    type Response = LocalResponse;

    fn name(&self) -> &'static str {
        "local"
    }

    fn load_model(&self, name: &str) -> Result<()> {
        self.set_state(name, ModelReadyState::Ready)
    }

    fn unload_model(&self, name: &str) -> Result<()> {
        if let Some(slot) = self.models_mut().get_mut(name) {
            slot.state = ModelReadyState::Unavailable;
        } else {
            debug!(model = %name, "unload of unknown model ignored");
        }
        Ok(())
    }

    fn model_index(&self) -> Result<Vec<RepositoryIndex>> {
        Ok(self
            .models()
            .iter()
            .map(|(name, slot)| RepositoryIndex {
                name: name.clone(),
                version: LOCAL_MODEL_VERSION.to_string(),
                state: slot.state,
            })
            .collect())
    }

    fn model_is_ready(&self, name: &str, version: i64) -> Result<bool> {
        Ok(version_matches(version)
            && self
                .models()
                .get(name)
                .is_some_and(|slot| slot.state == ModelReadyState::Ready))
    }

    fn model_config(&self, name: &str, version: i64) -> Result<ModelConfig> {
        if !version_matches(version) {
            return Err(Error::engine(format!(
                "request for unknown model: '{name}' version {version} is not found"
            )));
        }
        self.models()
            .get(name)
            .map(|slot| slot.config.as_ref().clone())
            .ok_or_else(|| unknown_model(name))
    }

    fn metrics(&self) -> Result<String> {
        if !self.options.metrics.allow_metrics {
            return Err(Error::engine("metrics are disabled"));
        }
        let versions = self
            .models()
            .keys()
            .map(|name| (name.clone(), LOCAL_MODEL_VERSION))
            .collect();
        Ok(self.stats.render(&versions))
    }

    fn new_request(&self, model: &str, version: i64) -> Result<LocalRequest> {
        let models = self.models();
        let slot = models
            .get(model)
            .filter(|_| version_matches(version))
            .ok_or_else(|| unknown_model(model))?;
        let resolved = if version == LATEST_MODEL_VERSION {
            LOCAL_MODEL_VERSION
        } else {
            version
        };
        Ok(LocalRequest::new(
            model,
            resolved,
            slot.config.clone(),
            self.stats.clone(),
        ))
    }

    fn infer_async(
        &self,
        request: LocalRequest,
        allocator: Arc<AllocatorSession>,
        on_complete: CompletionCallback<LocalResponse>,
    ) -> Result<()> {
        let (model, config) = {
            let models = self.models();
            let slot = models
                .get(request.model())
                .filter(|slot| slot.state == ModelReadyState::Ready)
                .ok_or_else(|| {
                    Error::engine(format!("model '{}' is not ready", request.model()))
                })?;
            (slot.model.clone(), slot.config.clone())
        };

        if !config.outputs.is_empty() {
            if let Some(unknown) = request
                .requested_outputs
                .iter()
                .find(|name| config.output(name).is_none())
            {
                return Err(Error::engine(format!(
                    "unexpected inference output '{unknown}' for model '{}'",
                    config.name
                )));
            }
        }

        let job = Job {
            request,
            model,
            config,
            session: allocator,
            on_complete,
            stats: self.stats.clone(),
            enqueued_at: Instant::now(),
        };
        if let Err(job) = self.scheduler.dispatch(job) {
            warn!(model = %job.config.name, "worker pool is closed");
            job.abort(Error::engine("worker pool is closed"));
        }
        Ok(())
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        self.scheduler.close();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        debug!(server_id = %self.options.server_id, "local engine stopped");
    }
}
