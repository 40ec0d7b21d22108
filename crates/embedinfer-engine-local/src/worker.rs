use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use embedinfer_core::{AllocatorSession, CompletionCallback, Error, ModelConfig, Result, Tensor};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::model::LocalModel;
use crate::request::LocalRequest;
use crate::response::LocalResponse;
use crate::stats::EngineStats;

/// One submitted request on its way to a worker.
pub struct Job {
    pub(crate) request: LocalRequest,
    pub(crate) model: Arc<dyn LocalModel>,
    pub(crate) config: Arc<ModelConfig>,
    pub(crate) session: Arc<AllocatorSession>,
    pub(crate) on_complete: CompletionCallback<LocalResponse>,
    pub(crate) stats: Arc<EngineStats>,
    pub(crate) enqueued_at: Instant,
}

impl Job {
    /// Fails the job without running it.
    pub(crate) fn abort(self, err: Error) {
        let Job {
            request,
            on_complete,
            ..
        } = self;
        drop(request);
        on_complete(Err(err));
    }

    fn run(self, worker_id: usize) {
        let Job {
            mut request,
            model,
            config,
            session,
            on_complete,
            stats,
            enqueued_at,
        } = self;

        let mut response = LocalResponse::new(
            &request.model,
            request.version,
            &request.id,
            session.clone(),
            stats.clone(),
        );

        let waited = enqueued_at.elapsed();
        debug!(
            worker_id,
            model = %request.model,
            id = %request.id,
            correlation = ?request.correlation,
            flags = request.flags,
            priority = request.priority,
            waited_us = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX),
            "executing request"
        );
        let started = Instant::now();
        let outcome = if request.timeout_micros > 0
            && waited > Duration::from_micros(request.timeout_micros)
        {
            Err(Error::Response(format!(
                "request timed out after waiting {}us in queue",
                waited.as_micros()
            )))
        } else {
            let inputs = request.take_inputs();
            execute(&*model, &config, &request.requested_outputs, &session, &inputs, &mut response)
        };
        let ok = outcome.is_ok();
        stats.record(&request.model, ok, started.elapsed());

        if let Err(err) = outcome {
            debug!(worker_id, model = %request.model, error = %err, "inference failed");
            let message = match err {
                Error::Response(message) => message,
                other => other.to_string(),
            };
            response.fail(message);
        }

        drop(request);
        on_complete(Ok(response));
    }
}

fn execute(
    model: &dyn LocalModel,
    config: &ModelConfig,
    requested: &[String],
    session: &AllocatorSession,
    inputs: &[Tensor],
    response: &mut LocalResponse,
) -> Result<()> {
    let produced = model.execute(inputs)?;
    session.start()?;
    for output in &produced.outputs {
        if !requested.is_empty() && !requested.contains(&output.name) {
            continue;
        }
        let data_type = if output.data_type.is_resolved() {
            output.data_type
        } else {
            config
                .output(&output.name)
                .and_then(|o| o.data_type())
                .unwrap_or(output.data_type)
        };
        response.push_output(&output.name, data_type, &output.shape, &output.data)?;
    }
    response.set_parameters(produced.parameters);
    Ok(())
}

pub struct Worker {
    pub id: usize,
    pub inbox: mpsc::UnboundedReceiver<Job>,
}

impl Worker {
    /// Runs on a dedicated thread until the inbox closes.
    pub fn run(mut self) {
        info!(worker_id = self.id, "worker started");
        while let Some(job) = self.inbox.blocking_recv() {
            let model = job.request.model.clone();
            let id = self.id;
            if panic::catch_unwind(AssertUnwindSafe(|| job.run(id))).is_err() {
                warn!(worker_id = self.id, model = %model, "model execution panicked");
            }
        }
        debug!(worker_id = self.id, "worker stopped");
    }
}
