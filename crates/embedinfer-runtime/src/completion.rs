use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use embedinfer_core::{Error, NativeResponse, Result};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::debug;

use crate::registry::ResponseRegistry;
use crate::result::InferResult;

pub(crate) type Completion = Result<Arc<dyn NativeResponse>>;

/// Resolves once the engine's completion callback has fired.
///
/// Await it from async code, call [`InferFuture::wait`] from a plain thread,
/// or poll with [`InferFuture::try_result`] without blocking. Dropping it
/// does not cancel the request; the engine still completes and releases it.
///
/// The result is handed out once. Asking again, by polling or awaiting,
/// yields [`Error::InvalidArgument`].
pub struct InferFuture {
    rx: oneshot::Receiver<Completion>,
    registry: Arc<ResponseRegistry>,
    model: String,
    done: bool,
}

impl fmt::Debug for InferFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferFuture")
            .field("registry", &self.registry)
            .field("model", &self.model)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl InferFuture {
    pub(crate) fn new(
        rx: oneshot::Receiver<Completion>,
        registry: Arc<ResponseRegistry>,
        model: String,
    ) -> Self {
        Self {
            rx,
            registry,
            model,
            done: false,
        }
    }

    /// `None` while the request is still running.
    pub fn try_result(&mut self) -> Option<Result<InferResult>> {
        if self.done {
            return Some(Err(self.taken()));
        }
        let outcome = match self.rx.try_recv() {
            Ok(completion) => self.finish(completion),
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => Err(self.dropped()),
        };
        self.done = true;
        Some(outcome)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Blocks the calling thread. Must not be called from inside an async
    /// runtime.
    pub fn wait(self) -> Result<InferResult> {
        if self.done {
            return Err(self.taken());
        }
        let Self {
            rx,
            registry,
            model,
            ..
        } = self;
        let completion = rx.blocking_recv().unwrap_or_else(|_| Err(dropped(&model)));
        finish(&registry, &model, completion)
    }

    fn dropped(&self) -> Error {
        dropped(&self.model)
    }

    fn taken(&self) -> Error {
        Error::invalid_argument(format!(
            "the result for model '{}' has already been taken",
            self.model
        ))
    }

    fn finish(&self, completion: Completion) -> Result<InferResult> {
        finish(&self.registry, &self.model, completion)
    }
}

fn dropped(model: &str) -> Error {
    Error::engine(format!(
        "engine dropped the completion for model '{model}' without responding"
    ))
}

/// Successful responses go to the registry; failed ones are dropped here.
fn finish(
    registry: &ResponseRegistry,
    model: &str,
    completion: Completion,
) -> Result<InferResult> {
    let response = completion?;
    let result = InferResult::materialize(response.clone())?;
    if result.has_error() {
        debug!(model, error = %result.error_message(), "response flagged as failed");
    } else {
        registry.retain(response);
    }
    Ok(result)
}

impl Future for InferFuture {
    type Output = Result<InferResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(this.taken()));
        }
        let completion = match ready!(Pin::new(&mut this.rx).poll(cx)) {
            Ok(completion) => completion,
            Err(_) => Err(this.dropped()),
        };
        this.done = true;
        Poll::Ready(this.finish(completion))
    }
}
