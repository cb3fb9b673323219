//! Background tasks and their handles.

pub mod projection_worker;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub use projection_worker::{LiveProjection, ProjectionWorker};

/// Handle to control and join a background task.
///
/// Dropping the handle also stops the task: the shutdown channel closes and
/// the task's loop treats that like an explicit request.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn spawn<F>(name: &'static str, run: impl FnOnce(oneshot::Receiver<()>) -> F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(run(shutdown_rx));
        Self {
            name,
            shutdown,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request graceful shutdown and wait for the task to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.join.await {
            tracing::warn!(worker = self.name, error = %err, "worker task ended abnormally");
        }
    }
}
