use std::sync::Arc;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{error, info, warn};

use super::{Job, JobError, TaskHandle, TaskStatus, FATAL_ERROR};

/// Pool de ejecución con un número fijo de huecos.
#[derive(Clone)]
pub struct TaskPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl TaskPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Huecos libres en este momento.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Encola el trabajo; empieza cuando haya hueco.
    pub fn submit(&self, job: Arc<dyn Job>, handle: TaskHandle) -> JoinHandle<()> {
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                warn!(task = handle.id(), "pool cerrado, la tarea no se ejecuta");
                return;
            };

            handle.set_status(TaskStatus::Processing);
            info!(task = handle.id(), "tarea en ejecución");

            // en su propia tarea para que un panic no se lleve el hueco
            let runner = handle.clone();
            let outcome = tokio::spawn(async move { job.run(&runner).await }).await;

            match outcome {
                Ok(Ok(())) => {
                    handle.set_status(TaskStatus::Finished);
                    info!(task = handle.id(), "tarea completada");
                }
                Ok(Err(e)) => {
                    warn!(task = handle.id(), error = %e, "tarea con error");
                    handle.set_error(e);
                }
                Err(e) => {
                    error!(task = handle.id(), error = %e, "panic en la tarea");
                    handle.set_error(JobError::with(FATAL_ERROR, e));
                }
            }
        })
    }
}
