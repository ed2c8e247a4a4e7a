//! Small wrapper around tokio::spawn that names tasks and logs how they
//! finished, so a silently-dying connection task leaves a trace.

use std::future::Future;

use tracing::{debug, error};

/// Launch a named task on the current runtime.
pub fn spawn<F>(name: &str, future: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(task_wrapper(task_name, future));
}

async fn task_wrapper<F>(task_name: String, future: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    debug!("Starting task '{}'", task_name);
    match future.await {
        Ok(()) => debug!("Task '{}' exited normally", task_name),
        Err(err) => error!("Task '{}' exited with error: {:?}", task_name, err),
    }
}
