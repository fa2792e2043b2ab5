use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;

/// A background operation running on its own named OS thread.
#[derive(Debug)]
pub struct TaskHandle<T> {
    task_id: String,
    token: CancellationToken,
    join: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Requests a stop. A running subprocess is killed at the next poll.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<T> {
        self.join
            .join()
            .map_err(|_| anyhow!("E_INTERNAL: worker thread for task {} panicked", self.task_id))?
    }
}

pub(crate) fn spawn_task<T, F>(
    thread_name: &str,
    task_id: String,
    token: CancellationToken,
    work: F,
) -> Result<TaskHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let join = thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(work)
        .with_context(|| format!("E_INTERNAL: failed to spawn {thread_name} thread"))?;
    Ok(TaskHandle {
        task_id,
        token,
        join,
    })
}

pub(crate) fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
