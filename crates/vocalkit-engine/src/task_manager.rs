use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use vocalkit_core::EventBus;
use vocalkit_observability::trace;

use crate::{
    bootstrap::{BootstrapReport, Bootstrapper},
    config::EngineConfig,
    script_runner::{self, RunOutcome, ScriptRunner},
    task::{self, TaskHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Bootstrap,
    Script,
}

struct ActiveTask {
    task_id: String,
    kind: TaskKind,
    token: CancellationToken,
}

type Slot = Arc<Mutex<Option<ActiveTask>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<ActiveTask>> {
    slot.lock().unwrap_or_else(|p| p.into_inner())
}

/// Frees the slot when the worker ends, including by panic.
struct SlotRelease {
    slot: Slot,
    task_id: String,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        let mut g = lock(&self.slot);
        if g.as_ref().map(|a| &a.task_id) == Some(&self.task_id) {
            *g = None;
        }
    }
}

/// Serialises bootstraps and script runs against one data directory.
#[derive(Clone)]
pub struct TaskManager {
    cfg: Arc<EngineConfig>,
    bus: Arc<EventBus>,
    bootstrapper: Arc<Bootstrapper>,
    runner: ScriptRunner,
    inner: Slot,
}

impl TaskManager {
    pub fn new(cfg: EngineConfig, bus: Arc<EventBus>) -> Self {
        let cfg = Arc::new(cfg);
        Self {
            bootstrapper: Arc::new(Bootstrapper::new(cfg.clone(), bus.clone())),
            runner: ScriptRunner::new(cfg.clone(), bus.clone()),
            cfg,
            bus,
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn bootstrapper(&self) -> &Bootstrapper {
        &self.bootstrapper
    }

    pub fn has_active_task(&self) -> bool {
        lock(&self.inner).is_some()
    }

    pub fn active_task(&self) -> Option<(String, TaskKind)> {
        lock(&self.inner)
            .as_ref()
            .map(|a| (a.task_id.clone(), a.kind))
    }

    fn claim(&self, kind: TaskKind) -> Result<(String, CancellationToken)> {
        let mut g = lock(&self.inner);
        if let Some(active) = g.as_ref() {
            return Err(anyhow!(
                "E_TASK_BUSY: another task is already running ({:?} {})",
                active.kind,
                active.task_id
            ));
        }
        let task_id = task::new_task_id();
        let token = CancellationToken::new();
        *g = Some(ActiveTask {
            task_id: task_id.clone(),
            kind,
            token: token.clone(),
        });
        Ok((task_id, token))
    }

    fn release_guard(&self, task_id: &str) -> SlotRelease {
        SlotRelease {
            slot: self.inner.clone(),
            task_id: task_id.to_string(),
        }
    }

    pub fn start_bootstrap(&self) -> Result<TaskHandle<BootstrapReport>> {
        let (task_id, token) = self.claim(TaskKind::Bootstrap)?;
        let release = self.release_guard(&task_id);
        let boot = self.bootstrapper.clone();
        let worker_id = task_id.clone();
        let worker_token = token.clone();
        self.trace_start(&task_id, TaskKind::Bootstrap);
        task::spawn_task("bootstrap", task_id, token, move || {
            let _release = release;
            boot.run(Some(&worker_id), &worker_token)
        })
    }

    pub fn run_script(&self, input: &Path) -> Result<TaskHandle<RunOutcome>> {
        script_runner::ensure_input(input)?;
        let (task_id, token) = self.claim(TaskKind::Script)?;
        let release = self.release_guard(&task_id);
        let runner = self.runner.clone();
        let input = input.to_path_buf();
        let worker_id = task_id.clone();
        let worker_token = token.clone();
        self.trace_start(&task_id, TaskKind::Script);
        task::spawn_task("script_runner", task_id, token, move || {
            let _release = release;
            Ok(runner.run_blocking(&worker_id, &input, &worker_token))
        })
    }

    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let g = lock(&self.inner);
        let active = g
            .as_ref()
            .ok_or_else(|| anyhow!("E_TASK_NOT_FOUND: no active task"))?;
        if active.task_id != task_id {
            return Err(anyhow!("E_TASK_NOT_FOUND: task_id mismatch"));
        }
        active.token.cancel();
        trace::event(
            &self.cfg.data_dir,
            Some(task_id),
            "TaskManager",
            "TASK.cancel",
            "ok",
            None,
        );
        Ok(())
    }

    fn trace_start(&self, task_id: &str, kind: TaskKind) {
        trace::event(
            &self.cfg.data_dir,
            Some(task_id),
            "TaskManager",
            "TASK.start",
            "ok",
            Some(serde_json::json!({ "kind": kind })),
        );
    }
}
