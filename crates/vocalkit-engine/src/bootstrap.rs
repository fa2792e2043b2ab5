use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use vocalkit_core::{Event, EventBus};
use vocalkit_observability::{metrics, trace::Span};

use crate::{
    codes,
    config::EngineConfig,
    process::ProcessSupervisor,
    python_runtime::{self, EnvironmentFacts},
    resources::ResourceBundle,
    task::{self, TaskHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootstrapState {
    Unchecked,
    Installing,
    Ready,
    Failed,
}

/// Cosmetic progress for the setup step: starts at 0.05, +0.01 per line,
/// never past 0.85 until the whole install has succeeded.
#[derive(Debug, Clone, Copy)]
pub struct InstallProgress {
    fraction: f64,
}

impl InstallProgress {
    pub const START: f64 = 0.05;
    pub const STEP: f64 = 0.01;
    pub const SETUP_CAP: f64 = 0.85;
    pub const DEPENDENCIES: f64 = 0.90;
    pub const PROBE: f64 = 0.95;
    pub const DONE: f64 = 1.0;

    pub fn new() -> Self {
        Self {
            fraction: Self::START,
        }
    }

    pub fn current(&self) -> f64 {
        self.fraction
    }

    pub fn advance(&mut self) -> f64 {
        self.fraction = (self.fraction + Self::STEP).min(Self::SETUP_CAP);
        self.fraction
    }

    /// Moves to a later milestone; never goes backwards.
    pub fn snap(&mut self, milestone: f64) -> f64 {
        self.fraction = self.fraction.max(milestone);
        self.fraction
    }
}

impl Default for InstallProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub state: BootstrapState,
    /// False when both environment facts already held and nothing ran.
    pub installed: bool,
    pub python_path: String,
    pub setup_lines: usize,
}

/// Prepares the interpreter environment in the data directory and reports
/// progress on the bus.
pub struct Bootstrapper {
    cfg: Arc<EngineConfig>,
    bus: Arc<EventBus>,
    state: Mutex<BootstrapState>,
}

impl Bootstrapper {
    pub fn new(cfg: Arc<EngineConfig>, bus: Arc<EventBus>) -> Self {
        Self {
            cfg,
            bus,
            state: Mutex::new(BootstrapState::Unchecked),
        }
    }

    pub fn state(&self) -> BootstrapState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, s: BootstrapState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = s;
    }

    /// Runs the bootstrap on a dedicated worker thread.
    pub fn spawn(self: Arc<Self>) -> Result<TaskHandle<BootstrapReport>> {
        let task_id = task::new_task_id();
        let token = CancellationToken::new();
        let worker_token = token.clone();
        let worker_id = task_id.clone();
        task::spawn_task("bootstrap", task_id, token, move || {
            self.run(Some(&worker_id), &worker_token)
        })
    }

    /// Blocking bootstrap. On failure the error carries an `E_BOOTSTRAP_*`
    /// (or `E_CANCELLED`) code and `install-failed` has been published.
    pub fn run(&self, task_id: Option<&str>, cancel: &CancellationToken) -> Result<BootstrapReport> {
        let data_dir = &self.cfg.data_dir;
        let python = self.cfg.python_path();
        let facts = EnvironmentFacts::probe(&self.cfg);
        let span = Span::start(
            data_dir,
            task_id,
            "Bootstrap",
            "BOOT.run",
            Some(serde_json::json!({
                "python": python.display().to_string(),
                "facts": facts,
            })),
        );

        if facts.is_ready() {
            self.set_state(BootstrapState::Ready);
            self.publish(task_id, Event::install_skipped());
            span.skipped("environment already installed", None);
            return Ok(BootstrapReport {
                state: BootstrapState::Ready,
                installed: false,
                python_path: python.display().to_string(),
                setup_lines: 0,
            });
        }

        self.set_state(BootstrapState::Installing);
        self.publish(task_id, Event::install_started());

        match self.install(task_id, &python, cancel) {
            Ok(setup_lines) => {
                self.set_state(BootstrapState::Ready);
                metrics::append_best_effort(
                    data_dir,
                    "bootstrap",
                    &serde_json::json!({"type": "bootstrap", "task_id": task_id, "status": "ready", "setup_lines": setup_lines}),
                );
                span.ok(Some(serde_json::json!({ "setup_lines": setup_lines })));
                Ok(BootstrapReport {
                    state: BootstrapState::Ready,
                    installed: true,
                    python_path: python.display().to_string(),
                    setup_lines,
                })
            }
            Err(e) => {
                python_runtime::clear_ready_marker(data_dir);
                self.set_state(BootstrapState::Failed);
                let code = codes::error_code(&e);
                self.publish(task_id, Event::install_failed(format!("{e:#}")));
                metrics::append_best_effort(
                    data_dir,
                    "bootstrap",
                    &serde_json::json!({"type": "bootstrap", "task_id": task_id, "status": "failed", "error_code": code}),
                );
                span.err_anyhow("bootstrap", code, &e, None);
                Err(e)
            }
        }
    }

    fn install(
        &self,
        task_id: Option<&str>,
        python: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let cfg = &self.cfg;
        let data_dir = &cfg.data_dir;
        python_runtime::clear_ready_marker(data_dir);

        let bundle = ResourceBundle::new(&cfg.resource_dir).with_trace_dir(data_dir);
        let setup_script = bundle
            .extract(&cfg.setup_script, data_dir)
            .map_err(|e| anyhow!("E_BOOTSTRAP_SETUP_FAILED: {e:#}"))?;

        let mut supervisor = ProcessSupervisor::new(data_dir).with_poll_interval(cfg.poll_interval);
        if let Some(id) = task_id {
            supervisor = supervisor.with_task_id(id);
        }

        let mut progress = InstallProgress::new();
        let setup = supervisor.run(
            &python_runtime::setup_command(&setup_script, data_dir),
            |line| {
                let f = progress.advance();
                self.publish(task_id, Event::install_progress(line, f));
            },
            cancel,
        );
        let setup = match setup {
            Ok(r) => r,
            Err(e) if codes::is_cancelled(&e) => return Err(e),
            Err(e) => return Err(e.context("E_BOOTSTRAP_SETUP_FAILED: setup script could not run")),
        };
        if !setup.success() {
            return Err(anyhow!(
                "E_BOOTSTRAP_SETUP_FAILED: setup exited with code {} ({})",
                setup.exit_code,
                setup.last_line()
            ));
        }
        if !python.exists() {
            return Err(anyhow!(
                "E_BOOTSTRAP_NO_INTERPRETER: setup finished but {} does not exist",
                python.display()
            ));
        }

        let f = progress.snap(InstallProgress::DEPENDENCIES);
        self.publish(task_id, Event::install_progress("Installing dependencies...", f));
        let manifest: Option<PathBuf> = bundle
            .extract_optional(&cfg.manifest, data_dir)
            .map_err(|e| anyhow!("E_BOOTSTRAP_DEPS_FAILED: {e:#}"))?;
        let deps = supervisor.run(
            &python_runtime::dependency_command(
                python,
                data_dir,
                manifest.as_deref(),
                &cfg.fallback_packages,
            ),
            |line| self.publish(task_id, Event::install_progress(line, f)),
            cancel,
        );
        let deps = match deps {
            Ok(r) => r,
            Err(e) if codes::is_cancelled(&e) => return Err(e),
            Err(e) => return Err(e.context("E_BOOTSTRAP_DEPS_FAILED: pip could not run")),
        };
        if !deps.success() {
            return Err(anyhow!(
                "E_BOOTSTRAP_DEPS_FAILED: pip install exited with code {} ({})",
                deps.exit_code,
                deps.last_line()
            ));
        }

        let f = progress.snap(InstallProgress::PROBE);
        self.publish(task_id, Event::install_progress("Verifying environment...", f));
        let probe = supervisor.run(
            &python_runtime::probe_command(python, data_dir, &cfg.probe_code),
            |line| self.publish(task_id, Event::install_progress(line, f)),
            cancel,
        );
        let probe = match probe {
            Ok(r) => r,
            Err(e) if codes::is_cancelled(&e) => return Err(e),
            Err(e) => return Err(e.context("E_BOOTSTRAP_PROBE_FAILED: probe could not run")),
        };
        if !probe.success() {
            return Err(anyhow!(
                "E_BOOTSTRAP_PROBE_FAILED: import probe exited with code {} ({})",
                probe.exit_code,
                probe.last_line()
            ));
        }

        if !python_runtime::ready_marker_path(data_dir).exists() {
            python_runtime::write_ready_marker(data_dir)?;
        }
        let f = progress.snap(InstallProgress::DONE);
        self.publish(task_id, Event::install_progress("Environment ready.", f));
        Ok(setup.aggregated_log.len())
    }

    fn publish(&self, task_id: Option<&str>, event: Event) {
        let event = match task_id {
            Some(id) => event.with_task_id(id),
            None => event,
        };
        self.bus.publish(event);
    }
}
