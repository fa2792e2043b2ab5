use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::Path,
    sync::Arc,
};

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use vocalkit_core::{Event, EventBus, TerminalLatch, WorkflowResult};
use vocalkit_observability::{metrics, safe_eprintln, trace, trace::Span};

use crate::{
    codes,
    config::EngineConfig,
    process::{CommandSpec, ProcessSupervisor},
    python_runtime,
    resources::ResourceBundle,
    task::{self, TaskHandle},
};

/// Shown to the user when the recording held no usable voice signal.
pub const INVALID_DETAIL: &str =
    "The audio recorder did not detect any valid acoustics. Please try again!";

pub mod steps {
    pub const EXTRACT: (&str, f64) = ("Extracting analysis resources...", 0.16);
    pub const VERIFY: (&str, f64) = ("Installing environment updates if needed...", 0.32);
    pub const PARSE_MANIFEST: (&str, f64) = ("Parsing dependency requirements...", 0.48);
    pub const INSTALL_MANIFEST: (&str, f64) = ("Installing dependency requirements...", 0.55);
    pub const INSTALL_FALLBACK: (&str, f64) = ("Installing basic requirements...", 0.55);
    pub const PROBE: (&str, f64) = ("Importing dependencies...", 0.64);
    pub const ANALYZE: (&str, f64) = ("Analyzing vocal recording...", 0.95);
    pub const COMPLETED: (&str, f64) = ("Completed!", 1.0);
}

/// Final state of one script invocation, as seen by whoever joins it.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub task_id: String,
    pub result: WorkflowResult,
    pub exit_code: Option<i32>,
    pub error_code: Option<String>,
    pub detail: Option<String>,
}

/// Launches the analysis script for one input file per call.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    cfg: Arc<EngineConfig>,
    bus: Arc<EventBus>,
}

impl ScriptRunner {
    pub fn new(cfg: Arc<EngineConfig>, bus: Arc<EventBus>) -> Self {
        Self { cfg, bus }
    }

    /// Starts a run on a worker thread and returns immediately. A missing
    /// input file is rejected here, before anything is spawned.
    pub fn run_script(&self, input: &Path) -> Result<TaskHandle<RunOutcome>> {
        self.run_script_with(task::new_task_id(), input, CancellationToken::new())
    }

    pub fn run_script_with(
        &self,
        task_id: String,
        input: &Path,
        token: CancellationToken,
    ) -> Result<TaskHandle<RunOutcome>> {
        ensure_input(input)?;
        let runner = self.clone();
        let input = input.to_path_buf();
        let worker_id = task_id.clone();
        let worker_token = token.clone();
        task::spawn_task("script_runner", task_id, token, move || {
            Ok(runner.run_blocking(&worker_id, &input, &worker_token))
        })
    }

    /// Worker body. Always publishes exactly one terminal result and never
    /// lets an error or panic escape.
    pub fn run_blocking(&self, task_id: &str, input: &Path, cancel: &CancellationToken) -> RunOutcome {
        let run = Run {
            cfg: &self.cfg,
            bus: &self.bus,
            task_id,
            latch: TerminalLatch::new(),
            cancel,
        };
        let span = Span::start(
            &self.cfg.data_dir,
            Some(task_id),
            "ScriptRunner",
            "RUN.script",
            Some(serde_json::json!({ "input": input.display().to_string() })),
        );

        let attempt = catch_unwind(AssertUnwindSafe(|| run.execute(input)));
        let (exit_code, error) = match attempt {
            Ok(Ok(exit_code)) => (Some(exit_code), None),
            Ok(Err(e)) => (None, Some(e)),
            Err(_) => (None, Some(anyhow!("E_INTERNAL: script runner panicked"))),
        };

        match error {
            None => {
                let result = run.outcome();
                span.ok(Some(serde_json::json!({
                    "result": result.as_str(),
                    "exit_code": exit_code,
                })));
                RunOutcome {
                    task_id: task_id.to_string(),
                    result,
                    exit_code,
                    error_code: None,
                    detail: standing_detail(result),
                }
            }
            Some(e) => {
                let code = codes::error_code(&e);
                let terminal = if code == codes::E_CANCELLED || cancel.is_cancelled() {
                    WorkflowResult::Cancelled
                } else {
                    WorkflowResult::Failed
                };
                let detail = format!("{e:#}");
                let result = run.resolve(terminal, Some(detail.clone()));
                span.err_anyhow("script", code, &e, Some(serde_json::json!({ "result": result.as_str() })));
                if result != terminal {
                    // An earlier result already stands; the error is only traced.
                    return RunOutcome {
                        task_id: task_id.to_string(),
                        result,
                        exit_code,
                        error_code: None,
                        detail: standing_detail(result),
                    };
                }
                RunOutcome {
                    task_id: task_id.to_string(),
                    result,
                    exit_code,
                    error_code: Some(code.to_string()),
                    detail: Some(detail),
                }
            }
        }
    }
}

fn standing_detail(result: WorkflowResult) -> Option<String> {
    (result == WorkflowResult::Invalid).then(|| INVALID_DETAIL.to_string())
}

pub(crate) fn ensure_input(input: &Path) -> Result<()> {
    if input.is_file() {
        Ok(())
    } else {
        Err(anyhow!(
            "E_INPUT_NOT_FOUND: input file does not exist: {}",
            input.display()
        ))
    }
}

struct Run<'a> {
    cfg: &'a EngineConfig,
    bus: &'a EventBus,
    task_id: &'a str,
    latch: TerminalLatch,
    cancel: &'a CancellationToken,
}

impl Run<'_> {
    fn progress(&self, (status, fraction): (&str, f64)) {
        self.bus
            .publish(Event::progress(status, fraction).with_task_id(self.task_id));
    }

    /// Publishes `result` if nothing was published yet; returns the result
    /// that actually stands.
    fn resolve(&self, result: WorkflowResult, detail: Option<String>) -> WorkflowResult {
        if !self.latch.try_resolve(result) {
            let standing = self.latch.outcome().unwrap_or(result);
            trace::event(
                &self.cfg.data_dir,
                Some(self.task_id),
                "ScriptRunner",
                "RUN.terminal_suppressed",
                "skipped",
                Some(serde_json::json!({
                    "suppressed": result.as_str(),
                    "standing": standing.as_str(),
                })),
            );
            return standing;
        }
        if let Err(e) = metrics::append_jsonl(
            &self.cfg.data_dir,
            &serde_json::json!({
                "type": "workflow_result",
                "task_id": self.task_id,
                "result": result.as_str(),
                "detail": detail,
            }),
        ) {
            safe_eprintln!("metrics append failed (workflow_result): {e:#}");
        }
        self.bus
            .publish(Event::workflow_result(detail, result).with_task_id(self.task_id));
        result
    }

    fn outcome(&self) -> WorkflowResult {
        self.latch.outcome().unwrap_or(WorkflowResult::Failed)
    }

    fn supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new(&self.cfg.data_dir)
            .with_task_id(self.task_id)
            .with_poll_interval(self.cfg.poll_interval)
    }

    /// Returns the analysis script's exit code once a terminal result stands.
    fn execute(&self, input: &Path) -> Result<i32> {
        let cfg = self.cfg;
        let data_dir = &cfg.data_dir;
        let sup = self.supervisor();

        self.progress(steps::EXTRACT);
        let bundle = ResourceBundle::new(&cfg.resource_dir).with_trace_dir(data_dir);
        let script = bundle.extract(&cfg.analysis_script, data_dir)?;
        let manifest = bundle.extract_optional(&cfg.manifest, data_dir)?;
        let model = bundle.extract_optional(&cfg.model, data_dir)?;

        self.progress(steps::VERIFY);
        let python = python_runtime::resolve_python_binary(cfg)?;

        self.progress(steps::PARSE_MANIFEST);
        self.progress(if manifest.is_some() {
            steps::INSTALL_MANIFEST
        } else {
            steps::INSTALL_FALLBACK
        });
        let deps = sup.run(
            &python_runtime::dependency_command(
                &python,
                data_dir,
                manifest.as_deref(),
                &cfg.fallback_packages,
            ),
            |_| {},
            self.cancel,
        )?;
        if !deps.success() {
            return Err(anyhow!(
                "E_DEPS_FAILED: pip install exited with code {} ({})",
                deps.exit_code,
                deps.last_line()
            ));
        }

        self.progress(steps::PROBE);
        let probe = sup.run(
            &python_runtime::probe_command(&python, data_dir, &cfg.probe_code),
            |_| {},
            self.cancel,
        )?;
        if !probe.success() {
            return Err(anyhow!(
                "E_PROBE_FAILED: import probe exited with code {} ({})",
                probe.exit_code,
                probe.last_line()
            ));
        }

        self.progress(steps::ANALYZE);
        let analysis = sup.run(
            &analysis_command(&python, &script, input, model.as_deref(), data_dir),
            |line| {
                if line.contains(&cfg.invalid_marker) {
                    self.resolve(WorkflowResult::Invalid, Some(INVALID_DETAIL.to_string()));
                }
            },
            self.cancel,
        )?;

        if analysis.success() {
            if !self.latch.is_resolved() {
                self.progress(steps::COMPLETED);
            }
            self.resolve(WorkflowResult::Success, None);
        } else {
            self.resolve(
                WorkflowResult::Failed,
                Some(format!(
                    "E_SCRIPT_FAILED: analysis exited with code {} ({})",
                    analysis.exit_code,
                    analysis.last_line()
                )),
            );
        }
        Ok(analysis.exit_code)
    }
}

/// `<python> <script> <input> [<model>]`.
pub fn analysis_command(
    python: &Path,
    script: &Path,
    input: &Path,
    model: Option<&Path>,
    data_dir: &Path,
) -> CommandSpec {
    let cmd = CommandSpec::new(python, data_dir).arg(script).arg(input);
    match model {
        Some(m) => cmd.arg(m),
        None => cmd,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bootstrap::tests::{fake_python, write_exec, Collector};
    use std::{fs, path::PathBuf, time::Duration};
    use vocalkit_core::EventKind;

    struct Fixture {
        data: tempfile::TempDir,
        res: tempfile::TempDir,
        input: PathBuf,
    }

    impl Fixture {
        /// `script` is a shell body standing in for the analysis script.
        fn new(script: &str) -> Self {
            Self::with_python(script, 0, 0)
        }

        fn with_python(script: &str, pip_exit: i32, probe_exit: i32) -> Self {
            let data = tempfile::tempdir().expect("tempdir");
            let res = tempfile::tempdir().expect("tempdir");
            write_exec(
                &python_runtime::default_python_path(data.path()),
                &fake_python(pip_exit, probe_exit),
            );
            fs::write(res.path().join("Vocal_Analysis_Script.py"), script).expect("script");
            fs::write(res.path().join("requirements.txt"), "matplotlib\n").expect("reqs");
            let input = data.path().join("take1.wav");
            fs::write(&input, b"RIFF").expect("input");
            Self { data, res, input }
        }

        fn cfg(&self) -> Arc<EngineConfig> {
            Arc::new(EngineConfig::new(self.data.path(), self.res.path()))
        }

        fn run(&self) -> (RunOutcome, Arc<Collector>) {
            let bus = Arc::new(EventBus::new());
            let rec = Arc::new(Collector::default());
            bus.subscribe(&rec);
            let runner = ScriptRunner::new(self.cfg(), bus);
            let outcome = runner
                .run_script(&self.input)
                .expect("start")
                .join()
                .expect("join");
            (outcome, rec)
        }
    }

    fn terminals(rec: &Collector) -> Vec<WorkflowResult> {
        rec.events().iter().filter_map(Event::workflow).collect()
    }

    #[test]
    fn success_path_progress_strictly_increases_to_one() {
        let fx = Fixture::new("echo analysing \"$1\"\nexit 0\n");
        let (outcome, rec) = fx.run();
        assert_eq!(outcome.result, WorkflowResult::Success);
        assert_eq!(outcome.exit_code, Some(0));

        let fractions: Vec<f64> = rec
            .events()
            .iter()
            .filter(|e| e.kind() == EventKind::UpdateProgress)
            .filter_map(Event::fraction)
            .collect();
        assert!(fractions.windows(2).all(|w| w[0] < w[1]), "{fractions:?}");
        assert_eq!(fractions.last(), Some(&1.0));

        let events = rec.events();
        let last = events.last().expect("events");
        assert_eq!(last.workflow(), Some(WorkflowResult::Success));
        assert!(last.old_value().is_none());
        assert!(events.iter().all(|e| e.task_id() == Some(outcome.task_id.as_str())));
    }

    #[test]
    fn nonzero_exit_without_marker_fails() {
        let fx = Fixture::new("echo boom 1>&2\nexit 1\n");
        let (outcome, rec) = fx.run();
        assert_eq!(outcome.result, WorkflowResult::Failed);
        assert_eq!(terminals(&rec), vec![WorkflowResult::Failed]);
        assert!(rec
            .events()
            .iter()
            .all(|e| e.fraction() != Some(1.0)));
    }

    #[test]
    fn marker_line_yields_single_invalid_on_clean_exit() {
        let fx = Fixture::new(
            "echo 'No valid frames after filtering; skipping file'\necho more output\nexit 0\n",
        );
        let (outcome, rec) = fx.run();
        assert_eq!(outcome.result, WorkflowResult::Invalid);
        assert_eq!(outcome.detail.as_deref(), Some(INVALID_DETAIL));
        assert_eq!(terminals(&rec), vec![WorkflowResult::Invalid]);
        let invalid = rec
            .events()
            .into_iter()
            .find(|e| e.workflow().is_some())
            .expect("terminal");
        assert_eq!(invalid.text(), Some(INVALID_DETAIL));
    }

    #[test]
    fn marker_line_yields_single_invalid_on_error_exit() {
        let fx = Fixture::new("echo 'frame 3: No valid frames after filtering; skipping file!'\nexit 1\n");
        let (outcome, rec) = fx.run();
        assert_eq!(outcome.result, WorkflowResult::Invalid);
        assert_eq!(terminals(&rec), vec![WorkflowResult::Invalid]);
    }

    #[test]
    fn missing_input_is_rejected_synchronously() {
        let fx = Fixture::new("exit 0\n");
        let bus = Arc::new(EventBus::new());
        let rec = Arc::new(Collector::default());
        bus.subscribe(&rec);
        let runner = ScriptRunner::new(fx.cfg(), bus);
        let err = runner
            .run_script(&fx.data.path().join("missing.wav"))
            .unwrap_err();
        assert_eq!(codes::error_code(&err), codes::E_INPUT_NOT_FOUND);
        assert!(rec.events().is_empty());
    }

    #[test]
    fn missing_interpreter_fails_with_env_not_ready() {
        let fx = Fixture::new("exit 0\n");
        fs::remove_file(python_runtime::default_python_path(fx.data.path())).expect("rm");
        let (outcome, rec) = fx.run();
        assert_eq!(outcome.result, WorkflowResult::Failed);
        assert_eq!(outcome.error_code.as_deref(), Some(codes::E_ENV_NOT_READY));
        assert_eq!(terminals(&rec), vec![WorkflowResult::Failed]);
    }

    #[test]
    fn missing_script_resource_fails() {
        let fx = Fixture::new("exit 0\n");
        fs::remove_file(fx.res.path().join("Vocal_Analysis_Script.py")).expect("rm");
        let (outcome, _) = fx.run();
        assert_eq!(outcome.result, WorkflowResult::Failed);
        assert_eq!(outcome.error_code.as_deref(), Some(codes::E_RESOURCE_NOT_FOUND));
    }

    #[test]
    fn dependency_and_probe_failures_end_in_failed() {
        let fx = Fixture::with_python("exit 0\n", 1, 0);
        let (outcome, rec) = fx.run();
        assert_eq!(outcome.error_code.as_deref(), Some(codes::E_DEPS_FAILED));
        assert_eq!(terminals(&rec), vec![WorkflowResult::Failed]);

        let fx = Fixture::with_python("exit 0\n", 0, 1);
        let (outcome, rec) = fx.run();
        assert_eq!(outcome.error_code.as_deref(), Some(codes::E_PROBE_FAILED));
        assert_eq!(terminals(&rec), vec![WorkflowResult::Failed]);
    }

    const RECORD_ARGV: &str = "printf '%s\\n' \"$@\" > argv.txt\nexit 0\n";

    fn recorded_argv(fx: &Fixture) -> Vec<String> {
        fs::read_to_string(fx.data.path().join("argv.txt"))
            .expect("argv")
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn model_is_passed_when_bundled() {
        let fx = Fixture::new(RECORD_ARGV);
        fs::write(fx.res.path().join("gender_model.joblib"), b"model").expect("model");
        let (outcome, _) = fx.run();
        assert_eq!(outcome.result, WorkflowResult::Success);
        let model = fx.data.path().join("gender_model.joblib");
        assert!(model.exists());
        assert_eq!(
            recorded_argv(&fx),
            vec![
                fx.input.display().to_string(),
                model.display().to_string(),
            ]
        );
    }

    #[test]
    fn model_is_omitted_when_not_bundled() {
        let fx = Fixture::new(RECORD_ARGV);
        let (outcome, _) = fx.run();
        assert_eq!(outcome.result, WorkflowResult::Success);
        assert_eq!(recorded_argv(&fx), vec![fx.input.display().to_string()]);
    }

    #[test]
    fn analysis_command_orders_script_input_model() {
        let data = Path::new("/data");
        let cmd = analysis_command(
            Path::new("/venv/bin/python"),
            Path::new("/data/Vocal_Analysis_Script.py"),
            Path::new("/rec/take.wav"),
            Some(Path::new("/data/gender_model.joblib")),
            data,
        );
        assert_eq!(cmd.program, PathBuf::from("/venv/bin/python"));
        assert_eq!(cmd.working_dir, PathBuf::from("/data"));
        assert_eq!(
            cmd.args,
            vec![
                std::ffi::OsString::from("/data/Vocal_Analysis_Script.py"),
                std::ffi::OsString::from("/rec/take.wav"),
                std::ffi::OsString::from("/data/gender_model.joblib"),
            ]
        );

        let bare = analysis_command(
            Path::new("/venv/bin/python"),
            Path::new("/data/Vocal_Analysis_Script.py"),
            Path::new("/rec/take.wav"),
            None,
            data,
        );
        assert_eq!(bare.args.len(), 2);
        assert_eq!(bare.args[1], std::ffi::OsString::from("/rec/take.wav"));
    }

    #[test]
    fn cancelling_a_run_publishes_cancelled_once() {
        let fx = Fixture::new("echo started\nsleep 30\nexit 0\n");
        let bus = Arc::new(EventBus::new());
        let rec = Arc::new(Collector::default());
        bus.subscribe(&rec);
        let mut cfg = EngineConfig::new(fx.data.path(), fx.res.path());
        cfg.poll_interval = Duration::from_millis(10);
        let runner = ScriptRunner::new(Arc::new(cfg), bus);
        let handle = runner.run_script(&fx.input).expect("start");

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !rec
            .events()
            .iter()
            .any(|e| e.text() == Some(steps::ANALYZE.0))
        {
            assert!(std::time::Instant::now() < deadline, "analysis never started");
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.cancel();
        let outcome = handle.join().expect("join");
        assert_eq!(outcome.result, WorkflowResult::Cancelled);
        assert_eq!(terminals(&rec), vec![WorkflowResult::Cancelled]);
    }

    #[test]
    fn cancel_after_invalid_keeps_the_invalid_outcome() {
        let fx = Fixture::new("echo 'No valid frames after filtering; skipping file'\nsleep 30\nexit 0\n");
        let bus = Arc::new(EventBus::new());
        let rec = Arc::new(Collector::default());
        bus.subscribe(&rec);
        let mut cfg = EngineConfig::new(fx.data.path(), fx.res.path());
        cfg.poll_interval = Duration::from_millis(10);
        let runner = ScriptRunner::new(Arc::new(cfg), bus);
        let handle = runner.run_script(&fx.input).expect("start");

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while terminals(&rec).is_empty() {
            assert!(std::time::Instant::now() < deadline, "marker never seen");
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.cancel();
        let outcome = handle.join().expect("join");
        assert_eq!(outcome.result, WorkflowResult::Invalid);
        assert_eq!(outcome.error_code, None);
        assert_eq!(outcome.detail.as_deref(), Some(INVALID_DETAIL));
        assert_eq!(terminals(&rec), vec![WorkflowResult::Invalid]);
    }

    #[test]
    fn panicking_subscriber_does_not_lose_the_terminal_result() {
        let fx = Fixture::new("exit 0\n");
        let bus = Arc::new(EventBus::new());
        let bad = Arc::new(|ev: Event| {
            if ev.kind() == EventKind::UpdateProgress {
                panic!("ui listener failed");
            }
        });
        let rec = Arc::new(Collector::default());
        bus.subscribe(&bad);
        bus.subscribe(&rec);
        let outcome = ScriptRunner::new(fx.cfg(), bus)
            .run_script(&fx.input)
            .expect("start")
            .join()
            .expect("join");
        assert_eq!(outcome.result, WorkflowResult::Success);
        assert_eq!(terminals(&rec), vec![WorkflowResult::Success]);
    }
}
