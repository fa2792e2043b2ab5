//! Terminal harness for the analysis engine.
//!
//! - `bootstrap`: prepare the interpreter environment in the data dir
//! - `analyze <FILE>`: run the analysis script on one recording
//! - `clock`: print recording-clock ticks for a few seconds
//!
//! Every event is printed as one JSON line.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use vocalkit_core::{Event, EventBus, EventKind, WorkflowResult};
use vocalkit_engine::{
    codes,
    config::{self, EngineConfig},
    ui_channel, RecordingClock, TaskManager, UiLoop, WorkflowDispatcher,
};
use vocalkit_observability::{panic_log, safe_eprintln};

#[derive(Parser)]
#[command(name = "vocalkit-tools")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bootstrap the analysis environment and run analyses from a terminal", long_about = None)]
struct Cli {
    /// Data directory (default: VOCALKIT_DATA_DIR or the platform location)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Resource bundle directory (default: VOCALKIT_RESOURCE_DIR or bundled resources)
    #[arg(long, global = true)]
    resource_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the interpreter environment unless it is already ready
    Bootstrap,

    /// Run the analysis script on a recording
    Analyze {
        file: PathBuf,

        /// Cancel the run after this many seconds
        #[arg(long, default_value_t = 900)]
        timeout_secs: u64,
    },

    /// Print recording clock ticks
    Clock {
        #[arg(long, default_value_t = 3)]
        seconds: u64,
    },
}

fn emit(mut line: Value) {
    if let Value::Object(map) = &mut line {
        map.insert(
            "ts".to_string(),
            Value::String(chrono::Local::now().to_rfc3339()),
        );
    }
    println!("{line}");
}

struct JsonLines;

impl WorkflowDispatcher for JsonLines {
    fn on_progress(&mut self, status: &str, fraction: f64) {
        emit(json!({ "event": "UPDATE_PROGRESS", "status": status, "fraction": fraction }));
    }

    fn on_install(&mut self, event: &Event) {
        emit(json!({
            "event": event.kind().as_str(),
            "line": event.text(),
            "fraction": event.fraction(),
        }));
    }

    fn on_timer(&mut self, kind: EventKind, value: u64) {
        emit(json!({ "event": kind.as_str(), "value": value }));
    }

    fn on_result(&mut self, task_id: Option<&str>, result: WorkflowResult, detail: Option<&str>) {
        emit(json!({
            "event": "WORKFLOW_RESULT",
            "task_id": task_id,
            "result": result.as_str(),
            "remedy": result.remedy(),
            "detail": detail,
        }));
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut cfg = match &cli.data_dir {
        Some(dir) => {
            let settings = config::load_settings(dir)?;
            EngineConfig::from_settings(dir.clone(), &settings).with_env_overrides()
        }
        None => EngineConfig::load()?,
    };
    if let Some(res) = &cli.resource_dir {
        cfg.resource_dir = res.clone();
    }
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("create data dir failed: {}", cfg.data_dir.display()))?;
    Ok(cfg)
}

fn bootstrap(tm: &TaskManager, ui: &mut UiLoop<JsonLines>) -> Result<ExitCode> {
    let handle = tm.start_bootstrap()?;
    while !handle.is_finished() {
        ui.pump();
        thread::sleep(Duration::from_millis(50));
    }
    ui.pump();
    let report = handle.join()?;
    emit(json!({ "event": "BOOTSTRAP_DONE", "report": report }));
    Ok(ExitCode::SUCCESS)
}

fn analyze(
    tm: &TaskManager,
    ui: &mut UiLoop<JsonLines>,
    file: &Path,
    timeout: Duration,
) -> Result<ExitCode> {
    let handle = tm.run_script(file)?;
    if ui.pump_until_result(timeout).is_none() {
        safe_eprintln!("analysis timed out after {}s, cancelling", timeout.as_secs());
        handle.cancel();
    }
    let outcome = handle.join()?;
    ui.pump();
    Ok(match outcome.result {
        WorkflowResult::Success => ExitCode::SUCCESS,
        WorkflowResult::Invalid => ExitCode::from(2),
        WorkflowResult::Failed | WorkflowResult::Cancelled => ExitCode::from(1),
    })
}

fn clock(bus: Arc<EventBus>, ui: &mut UiLoop<JsonLines>, seconds: u64) -> Result<ExitCode> {
    let clock = RecordingClock::start(bus, Duration::from_secs(1))?;
    for _ in 0..seconds * 10 {
        thread::sleep(Duration::from_millis(100));
        ui.pump();
    }
    let elapsed = clock.stop();
    ui.pump();
    emit(json!({ "event": "CLOCK_STOPPED", "elapsed_secs": elapsed }));
    Ok(ExitCode::SUCCESS)
}

fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = load_config(&cli)?;
    panic_log::install_best_effort(cfg.data_dir.clone());

    let bus = Arc::new(EventBus::with_trace_dir(&cfg.data_dir));
    let (mailbox, inbox) = ui_channel();
    bus.subscribe(&mailbox);
    let mut ui = UiLoop::new(inbox, JsonLines);
    let tm = TaskManager::new(cfg, bus.clone());

    match &cli.command {
        Commands::Bootstrap => bootstrap(&tm, &mut ui),
        Commands::Analyze { file, timeout_secs } => {
            analyze(&tm, &mut ui, file, Duration::from_secs(*timeout_secs))
        }
        Commands::Clock { seconds } => clock(bus, &mut ui, *seconds),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            emit(json!({
                "event": "ERROR",
                "code": codes::error_code(&e),
                "message": format!("{e:#}"),
            }));
            ExitCode::from(1)
        }
    }
}
