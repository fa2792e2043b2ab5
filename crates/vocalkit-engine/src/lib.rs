//! Background work for the vocal analysis tool: interpreter bootstrap,
//! supervised subprocesses and analysis script runs, all reporting through
//! a [`vocalkit_core::EventBus`].

pub mod bootstrap;
pub mod codes;
pub mod config;
pub mod dispatch;
pub mod process;
pub mod python_runtime;
pub mod recording_clock;
pub mod resources;
pub mod script_runner;
pub mod task;
pub mod task_manager;

pub use bootstrap::{BootstrapReport, BootstrapState, Bootstrapper};
pub use config::EngineConfig;
pub use dispatch::{ui_channel, UiInbox, UiLoop, UiMailbox, WorkflowDispatcher};
pub use process::{CommandSpec, ProcessResult, ProcessSupervisor};
pub use recording_clock::RecordingClock;
pub use script_runner::{RunOutcome, ScriptRunner};
pub use task::TaskHandle;
pub use task_manager::{TaskKind, TaskManager};
