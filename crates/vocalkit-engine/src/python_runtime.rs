use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::{config::EngineConfig, process::CommandSpec};

pub const VENV_DIR: &str = ".venv";
pub const READY_MARKER: &str = ".ready";

pub fn venv_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(VENV_DIR)
}

pub fn default_python_path(data_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        venv_dir(data_dir).join("Scripts").join("python.exe")
    } else {
        venv_dir(data_dir).join("bin").join("python")
    }
}

pub fn ready_marker_path(data_dir: &Path) -> PathBuf {
    venv_dir(data_dir).join(READY_MARKER)
}

/// The two filesystem facts that decide whether setup can be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnvironmentFacts {
    pub ready_marker: bool,
    pub interpreter: bool,
}

impl EnvironmentFacts {
    pub fn probe(cfg: &EngineConfig) -> Self {
        Self {
            ready_marker: ready_marker_path(&cfg.data_dir).exists(),
            interpreter: cfg.python_path().exists(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready_marker && self.interpreter
    }
}

/// Interpreter for a script run. Unlike [`EngineConfig::python_path`] this
/// requires the file to exist.
pub fn resolve_python_binary(cfg: &EngineConfig) -> Result<PathBuf> {
    if let Some(p) = &cfg.python_override {
        if p.exists() {
            return Ok(p.clone());
        }
        return Err(anyhow!(
            "E_ENV_NOT_READY: configured python points to missing file: {}",
            p.display()
        ));
    }
    let p = default_python_path(&cfg.data_dir);
    if p.exists() {
        return Ok(p);
    }
    Err(anyhow!(
        "E_ENV_NOT_READY: missing python interpreter at {} (run bootstrap first)",
        p.display()
    ))
}

pub fn write_ready_marker(data_dir: &Path) -> Result<()> {
    let p = ready_marker_path(data_dir);
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create {} failed", parent.display()))?;
    }
    fs::write(&p, b"").with_context(|| format!("write ready marker {} failed", p.display()))
}

/// Returns whether a marker was present.
pub fn clear_ready_marker(data_dir: &Path) -> bool {
    fs::remove_file(ready_marker_path(data_dir)).is_ok()
}

/// `sh <script>` on unix, `cmd.exe /c call <script>` on Windows.
pub fn setup_command(script: &Path, data_dir: &Path) -> CommandSpec {
    if cfg!(windows) {
        CommandSpec::new("cmd.exe", data_dir)
            .arg("/c")
            .arg("call")
            .arg(script)
    } else {
        CommandSpec::new("sh", data_dir).arg(script)
    }
}

/// `pip install -r <manifest>` when a manifest exists, else the fallback packages.
pub fn dependency_command(
    python: &Path,
    data_dir: &Path,
    manifest: Option<&Path>,
    fallback_packages: &[String],
) -> CommandSpec {
    let base = CommandSpec::new(python, data_dir)
        .arg("-m")
        .arg("pip")
        .arg("install");
    match manifest {
        Some(m) => base.arg("-r").arg(m),
        None => fallback_packages.iter().fold(base, |cmd, pkg| cmd.arg(pkg)),
    }
}

pub fn probe_command(python: &Path, data_dir: &Path, probe_code: &str) -> CommandSpec {
    CommandSpec::new(python, data_dir).arg("-c").arg(probe_code)
}
