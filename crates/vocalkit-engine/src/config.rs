use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const DATA_DIR_ENV: &str = "VOCALKIT_DATA_DIR";
pub const RESOURCE_DIR_ENV: &str = "VOCALKIT_RESOURCE_DIR";
pub const PYTHON_ENV: &str = "VOCALKIT_PYTHON";

pub const DEFAULT_SETUP_SCRIPT: &str = if cfg!(windows) {
    "pythonInstall.bat"
} else {
    "pythonInstall.sh"
};
pub const DEFAULT_MANIFEST: &str = "requirements.txt";
pub const DEFAULT_ANALYSIS_SCRIPT: &str = "Vocal_Analysis_Script.py";
pub const DEFAULT_MODEL: &str = "gender_model.joblib";
pub const DEFAULT_INVALID_MARKER: &str = "No valid frames after filtering; skipping file";
pub const DEFAULT_FALLBACK_PACKAGES: &[&str] = &["matplotlib"];
pub const DEFAULT_PROBE_CODE: &str = "import sys; print('[PyProbe] exe:', sys.executable); \
import matplotlib; print('[PyProbe] matplotlib version:', matplotlib.__version__)";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Persisted overrides in `settings.json`. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub resource_dir: Option<String>,
    pub python: Option<String>,
    pub setup_script: Option<String>,
    pub manifest: Option<String>,
    pub analysis_script: Option<String>,
    pub model: Option<String>,
    pub invalid_marker: Option<String>,
    pub fallback_packages: Option<Vec<String>>,
    pub probe_code: Option<String>,
    pub poll_interval_ms: Option<u64>,
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn load_settings(data_dir: &Path) -> Result<Settings> {
    let p = settings_path(data_dir);
    if !p.exists() {
        return Ok(Settings::default());
    }
    let s = fs::read_to_string(&p).context("E_CONFIG: read settings.json failed")?;
    let v: Settings = serde_json::from_str(&s).context("E_CONFIG: parse settings.json failed")?;
    Ok(v)
}

pub fn save_settings(data_dir: &Path, settings: &Settings) -> Result<()> {
    fs::create_dir_all(data_dir).ok();
    let p = settings_path(data_dir);
    let s = serde_json::to_string_pretty(settings).context("serialize settings failed")?;
    fs::write(&p, s).context("E_CONFIG: write settings.json failed")?;
    Ok(())
}

fn env_path(key: &str) -> Option<PathBuf> {
    let raw = std::env::var(key).ok()?;
    let t = raw.trim();
    if t.is_empty() {
        None
    } else {
        Some(PathBuf::from(t))
    }
}

/// Writable per-user data directory: `VOCALKIT_DATA_DIR`, else the platform
/// local app-data location.
pub fn data_dir() -> Result<PathBuf> {
    if let Some(p) = env_path(DATA_DIR_ENV) {
        return Ok(p);
    }
    if cfg!(windows) {
        if let Some(local) = env_path("LOCALAPPDATA") {
            return Ok(local.join("VocalAnalysisTool"));
        }
    }
    if let Some(xdg) = env_path("XDG_DATA_HOME") {
        return Ok(xdg.join("vocalkit"));
    }
    let home = env_path("HOME")
        .or_else(|| env_path("USERPROFILE"))
        .ok_or_else(|| anyhow!("E_CONFIG: cannot locate a home directory for the data dir"))?;
    Ok(home.join(".local").join("share").join("vocalkit"))
}

/// Bundled resources shipped next to this crate, used when nothing else is set.
pub fn default_resource_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("resources")
}

/// Everything a bootstrap or script run needs to know about its environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub resource_dir: PathBuf,
    pub python_override: Option<PathBuf>,
    pub setup_script: String,
    pub manifest: String,
    pub analysis_script: String,
    pub model: String,
    pub invalid_marker: String,
    pub fallback_packages: Vec<String>,
    pub probe_code: String,
    pub poll_interval: Duration,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>, resource_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            resource_dir: resource_dir.into(),
            python_override: None,
            setup_script: DEFAULT_SETUP_SCRIPT.to_string(),
            manifest: DEFAULT_MANIFEST.to_string(),
            analysis_script: DEFAULT_ANALYSIS_SCRIPT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            invalid_marker: DEFAULT_INVALID_MARKER.to_string(),
            fallback_packages: DEFAULT_FALLBACK_PACKAGES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            probe_code: DEFAULT_PROBE_CODE.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    /// Resolves the data dir, reads its `settings.json` and applies env overrides.
    pub fn load() -> Result<Self> {
        let data_dir = data_dir()?;
        let settings = load_settings(&data_dir)?;
        Ok(Self::from_settings(data_dir, &settings).with_env_overrides())
    }

    pub fn from_settings(data_dir: PathBuf, s: &Settings) -> Self {
        let resource_dir = s
            .resource_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(default_resource_dir);
        let mut cfg = Self::new(data_dir, resource_dir);
        cfg.python_override = s.python.as_deref().map(PathBuf::from);
        if let Some(v) = &s.setup_script {
            cfg.setup_script = v.clone();
        }
        if let Some(v) = &s.manifest {
            cfg.manifest = v.clone();
        }
        if let Some(v) = &s.analysis_script {
            cfg.analysis_script = v.clone();
        }
        if let Some(v) = &s.model {
            cfg.model = v.clone();
        }
        if let Some(v) = &s.invalid_marker {
            cfg.invalid_marker = v.clone();
        }
        if let Some(v) = &s.fallback_packages {
            cfg.fallback_packages = v.clone();
        }
        if let Some(v) = &s.probe_code {
            cfg.probe_code = v.clone();
        }
        if let Some(ms) = s.poll_interval_ms {
            cfg.poll_interval = Duration::from_millis(ms.max(1));
        }
        cfg
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(p) = env_path(RESOURCE_DIR_ENV) {
            self.resource_dir = p;
        }
        if let Some(p) = env_path(PYTHON_ENV) {
            self.python_override = Some(p);
        }
        self
    }

    /// Interpreter used for every run: the explicit override, else the venv one.
    pub fn python_path(&self) -> PathBuf {
        self.python_override
            .clone()
            .unwrap_or_else(|| crate::python_runtime::default_python_path(&self.data_dir))
    }
}
