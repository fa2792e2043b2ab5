use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Error as AnyhowError;
use serde::Serialize;
use serde_json::Value;

const DEFAULT_TRACE_MAX_BYTES: u64 = 10_000_000; // 10MB
const DEFAULT_TRACE_MAX_FILES: usize = 5;
const DEFAULT_BACKTRACE_MAX_CHARS: usize = 12_000;
const TRACE_FILE: &str = "trace.jsonl";

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Reads a boolean switch that is on unless explicitly turned off.
pub fn env_flag_default_on(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            let t = v.trim().to_ascii_lowercase();
            !matches!(t.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => true,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Trace knobs, re-read on every write so tests and operators can flip them at runtime.
#[derive(Debug, Clone, Copy)]
struct TraceSettings {
    enabled: bool,
    backtrace: bool,
    max_bytes: u64,
    max_files: usize,
}

impl TraceSettings {
    fn from_env() -> Self {
        Self {
            enabled: env_flag_default_on("VOCALKIT_TRACE_ENABLED"),
            backtrace: env_flag_default_on("VOCALKIT_TRACE_BACKTRACE"),
            max_bytes: env_parse("VOCALKIT_TRACE_MAX_BYTES", DEFAULT_TRACE_MAX_BYTES),
            max_files: env_parse("VOCALKIT_TRACE_MAX_FILES", DEFAULT_TRACE_MAX_FILES),
        }
    }
}

pub fn enabled() -> bool {
    TraceSettings::from_env().enabled
}

pub fn trace_path(data_dir: &Path) -> PathBuf {
    data_dir.join(TRACE_FILE)
}

fn rotated_path(data_dir: &Path, n: usize) -> PathBuf {
    data_dir.join(format!("{TRACE_FILE}.{n}"))
}

fn rotate_if_needed(data_dir: &Path, settings: &TraceSettings) {
    if settings.max_files == 0 {
        return;
    }
    let current = trace_path(data_dir);
    let Ok(meta) = std::fs::metadata(&current) else {
        return;
    };
    if meta.len() <= settings.max_bytes {
        return;
    }

    // Drop the oldest first; rename onto an existing file fails on Windows.
    let _ = std::fs::remove_file(rotated_path(data_dir, settings.max_files));
    for i in (1..settings.max_files).rev() {
        let src = rotated_path(data_dir, i);
        if src.exists() {
            let _ = std::fs::rename(&src, rotated_path(data_dir, i + 1));
        }
    }
    let _ = std::fs::rename(&current, rotated_path(data_dir, 1));
}

fn write_lock() -> &'static Mutex<()> {
    static TRACE_WRITE_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    TRACE_WRITE_LOCK.get_or_init(|| Mutex::new(()))
}

/// Appends one JSON line to the trace file. Never fails the caller.
pub fn emit_best_effort(data_dir: &Path, ev: &TraceEvent) {
    let settings = TraceSettings::from_env();
    if !settings.enabled {
        return;
    }
    let line = match serde_json::to_string(ev) {
        Ok(mut s) => {
            s.push('\n');
            s
        }
        Err(e) => {
            crate::safe_eprintln!("trace: serialize failed: {e}");
            return;
        }
    };

    let _guard = write_lock()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let _ = std::fs::create_dir_all(data_dir);
    rotate_if_needed(data_dir, &settings);

    let p = trace_path(data_dir);
    let res = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&p)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = res {
        crate::safe_eprintln!("trace: append failed: {}: {e}", p.display());
    }
}

fn clamp_chars(s: &str, max_chars: usize) -> String {
    s.chars().filter(|c| *c != '\0').take(max_chars).collect()
}

/// Scrubs the user-name segment of home-directory paths.
pub fn redact_user_paths(s: &str) -> String {
    fn scrub_after(hay: &str, marker: &str, sep: char) -> String {
        let mut out = String::with_capacity(hay.len());
        let mut rest = hay;
        while let Some(pos) = rest.find(marker) {
            out.push_str(&rest[..pos + marker.len()]);
            out.push_str("<redacted>");
            let after = &rest[pos + marker.len()..];
            let name_len = after.find(sep).unwrap_or(after.len());
            rest = &after[name_len..];
        }
        out.push_str(rest);
        out
    }

    let t = scrub_after(s, "\\Users\\", '\\');
    let t = scrub_after(&t, "/Users/", '/');
    scrub_after(&t, "/home/", '/')
}

fn backtrace_string(settings: &TraceSettings) -> Option<String> {
    if !settings.backtrace {
        return None;
    }
    let bt = format!("{:?}", std::backtrace::Backtrace::force_capture());
    Some(clamp_chars(
        &redact_user_paths(&bt),
        DEFAULT_BACKTRACE_MAX_CHARS,
    ))
}

fn merge_ctx(mut base: serde_json::Map<String, Value>, extra: Option<Value>) -> Value {
    match extra {
        None => {}
        Some(Value::Object(m)) => base.extend(m),
        Some(v) => {
            base.insert("extra".to_string(), v);
        }
    }
    Value::Object(base)
}

fn ctx_with_diagnostics(err: Option<&AnyhowError>, extra: Option<Value>) -> Option<Value> {
    let settings = TraceSettings::from_env();
    let mut m = serde_json::Map::new();
    if let Some(err) = err {
        let chain: Vec<String> = err.chain().map(|e| e.to_string()).collect();
        m.insert("err_chain".to_string(), serde_json::json!(chain));
    }
    if let Some(bt) = backtrace_string(&settings) {
        m.insert("backtrace".to_string(), Value::String(bt));
    }
    if m.is_empty() {
        return extra;
    }
    Some(merge_ctx(m, extra))
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub kind: String,    // process|io|logic|listener|unknown
    pub code: String,    // E_*
    pub message: String, // short
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub task_id: Option<String>,
    pub stage: String,
    pub step_id: String,
    pub op: String,     // start|end|event
    pub status: String, // ok|err|skipped|aborted
    pub duration_ms: Option<u128>,
    pub error: Option<TraceError>,
    pub ctx: Option<Value>,
}

pub fn event(
    data_dir: &Path,
    task_id: Option<&str>,
    stage: &str,
    step_id: &str,
    status: &str,
    ctx: Option<Value>,
) {
    emit_best_effort(
        data_dir,
        &TraceEvent {
            ts_ms: now_ms(),
            task_id: task_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "event".to_string(),
            status: status.to_string(),
            duration_ms: None,
            error: None,
            ctx,
        },
    );
}

/// A timed step. Emits `start` on creation and exactly one `end` record:
/// through `ok`/`err`/`skipped`, or `aborted` when dropped unfinished.
pub struct Span {
    data_dir: PathBuf,
    task_id: Option<String>,
    stage: String,
    step_id: String,
    t0: Instant,
    finished: bool,
}

impl Span {
    pub fn start(
        data_dir: &Path,
        task_id: Option<&str>,
        stage: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Self {
        let span = Self {
            data_dir: data_dir.to_path_buf(),
            task_id: task_id.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            t0: Instant::now(),
            finished: false,
        };
        span.emit("start", "ok", None, None, ctx);
        span
    }

    fn emit(
        &self,
        op: &str,
        status: &str,
        duration_ms: Option<u128>,
        error: Option<TraceError>,
        ctx: Option<Value>,
    ) {
        emit_best_effort(
            &self.data_dir,
            &TraceEvent {
                ts_ms: now_ms(),
                task_id: self.task_id.clone(),
                stage: self.stage.clone(),
                step_id: self.step_id.clone(),
                op: op.to_string(),
                status: status.to_string(),
                duration_ms,
                error,
                ctx,
            },
        );
    }

    fn finish(&mut self, status: &str, error: Option<TraceError>, ctx: Option<Value>) {
        self.finished = true;
        let elapsed = self.t0.elapsed().as_millis();
        self.emit("end", status, Some(elapsed), error, ctx);
    }

    pub fn ok(mut self, ctx: Option<Value>) {
        self.finish("ok", None, ctx);
    }

    pub fn skipped(mut self, reason: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: "logic".to_string(),
            code: "SKIPPED".to_string(),
            message: reason.to_string(),
        };
        self.finish("skipped", Some(error), ctx);
    }

    pub fn err(mut self, kind: &str, code: &str, message: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        };
        self.finish("err", Some(error), ctx_with_diagnostics(None, ctx));
    }

    pub fn err_anyhow(mut self, kind: &str, code: &str, err: &AnyhowError, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: err.to_string(),
        };
        self.finish("err", Some(error), ctx_with_diagnostics(Some(err), ctx));
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = TraceError {
            kind: "logic".to_string(),
            code: "ABORTED".to_string(),
            message: "span dropped without explicit ok/err".to_string(),
        };
        let ctx = ctx_with_diagnostics(None, None);
        self.finish("aborted", Some(error), ctx);
    }
}
