//! Stable error codes carried as message prefixes (`"E_X: detail"`).

pub const E_PROCESS_SPAWN: &str = "E_PROCESS_SPAWN";
pub const E_PROCESS_IO: &str = "E_PROCESS_IO";
pub const E_CANCELLED: &str = "E_CANCELLED";
pub const E_ENV_NOT_READY: &str = "E_ENV_NOT_READY";
pub const E_RESOURCE_NOT_FOUND: &str = "E_RESOURCE_NOT_FOUND";
pub const E_INPUT_NOT_FOUND: &str = "E_INPUT_NOT_FOUND";
pub const E_BOOTSTRAP_SETUP_FAILED: &str = "E_BOOTSTRAP_SETUP_FAILED";
pub const E_BOOTSTRAP_DEPS_FAILED: &str = "E_BOOTSTRAP_DEPS_FAILED";
pub const E_BOOTSTRAP_PROBE_FAILED: &str = "E_BOOTSTRAP_PROBE_FAILED";
pub const E_BOOTSTRAP_NO_INTERPRETER: &str = "E_BOOTSTRAP_NO_INTERPRETER";
pub const E_DEPS_FAILED: &str = "E_DEPS_FAILED";
pub const E_PROBE_FAILED: &str = "E_PROBE_FAILED";
pub const E_SCRIPT_FAILED: &str = "E_SCRIPT_FAILED";
pub const E_TASK_BUSY: &str = "E_TASK_BUSY";
pub const E_TASK_NOT_FOUND: &str = "E_TASK_NOT_FOUND";
pub const E_CONFIG: &str = "E_CONFIG";
pub const E_INTERNAL: &str = "E_INTERNAL";

const KNOWN: &[&str] = &[
    E_PROCESS_SPAWN,
    E_PROCESS_IO,
    E_CANCELLED,
    E_ENV_NOT_READY,
    E_RESOURCE_NOT_FOUND,
    E_INPUT_NOT_FOUND,
    E_BOOTSTRAP_SETUP_FAILED,
    E_BOOTSTRAP_DEPS_FAILED,
    E_BOOTSTRAP_PROBE_FAILED,
    E_BOOTSTRAP_NO_INTERPRETER,
    E_DEPS_FAILED,
    E_PROBE_FAILED,
    E_SCRIPT_FAILED,
    E_TASK_BUSY,
    E_TASK_NOT_FOUND,
    E_CONFIG,
];

fn detect_code(msg: &str) -> Option<&'static str> {
    let head = msg.split(':').next().unwrap_or("").trim();
    KNOWN.iter().copied().find(|c| *c == head)
}

/// Outermost known code in the error chain, `E_INTERNAL` when none matches.
pub fn error_code(err: &anyhow::Error) -> &'static str {
    err.chain()
        .find_map(|cause| detect_code(&cause.to_string()))
        .unwrap_or(E_INTERNAL)
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    error_code(err) == E_CANCELLED
}
