use std::{
    ffi::{OsStr, OsString},
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;
use vocalkit_observability::{
    safe_eprintln,
    trace::{self, Span},
};

/// Inherited variables that would point the child at a foreign interpreter.
pub const STRIPPED_ENV: [&str; 2] = ["PYTHONHOME", "PYTHONPATH"];

/// Forced on every child unless the caller overrides them.
pub const DEFAULT_ENV: [(&str, &str); 2] = [("MPLBACKEND", "Agg"), ("PYTHONIOENCODING", "utf-8")];

const LOG_TAIL_LINES: usize = 20;

/// How long a cancelled run waits for its output reader to reach EOF.
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    pub env_overrides: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env_overrides: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_overrides.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        let mut s = self.program.display().to_string();
        for a in &self.args {
            s.push(' ');
            s.push_str(&a.to_string_lossy());
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// `-1` when the child ended without an exit code (killed by a signal).
    pub exit_code: i32,
    pub aggregated_log: Vec<String>,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn tail(&self, n: usize) -> &[String] {
        let start = self.aggregated_log.len().saturating_sub(n);
        &self.aggregated_log[start..]
    }

    pub fn last_line(&self) -> &str {
        self.aggregated_log.last().map(String::as_str).unwrap_or("")
    }
}

/// Environment the child sees on top of the inherited one: defaults first,
/// caller overrides after, the stripped variables never.
pub fn child_env(overrides: &[(String, String)]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = DEFAULT_ENV
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for (k, v) in overrides {
        if STRIPPED_ENV.contains(&k.as_str()) {
            continue;
        }
        match out.iter_mut().find(|(existing, _)| existing == k) {
            Some(slot) => slot.1 = v.clone(),
            None => out.push((k.clone(), v.clone())),
        }
    }
    out
}

fn apply_env(cmd: &mut Command, overrides: &[(String, String)]) {
    for k in STRIPPED_ENV {
        cmd.env_remove(k);
    }
    for (k, v) in child_env(overrides) {
        cmd.env(k, v);
    }
}

enum StreamMsg {
    Line(String),
    ReadError(String),
}

fn spawn_reader<R: Read + Send + 'static>(
    name: &str,
    stream: R,
    tx: mpsc::Sender<StreamMsg>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(StreamMsg::Line(line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(StreamMsg::ReadError(e.to_string()));
                    break;
                }
            }
        }
    })
}

fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        safe_eprintln!("process supervisor: kill failed: {e}");
    }
    let _ = child.wait();
}

/// Runs external commands to completion on the calling thread, merging
/// stdout and stderr into one line stream.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    data_dir: PathBuf,
    task_id: Option<String>,
    poll: Duration,
}

impl ProcessSupervisor {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            task_id: None,
            poll: Duration::from_millis(crate::config::DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn with_task_id(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Blocks until the child exits. Each line reaches `on_line` before it is
    /// appended to the aggregated log. A non-zero exit is returned, not raised;
    /// errors are reserved for spawn/read failures and cancellation.
    pub fn run<F>(
        &self,
        spec: &CommandSpec,
        mut on_line: F,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult>
    where
        F: FnMut(&str),
    {
        let span = Span::start(
            &self.data_dir,
            self.task_id.as_deref(),
            "Process",
            "PROC.run",
            Some(serde_json::json!({
                "program": spec.program.display().to_string(),
                "args": spec.args.len(),
                "cwd": spec.working_dir.display().to_string(),
            })),
        );

        match self.run_inner(spec, &mut on_line, cancel) {
            Ok(result) => {
                span.ok(Some(serde_json::json!({
                    "exit_code": result.exit_code,
                    "lines": result.aggregated_log.len(),
                    "tail": result.tail(LOG_TAIL_LINES),
                })));
                Ok(result)
            }
            Err(e) => {
                let code = crate::codes::error_code(&e);
                span.err_anyhow("process", code, &e, None);
                Err(e)
            }
        }
    }

    fn run_inner(
        &self,
        spec: &CommandSpec,
        on_line: &mut dyn FnMut(&str),
        cancel: &CancellationToken,
    ) -> Result<ProcessResult> {
        if cancel.is_cancelled() {
            return Err(anyhow!("E_CANCELLED: cancelled before start"));
        }

        let (output, writer) =
            io::pipe().context("E_PROCESS_SPAWN: failed to create output pipe")?;
        let err_writer = writer
            .try_clone()
            .context("E_PROCESS_SPAWN: failed to share output pipe")?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(err_writer);
        apply_env(&mut cmd, &spec.env_overrides);

        let spawned = cmd.spawn();
        // The command still owns our copies of the write end; EOF needs them closed.
        drop(cmd);
        let mut child =
            spawned.with_context(|| format!("E_PROCESS_SPAWN: failed to start {}", spec.display()))?;

        let (tx, rx) = mpsc::channel::<StreamMsg>();
        let reader = match spawn_reader("proc-output", output, tx) {
            Ok(r) => r,
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(anyhow!("E_PROCESS_SPAWN: failed to start output reader: {e}"));
            }
        };

        let mut log = Vec::new();
        let mut read_error = None;
        loop {
            if cancel.is_cancelled() {
                kill_and_reap(&mut child);
                self.release_reader(reader, &rx);
                return Err(anyhow!("E_CANCELLED: {} was stopped", spec.display()));
            }
            match rx.recv_timeout(self.poll) {
                Ok(StreamMsg::Line(line)) => {
                    on_line(&line);
                    log.push(line);
                }
                Ok(StreamMsg::ReadError(e)) => {
                    read_error.get_or_insert(e);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        let _ = reader.join();

        let status = loop {
            if let Some(status) = child
                .try_wait()
                .context("E_PROCESS_IO: waiting for child failed")?
            {
                break status;
            }
            if cancel.is_cancelled() {
                kill_and_reap(&mut child);
                return Err(anyhow!("E_CANCELLED: {} was stopped", spec.display()));
            }
            thread::sleep(self.poll);
        };

        if let Some(e) = read_error {
            return Err(anyhow!("E_PROCESS_IO: reading output of {} failed: {e}", spec.display()));
        }

        Ok(ProcessResult {
            exit_code: status.code().unwrap_or(-1),
            aggregated_log: log,
        })
    }

    /// Waits a bounded time for the reader to see EOF after a kill. A
    /// grandchild that inherited the pipe keeps it open; then the reader is
    /// left to finish on its own and the trace records it.
    fn release_reader(&self, reader: thread::JoinHandle<()>, rx: &mpsc::Receiver<StreamMsg>) {
        let deadline = Instant::now() + READER_GRACE;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match rx.recv_timeout(left) {
                Ok(_) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let _ = reader.join();
                    return;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => break,
            }
        }
        trace::event(
            &self.data_dir,
            self.task_id.as_deref(),
            "Process",
            "PROC.reader_detached",
            "skipped",
            Some(serde_json::json!({ "grace_ms": READER_GRACE.as_millis() as u64 })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes;

    fn env_value<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn child_env_forces_defaults() {
        let env = child_env(&[]);
        assert_eq!(env_value(&env, "MPLBACKEND"), Some("Agg"));
        assert_eq!(env_value(&env, "PYTHONIOENCODING"), Some("utf-8"));
    }

    #[test]
    fn overrides_win_but_never_reintroduce_stripped_vars() {
        let env = child_env(&[
            ("MPLBACKEND".to_string(), "TkAgg".to_string()),
            ("PYTHONPATH".to_string(), "/evil".to_string()),
            ("PYTHONHOME".to_string(), "/evil".to_string()),
            ("EXTRA".to_string(), "1".to_string()),
        ]);
        assert_eq!(env_value(&env, "MPLBACKEND"), Some("TkAgg"));
        assert_eq!(env_value(&env, "EXTRA"), Some("1"));
        assert_eq!(env_value(&env, "PYTHONPATH"), None);
        assert_eq!(env_value(&env, "PYTHONHOME"), None);
    }

    #[test]
    fn spawn_failure_is_an_error_not_an_exit_code() {
        let td = tempfile::tempdir().expect("tempdir");
        let sup = ProcessSupervisor::new(td.path());
        let spec = CommandSpec::new(td.path().join("does-not-exist"), td.path());
        let err = sup
            .run(&spec, |_| {}, &CancellationToken::new())
            .unwrap_err();
        assert_eq!(codes::error_code(&err), codes::E_PROCESS_SPAWN);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::time::Instant;

        fn sh(td: &Path, script: &str) -> CommandSpec {
            CommandSpec::new("/bin/sh", td).arg("-c").arg(script)
        }

        #[test]
        fn merges_streams_and_returns_nonzero_exit() {
            let td = tempfile::tempdir().expect("tempdir");
            let sup = ProcessSupervisor::new(td.path());
            let mut seen = Vec::new();
            let res = sup
                .run(
                    &sh(td.path(), "echo out; echo err 1>&2; exit 3"),
                    |l| seen.push(l.to_string()),
                    &CancellationToken::new(),
                )
                .expect("run");
            assert_eq!(res.exit_code, 3);
            assert!(!res.success());
            assert_eq!(seen, vec!["out".to_string(), "err".to_string()]);
            assert_eq!(res.aggregated_log, seen);
            assert_eq!(res.last_line(), "err");
        }

        #[test]
        fn interleaved_stdout_and_stderr_keep_write_order() {
            let td = tempfile::tempdir().expect("tempdir");
            let sup = ProcessSupervisor::new(td.path());
            let expected: Vec<String> = ["a", "b", "c", "d", "e"].map(String::from).to_vec();
            for _ in 0..20 {
                let res = sup
                    .run(
                        &sh(
                            td.path(),
                            "echo a; echo b 1>&2; echo c; echo d 1>&2; echo e",
                        ),
                        |_| {},
                        &CancellationToken::new(),
                    )
                    .expect("run");
                assert_eq!(res.aggregated_log, expected);
            }
        }

        #[test]
        fn cancellation_does_not_wait_for_grandchild_holding_the_pipe() {
            let td = tempfile::tempdir().expect("tempdir");
            let sup = ProcessSupervisor::new(td.path()).with_poll_interval(Duration::from_millis(10));
            let token = CancellationToken::new();
            let t2 = token.clone();
            let started = Instant::now();
            let err = sup
                .run(
                    &sh(td.path(), "(sleep 30; echo late) & echo begin; wait"),
                    move |l| {
                        if l == "begin" {
                            t2.cancel();
                        }
                    },
                    &token,
                )
                .unwrap_err();
            assert!(codes::is_cancelled(&err));
            assert!(started.elapsed() < READER_GRACE + Duration::from_secs(5));
        }

        #[test]
        fn callback_sees_lines_in_stream_order() {
            let td = tempfile::tempdir().expect("tempdir");
            let sup = ProcessSupervisor::new(td.path());
            let mut seen = Vec::new();
            let res = sup
                .run(
                    &sh(td.path(), "for i in 1 2 3 4 5; do echo line$i; done"),
                    |l| seen.push(l.to_string()),
                    &CancellationToken::new(),
                )
                .expect("run");
            assert!(res.success());
            assert_eq!(seen, res.aggregated_log);
            assert_eq!(res.last_line(), "line5");
        }

        #[test]
        fn child_does_not_inherit_python_path_vars() {
            let _g = crate::config::tests::env_lock();
            std::env::set_var("PYTHONPATH", "/inherited");
            let td = tempfile::tempdir().expect("tempdir");
            let sup = ProcessSupervisor::new(td.path());
            let spec = sh(
                td.path(),
                "echo \"pp=${PYTHONPATH:-unset} mpl=$MPLBACKEND enc=$PYTHONIOENCODING\"",
            )
            .env("PYTHONPATH", "/override");
            let res = sup.run(&spec, |_| {}, &CancellationToken::new());
            std::env::remove_var("PYTHONPATH");
            let res = res.expect("run");
            assert_eq!(res.aggregated_log, vec!["pp=unset mpl=Agg enc=utf-8".to_string()]);
        }

        #[test]
        fn cancellation_kills_the_child() {
            let td = tempfile::tempdir().expect("tempdir");
            let sup = ProcessSupervisor::new(td.path()).with_poll_interval(Duration::from_millis(10));
            let token = CancellationToken::new();
            let t2 = token.clone();
            let started = Instant::now();
            let err = sup
                .run(
                    &sh(td.path(), "echo begin; sleep 30; echo never"),
                    move |l| {
                        if l == "begin" {
                            t2.cancel();
                        }
                    },
                    &token,
                )
                .unwrap_err();
            assert!(codes::is_cancelled(&err));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn signal_termination_reports_minus_one() {
            let td = tempfile::tempdir().expect("tempdir");
            let sup = ProcessSupervisor::new(td.path());
            let res = sup
                .run(&sh(td.path(), "kill -9 $$"), |_| {}, &CancellationToken::new())
                .expect("run");
            assert_eq!(res.exit_code, -1);
        }
    }
}
