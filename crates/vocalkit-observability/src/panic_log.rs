use std::{fs::OpenOptions, io::Write, path::PathBuf};

use crate::trace::{now_ms, redact_user_paths};

// Panics on worker threads would otherwise go to stderr only, which is not
// attached for GUI builds. Append them to `panic.log` in the data dir instead,
// and never panic from inside the hook.
pub fn install_best_effort(data_dir: PathBuf) {
    std::panic::set_hook(Box::new(move |info| {
        let thread = std::thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_string();
        let bt = std::backtrace::Backtrace::force_capture();
        let msg = format!(
            "ts_ms={}\nthread={thread}\npanic={info}\nbacktrace={}\n---\n",
            now_ms(),
            redact_user_paths(&bt.to_string()),
        );

        let _ = std::fs::create_dir_all(&data_dir);
        if let Ok(mut f) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(data_dir.join("panic.log"))
        {
            let _ = f.write_all(msg.as_bytes());
        }
    }));
}
