// Best-effort stderr logging that never panics.
//
// With the Windows GUI subsystem (no console attached), `eprintln!` may panic
// on write errors, and a panic inside the panic hook aborts the process.

#[macro_export]
macro_rules! safe_eprintln {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), $($arg)*);
    }};
}
