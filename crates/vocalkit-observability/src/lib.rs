//! Best-effort diagnostics shared by every vocalkit crate: JSONL trace spans,
//! metrics records, a panic hook and a stderr macro that never panics.

pub mod metrics;
pub mod panic_log;
pub mod safe_print;
pub mod trace;

pub use trace::Span;
