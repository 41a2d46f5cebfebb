//! Console reporting.
//!
//! Progress lines are ephemeral: each one overwrites the previous via a
//! carriage return, so a long run shows a single moving status line.
//! Persistent lines (game echoes, warnings, errors) go through `tracing` and
//! must first blank whatever progress line is pending, otherwise the two
//! interleave into garbage.

use std::io::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};

static PENDING: AtomicUsize = AtomicUsize::new(0);

/// Writes an ephemeral status line, overwriting the previous one.
pub fn progress(msg: &str) {
    let prev = PENDING.swap(msg.chars().count(), Ordering::Relaxed);
    let pad = prev.saturating_sub(msg.chars().count());
    let mut err = std::io::stderr().lock();
    let _ = write!(err, "\r{msg}{:pad$}", "");
    let _ = err.flush();
}

/// Blanks any pending progress line so a persistent line starts clean.
pub fn clear_progress() {
    let prev = PENDING.swap(0, Ordering::Relaxed);
    if prev > 0 {
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r{:prev$}\r", "");
        let _ = err.flush();
    }
}

/// Writes a persistent line (survives subsequent progress updates).
pub fn persistent(msg: &str) {
    clear_progress();
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{msg}");
}
