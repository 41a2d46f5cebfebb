//! Bounded poll-with-fixed-delay waits.
//!
//! Every suspension point in the pipeline (completion manifest, per-batch
//! marker, discovered process id, tailed log growth) waits by polling. These
//! helpers make each such wait bounded and give it a typed outcome instead of
//! an unbounded `loop { sleep }`.

use std::time::{Duration, Instant};

use crate::error::{MapforgeError, MapforgeResult};

/// Delay between probes for filesystem markers.
pub const MARKER_INTERVAL: Duration = Duration::from_millis(400);

/// Delay between probes of the OS process table.
pub const PROCESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut { waited: Duration },
}

impl<T> WaitOutcome<T> {
    /// Converts a timeout into a [`MapforgeError::Timeout`] naming `what`.
    pub fn required(self, what: &str) -> MapforgeResult<T> {
        match self {
            WaitOutcome::Ready(v) => Ok(v),
            WaitOutcome::TimedOut { waited } => Err(MapforgeError::timeout(what, waited)),
        }
    }
}

/// Polls `probe` every `interval` until it yields a value or `limit` elapses.
///
/// The probe runs at least once, so a zero `limit` still observes an
/// already-ready condition.
pub fn wait_until<T>(
    limit: Duration,
    interval: Duration,
    mut probe: impl FnMut() -> Option<T>,
) -> WaitOutcome<T> {
    let start = Instant::now();
    loop {
        if let Some(v) = probe() {
            return WaitOutcome::Ready(v);
        }
        let waited = start.elapsed();
        if waited >= limit {
            return WaitOutcome::TimedOut { waited };
        }
        std::thread::sleep(interval.min(limit - waited));
    }
}

/// Waits for a file to exist, bounded by `limit`.
pub fn wait_for_file(path: &std::path::Path, limit: Duration) -> WaitOutcome<()> {
    wait_until(limit, MARKER_INTERVAL, || path.exists().then_some(()))
}
