//! Cleanup on external interrupt.
//!
//! Drop guards cover the normal and error paths, but an interrupt signal
//! bypasses unwinding entirely. Components with state that must not survive
//! an interrupt (a running game process, the flipped mod-list toggle, a
//! per-run temp environment) register a cleanup action here and dismiss it
//! once their guard has handled things. The binary's signal handler fires
//! whatever is still registered, newest first, before exiting.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

type Action = Box<dyn FnOnce() + Send>;

/// An ordered set of pending cleanup actions.
pub struct Registry {
    next_id: AtomicU64,
    actions: Mutex<Vec<(u64, Action)>>,
}

/// Handle for a registered action; pass it to [`Registry::dismiss`] once the
/// normal cleanup path has taken over.
pub struct CleanupToken(u64);

impl Registry {
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            actions: Mutex::new(Vec::new()),
        }
    }

    pub fn on_interrupt(&self, action: impl FnOnce() + Send + 'static) -> CleanupToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.actions
            .lock()
            .expect("interrupt registry poisoned")
            .push((id, Box::new(action)));
        CleanupToken(id)
    }

    pub fn dismiss(&self, token: CleanupToken) {
        self.actions
            .lock()
            .expect("interrupt registry poisoned")
            .retain(|(id, _)| *id != token.0);
    }

    /// Runs every still-registered action, newest first.
    pub fn fire_all(&self) {
        let mut actions =
            std::mem::take(&mut *self.actions.lock().expect("interrupt registry poisoned"));
        while let Some((_, action)) = actions.pop() {
            action();
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

static DEFAULT: Registry = Registry::new();

/// Registers on the process-wide registry the signal handler fires.
pub fn on_interrupt(action: impl FnOnce() + Send + 'static) -> CleanupToken {
    DEFAULT.on_interrupt(action)
}

pub fn dismiss(token: CleanupToken) {
    DEFAULT.dismiss(token)
}

pub fn fire_all() {
    DEFAULT.fire_all()
}
