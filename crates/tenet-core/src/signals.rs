//! Process-wide signal flags.
//!
//! The engine state is a value threaded through every call; the only
//! permitted globals are the atomics here, reserved for the signal-handler
//! fast path. Handlers must only flip these flags; every blocking call in
//! the daemon checks them before entering and after leaving.

use std::sync::atomic::{AtomicBool, Ordering};

static PENDING_TERMINATION: AtomicBool = AtomicBool::new(false);
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Request cooperative termination. Async-signal-safe.
pub fn set_pending_termination() {
    PENDING_TERMINATION.store(true, Ordering::Relaxed);
}

/// Whether termination has been requested.
#[must_use]
pub fn is_pending_termination() -> bool {
    PENDING_TERMINATION.load(Ordering::Relaxed)
}

/// Request a policy reload. Async-signal-safe.
pub fn request_reload() {
    RELOAD_REQUESTED.store(true, Ordering::Relaxed);
}

/// Consume a pending reload request, if any.
#[must_use]
pub fn take_reload_request() -> bool {
    RELOAD_REQUESTED.swap(false, Ordering::Relaxed)
}

/// Reset both flags. Test support and post-fork cleanup.
pub fn reset() {
    PENDING_TERMINATION.store(false, Ordering::Relaxed);
    RELOAD_REQUESTED.store(false, Ordering::Relaxed);
}
