//! The engine state: everything one agent invocation mutates.
//!
//! All formerly-global state (class sets, default constraint values, the
//! collected report stream) lives in this value, created at startup and
//! threaded through every call. The pending-termination flag in
//! [`crate::signals`] is the only exception.

use std::sync::Arc;

use crate::eval::EvalContext;
use crate::lock::LockService;
use crate::store::{StoreError, StoreRegistry};

/// Per-run execution options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Make no changes, only warn about what would change.
    pub dry_run: bool,
    /// Ignore `ifelapsed` rate limiting (`--no-lock`).
    pub ignore_locks: bool,
    /// Default `ifelapsed` in minutes when a promise carries none.
    pub default_ifelapsed: i64,
    /// Default `expireafter` in minutes when a promise carries none.
    pub default_expireafter: i64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            ignore_locks: false,
            default_ifelapsed: 1,
            default_expireafter: 120,
        }
    }
}

/// Mutable state of one agent invocation.
pub struct EngineState {
    /// The evaluation context.
    pub ctx: EvalContext,
    /// Persistent store registry.
    pub stores: Arc<StoreRegistry>,
    /// Promise lock service; `None` when the locks database is frozen.
    pub locks: Option<LockService>,
    /// Execution options.
    pub opts: EngineOptions,
    /// Output of `reports` promises, in actuation order.
    pub reports: Vec<String>,
    /// Accumulated policy errors; past a threshold the run aborts before
    /// execution.
    pub policy_errors: usize,
    /// `CHANGE` outcomes recorded this run, for convergence detection.
    pub change_count: u64,
}

impl EngineState {
    /// Build engine state over a store registry. A broken locks database
    /// does not abort the run; locking degrades to `SKIPPED` with a
    /// warning.
    #[must_use]
    pub fn new(stores: Arc<StoreRegistry>, opts: EngineOptions) -> Self {
        let locks = match LockService::open(&stores) {
            Ok(service) => Some(service),
            Err(e) => {
                tracing::warn!(error = %e, "locks database unavailable, promises will skip");
                None
            }
        };
        Self {
            ctx: EvalContext::new(),
            stores,
            locks,
            opts,
            reports: Vec::new(),
            policy_errors: 0,
            change_count: 0,
        }
    }

    /// Record a policy error against the abort threshold.
    pub fn record_policy_error(&mut self) {
        self.policy_errors += 1;
    }

    /// Load persistent classes from the store into the hard class set.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn load_persistent_classes(&mut self) -> Result<(), StoreError> {
        let db = self.stores.open(crate::store::DbId::Classes)?;
        if let Err(e) = self.ctx.load_persistent_classes(&db) {
            tracing::warn!(error = %e, "failed to load persistent classes");
        }
        Ok(())
    }
}
