//! The promise dispatcher.
//!
//! The full pipeline for one promise:
//!
//! 1. Skip everything if the class guard is not defined.
//! 2. Copy the promise, inlining naked `@(list)` references and applying
//!    body inheritance.
//! 3. Push a promise frame, prime the iterator over every iterable
//!    variable the promise references, and set `this.handle`.
//! 4. For every iteration: push an iteration frame, re-expand the copy
//!    (which evaluates all functions, even when the actuator later skips),
//!    run the actuator, and aggregate the outcome.
//! 5. Pop the promise frame and return the aggregate.
//!
//! Around the promise walk sits the convergence loop: up to three passes
//! over the bundle sequence, stopping early when a pass defines no new
//! classes and records no `CHANGE`.

pub mod builtin;

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::engine::EngineState;
use crate::eval::FrameKind;
use crate::expand::iteration::PromiseIterator;
use crate::expand::{evaluate_final_rval, expand_scalar};
use crate::lock::{LockError, LockRequest};
use crate::policy::rval::{get_naked, is_expandable, is_naked_var};
use crate::policy::{Bundle, Constraint, Policy, Promise, Rval, DEFAULT_NAMESPACE};

/// Outcome of actuating a promise. Aggregation keeps the worst outcome;
/// the ordering is the aggregation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    /// Nothing to do; the promise was already kept.
    Noop,
    /// The promise was not actuated (guard, lock, unresolved reference).
    Skipped,
    /// The promise repaired something.
    Change,
    /// The promise could not be repaired in the current mode.
    Warn,
    /// Actuation failed.
    Fail,
    /// Actuation was denied.
    Denied,
}

impl Outcome {
    /// Aggregate two outcomes; the worst wins.
    #[must_use]
    pub fn update(self, other: Self) -> Self {
        self.max(other)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Noop => "NOOP",
            Self::Skipped => "SKIPPED",
            Self::Change => "CHANGE",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
            Self::Denied => "DENIED",
        };
        f.write_str(name)
    }
}

/// A typed actuator: materialises one promise type into system state.
///
/// Actuators may read and write the context, may acquire locks through
/// [`with_promise_lock`], must be idempotent, and must signal `WARN`
/// rather than mutate when the engine is in dry-run mode.
pub trait Actuator {
    /// Actuate one fully-expanded promise.
    fn actuate(
        &self,
        state: &mut EngineState,
        policy: &Policy,
        table: &ActuatorTable,
        promise: &Promise,
    ) -> Outcome;

    /// Whether this is the variable actuator; used to avoid re-running the
    /// double-rate vars evaluation twice.
    fn is_vars(&self) -> bool {
        false
    }
}

/// The capability table mapping promise types to actuators.
#[derive(Default)]
pub struct ActuatorTable {
    actuators: HashMap<String, Box<dyn Actuator>>,
}

impl ActuatorTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The engine-owned actuators: `vars`, `meta`, `classes`, `methods`,
    /// `reports`.
    #[must_use]
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.register("vars", Box::new(builtin::VarsActuator));
        table.register("meta", Box::new(builtin::VarsActuator));
        table.register("classes", Box::new(builtin::ClassesActuator));
        table.register("methods", Box::new(builtin::MethodsActuator));
        table.register("reports", Box::new(builtin::ReportsActuator));
        table
    }

    /// Register an actuator for a promise type, replacing any previous
    /// registration.
    pub fn register(&mut self, promise_type: &str, actuator: Box<dyn Actuator>) {
        self.actuators.insert(promise_type.to_string(), actuator);
    }

    /// Look up the actuator for a promise type.
    #[must_use]
    pub fn get(&self, promise_type: &str) -> Option<&dyn Actuator> {
        self.actuators.get(promise_type).map(Box::as_ref)
    }
}

/// Promise-type evaluation order within a bundle.
pub const NORMAL_ORDER: [&str; 10] = [
    "meta", "vars", "classes", "users", "files", "packages", "commands", "methods", "services",
    "reports",
];

/// Maximum convergence passes over the bundle sequence.
pub const MAX_PASSES: usize = 3;

/// Policy errors tolerated before the run aborts.
pub const POLICY_ERROR_THRESHOLD: usize = 10;

/// Expand and actuate one promise (§pipeline above).
pub fn expand_promise(
    state: &mut EngineState,
    policy: &Policy,
    table: &ActuatorTable,
    promise_type: &str,
    promise: &Promise,
    actuator: &dyn Actuator,
) -> Outcome {
    match state.ctx.is_defined_class(&promise.guard) {
        Ok(true) => {}
        Ok(false) => {
            debug!(
                promise_type,
                promiser = %promise.promiser,
                guard = %promise.guard,
                pass = state.ctx.pass(),
                "skipping promise expansion due to class guard"
            );
            return Outcome::Skipped;
        }
        Err(e) => {
            warn!(
                promiser = %promise.promiser,
                guard = %promise.guard,
                error = %e,
                "invalid class guard"
            );
            state.record_policy_error();
            return Outcome::Fail;
        }
    }

    // 1. Copy the promise while inlining '@' lists and body references.
    let pcopy = deref_copy_promise(state, policy, promise);

    state.ctx.push_promise_frame();

    // 2. Find all unexpanded variables and prime the iteration wheels.
    let mut iter = PromiseIterator::new();
    iter.prepare(&state.ctx, &pcopy.promiser);
    if let Some(promisee) = &pcopy.promisee {
        iter.prepare_rval(&state.ctx, promisee);
    }
    let mut actuate_ifelse = false;
    for constraint in &pcopy.constraints {
        if let Rval::FnCall(call) = &constraint.rval {
            if call.name == "ifelse" {
                actuate_ifelse = true;
            }
        }
        iter.prepare_rval(&state.ctx, &constraint.rval);
    }

    put_handle_variable(state, &pcopy);

    // 3. Go.
    let result = expand_promise_and_do(state, policy, table, promise_type, &pcopy, &mut iter, actuator, actuate_ifelse);

    state.ctx.pop_frame(FrameKind::Promise);
    result
}

#[allow(clippy::too_many_arguments)]
fn expand_promise_and_do(
    state: &mut EngineState,
    policy: &Policy,
    table: &ActuatorTable,
    promise_type: &str,
    pcopy: &Promise,
    iter: &mut PromiseIterator,
    actuator: &dyn Actuator,
    actuate_ifelse: bool,
) -> Outcome {
    let mut result = Outcome::Skipped;
    // With ifelse present the promise is actuated at least once even when
    // the iterator yields no step, so the function can supply a fallback.
    let mut ifelse_actuated = !actuate_ifelse;

    loop {
        let advanced = iter.advance();
        if !advanced && ifelse_actuated {
            break;
        }

        state.ctx.push_iteration_frame();
        if advanced {
            iter.bind_current(&mut state.ctx);
        }

        // Another copy of the promise with all constraints evaluated. As a
        // result all functions are also evaluated, even when the actuator
        // skips afterwards.
        let pexp = expand_deref_promise(state, pcopy);

        if let Some(excluded) = excluded_after_expansion(state, &pexp) {
            result = result.update(excluded);
        } else {
            let outcome = actuator.actuate(state, policy, table, &pexp);
            if outcome == Outcome::Change {
                state.change_count += 1;
            }
            result = result.update(outcome);

            // Variables run at double rate: re-evaluate vars/meta promises
            // after actuation so newly defined values reach their peers.
            if matches!(promise_type, "vars" | "meta") && !actuator.is_vars() {
                builtin::verify_var_promise(state, &pexp);
            }
        }

        // A function call that evaluated to a list this step becomes a
        // wheel for the following steps.
        let rvals: Vec<&Rval> = pcopy.constraints.iter().map(|c| &c.rval).collect();
        iter.discover(&state.ctx, &rvals);

        state.ctx.pop_frame(FrameKind::PromiseIteration);
        ifelse_actuated = true;
    }

    result
}

/// Deep-copy a promise, inlining naked `@(list)` constraint rvalues and
/// applying body inheritance: a constraint whose rvalue names a body of the
/// constraint's type is replaced by that body's resolved attributes.
fn deref_copy_promise(state: &mut EngineState, policy: &Policy, promise: &Promise) -> Promise {
    let mut constraints = Vec::with_capacity(promise.constraints.len());

    for constraint in &promise.constraints {
        let body_name = match &constraint.rval {
            Rval::Scalar(s) => Some(s.as_str()),
            Rval::FnCall(call) => Some(call.name.as_str()),
            _ => None,
        };
        if let Some(name) = body_name {
            if policy.find_body(&constraint.lval, name).is_some() {
                match policy.resolve_body(&constraint.lval, name) {
                    Ok(resolved) => {
                        constraints.extend(resolved);
                        continue;
                    }
                    Err(e) => {
                        warn!(body = name, error = %e, "failed to resolve body");
                        state.record_policy_error();
                        continue;
                    }
                }
            }
        }

        let rval = match &constraint.rval {
            Rval::Scalar(s) if is_naked_var(s, '@') => {
                let naked = get_naked(s);
                if !is_expandable(naked) {
                    match state.ctx.resolve(None, None, naked) {
                        Some((value @ Rval::List(_), _)) => value,
                        _ => constraint.rval.clone(),
                    }
                } else {
                    constraint.rval.clone()
                }
            }
            other => other.clone(),
        };
        constraints.push(Constraint {
            lval: constraint.lval.clone(),
            rval,
        });
    }

    Promise {
        promiser: promise.promiser.clone(),
        promisee: promise.promisee.clone(),
        guard: promise.guard.clone(),
        constraints,
        source: promise.source.clone(),
    }
}

/// Populate `this.handle`: the explicit `handle` constraint expanded and
/// canonified, or a default derived from the source location.
fn put_handle_variable(state: &mut EngineState, promise: &Promise) {
    let handle = match promise.constraint_str("handle") {
        Some(existing) => {
            let expanded = expand_scalar(&state.ctx, None, Some("this"), existing);
            crate::classes::canonify(&expanded)
        }
        None => {
            let file = if promise.source.file.is_empty() {
                state.ctx.current_bundle().unwrap_or("policy").to_string()
            } else {
                promise.source.file.clone()
            };
            crate::classes::canonify(&format!("{}_{}", file, promise.source.line))
        }
    };
    state.ctx.put_this("handle", Rval::Scalar(handle));
}

/// Re-expand the working copy for the current iteration and populate the
/// `this` scope.
fn expand_deref_promise(state: &mut EngineState, pcopy: &Promise) -> Promise {
    let promiser = expand_scalar(&state.ctx, None, Some("this"), &pcopy.promiser);
    state
        .ctx
        .put_this("promiser", Rval::Scalar(promiser.clone()));

    let file = pcopy.source.file.clone();
    let dirname = std::path::Path::new(&file)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    state.ctx.put_this("promise_filename", Rval::Scalar(file));
    state.ctx.put_this("promise_dirname", Rval::Scalar(dirname));

    let promisee = pcopy
        .promisee
        .as_ref()
        .map(|p| evaluate_final_rval(&mut state.ctx, None, Some("this"), p));

    let constraints = pcopy
        .constraints
        .iter()
        .map(|c| Constraint {
            lval: c.lval.clone(),
            rval: evaluate_final_rval(&mut state.ctx, None, Some("this"), &c.rval),
        })
        .collect();

    Promise {
        promiser,
        promisee,
        guard: pcopy.guard.clone(),
        constraints,
        source: pcopy.source.clone(),
    }
}

/// Post-expansion guards: `if`/`ifvarclass` and `unless` constraints,
/// evaluated on the expanded copy.
fn excluded_after_expansion(state: &mut EngineState, pexp: &Promise) -> Option<Outcome> {
    for lval in ["if", "ifvarclass"] {
        if let Some(expr) = pexp.constraint_str(lval) {
            match state.ctx.is_defined_class(expr) {
                Ok(true) => {}
                Ok(false) => return Some(Outcome::Skipped),
                Err(e) => {
                    warn!(expr, error = %e, "invalid post-expansion guard");
                    state.record_policy_error();
                    return Some(Outcome::Fail);
                }
            }
        }
    }
    if let Some(expr) = pexp.constraint_str("unless") {
        match state.ctx.is_defined_class(expr) {
            Ok(false) => {}
            Ok(true) => return Some(Outcome::Skipped),
            Err(e) => {
                warn!(expr, error = %e, "invalid post-expansion guard");
                state.record_policy_error();
                return Some(Outcome::Fail);
            }
        }
    }
    None
}

/// Evaluate one bundle: sections follow [`NORMAL_ORDER`], promises within
/// a section follow declaration order. `args` bind to the bundle's formal
/// parameters for `methods` invocation.
pub fn eval_bundle(
    state: &mut EngineState,
    policy: &Policy,
    table: &ActuatorTable,
    bundle: &Bundle,
    args: &[Rval],
) -> Outcome {
    debug!(bundle = %bundle.name, "evaluating bundle");
    state.ctx.push_bundle_frame(&bundle.namespace, &bundle.name);

    for (param, arg) in bundle.params.iter().zip(args) {
        let dtype = match arg {
            Rval::List(_) => crate::eval::DataType::Slist,
            Rval::Container(_) => crate::eval::DataType::Container,
            _ => crate::eval::DataType::String,
        };
        if let Err(e) = state.ctx.variable_put(param, arg.clone(), dtype, &["source=promise"]) {
            warn!(param, error = %e, "failed to bind bundle parameter");
        }
    }

    let mut result = Outcome::Noop;
    for promise_type in NORMAL_ORDER {
        let Some(actuator) = table.get(promise_type) else {
            continue;
        };
        for section in bundle.sections_of(promise_type) {
            state.ctx.push_section_frame(promise_type);
            for promise in &section.promises {
                result = result.update(expand_promise(
                    state,
                    policy,
                    table,
                    promise_type,
                    promise,
                    actuator,
                ));
            }
            state.ctx.pop_frame(FrameKind::BundleSection);
        }
    }

    for section in &bundle.sections {
        if !NORMAL_ORDER.contains(&section.promise_type.as_str()) {
            warn!(
                bundle = %bundle.name,
                promise_type = %section.promise_type,
                "unknown promise type, section skipped"
            );
        } else if table.get(&section.promise_type).is_none() {
            debug!(
                bundle = %bundle.name,
                promise_type = %section.promise_type,
                "no actuator registered, section skipped"
            );
        }
    }

    state.ctx.pop_frame(FrameKind::Bundle);
    result
}

/// Pre-evaluation of a bundle: `vars` before `classes` and `vars` again
/// after, so classes can depend on variables and variables on classes.
fn bundle_resolve(state: &mut EngineState, policy: &Policy, table: &ActuatorTable, bundle: &Bundle) {
    debug!(
        bundle_type = %bundle.bundle_type,
        bundle = %bundle.name,
        "resolving classes and variables"
    );

    if bundle.bundle_type == "common" {
        resolve_promise_type(state, policy, table, bundle, "vars");
        resolve_promise_type(state, policy, table, bundle, "classes");
    }
    resolve_promise_type(state, policy, table, bundle, "vars");
}

fn resolve_promise_type(
    state: &mut EngineState,
    policy: &Policy,
    table: &ActuatorTable,
    bundle: &Bundle,
    promise_type: &str,
) {
    let Some(actuator) = table.get(promise_type) else {
        return;
    };
    for section in bundle.sections_of(promise_type) {
        state.ctx.push_section_frame(promise_type);
        for promise in &section.promises {
            expand_promise(state, policy, table, promise_type, promise, actuator);
        }
        state.ctx.pop_frame(FrameKind::BundleSection);
    }
}

/// PRE-EVAL over the whole policy: common bundles resolve classes and
/// variables; then a second pass resolves variables of non-common bundles;
/// then control bodies are bound into their `control_<type>` scopes.
///
/// The second pass exists to make inputs computed from variables that
/// depend on classes resolve before execution; see the regression test in
/// `tests/preeval.rs` before touching it.
pub fn resolve_policy(state: &mut EngineState, policy: &Policy, table: &ActuatorTable) {
    for bundle in &policy.bundles {
        if bundle.bundle_type == "common" {
            state.ctx.push_bundle_frame(&bundle.namespace, &bundle.name);
            bundle_resolve(state, policy, table, bundle);
            state.ctx.pop_frame(FrameKind::Bundle);
        }
    }

    for bundle in &policy.bundles {
        if bundle.bundle_type != "common" {
            state.ctx.push_bundle_frame(&bundle.namespace, &bundle.name);
            bundle_resolve(state, policy, table, bundle);
            state.ctx.pop_frame(FrameKind::Bundle);
        }
    }

    for body in &policy.bodies {
        if body.name == "control" {
            resolve_control_body(state, body);
        }
    }
}

/// Bind a control body's attributes into the `control_<type>` scope.
fn resolve_control_body(state: &mut EngineState, body: &crate::policy::Body) {
    let scope = format!("control_{}", body.body_type);
    debug!(scope = %scope, "resolving control body");
    state.ctx.push_body_frame(&body.name);

    for constraint in body.constraints.clone() {
        let value = evaluate_final_rval(&mut state.ctx, None, None, &constraint.rval);
        let dtype = match &value {
            Rval::List(_) => crate::eval::DataType::Slist,
            Rval::Container(_) => crate::eval::DataType::Container,
            _ => crate::eval::DataType::String,
        };
        let reference = format!("{scope}.{}", constraint.lval);
        if let Err(e) = state
            .ctx
            .variable_put(&reference, value, dtype, &["source=promise"])
        {
            warn!(reference, error = %e, "failed to bind control attribute");
            state.record_policy_error();
        }
    }

    state.ctx.pop_frame(FrameKind::Body);
}

/// Run the whole policy: PRE-EVAL, then up to [`MAX_PASSES`] passes over
/// the bundle sequence. A pass that defines no new classes and records no
/// `CHANGE` terminates the loop.
pub fn run_policy(
    state: &mut EngineState,
    policy: &Policy,
    table: &ActuatorTable,
    bundlesequence: Option<&[String]>,
) -> Outcome {
    resolve_policy(state, policy, table);

    if state.policy_errors > POLICY_ERROR_THRESHOLD {
        tracing::error!(
            errors = state.policy_errors,
            "too many policy errors, aborting before execution"
        );
        return Outcome::Fail;
    }

    // An explicit sequence wins; the agent control body is next; the
    // fallback is every agent bundle in declaration order.
    let control_sequence: Option<Vec<String>> = match bundlesequence {
        Some(_) => None,
        None => state
            .ctx
            .resolve(None, Some("control_agent"), "bundlesequence")
            .and_then(|(value, _)| match value {
                Rval::List(items) => Some(
                    items
                        .iter()
                        .filter_map(|i| i.as_scalar().map(String::from))
                        .collect(),
                ),
                Rval::Scalar(name) => Some(vec![name]),
                _ => None,
            }),
    };
    let names = bundlesequence.or(control_sequence.as_deref());

    let sequence: Vec<&Bundle> = match names {
        Some(names) => names
            .iter()
            .filter_map(|name| {
                let found = policy.find_bundle(DEFAULT_NAMESPACE, name);
                if found.is_none() {
                    warn!(bundle = %name, "bundle sequence names an unknown bundle");
                    state.record_policy_error();
                }
                found
            })
            .collect(),
        None => policy
            .bundles
            .iter()
            .filter(|b| b.bundle_type == "agent")
            .collect(),
    };

    let mut overall = Outcome::Noop;
    for pass in 1..=MAX_PASSES {
        state.ctx.set_pass(pass);
        let classes_before = state.ctx.class_count();
        let changes_before = state.change_count;

        for bundle in &sequence {
            overall = overall.update(eval_bundle(state, policy, table, bundle, &[]));
        }

        if state.ctx.class_count() == classes_before && state.change_count == changes_before {
            debug!(pass, "convergence reached");
            break;
        }
    }

    info!(outcome = %overall, passes = state.ctx.pass(), "policy run complete");
    overall
}

/// Run `critical` under the promise's lock, honouring `ifelapsed` and
/// `expireafter` constraints (engine defaults apply when absent). Lock
/// contention surfaces as `SKIPPED` with nothing beyond a debug log.
pub fn with_promise_lock(
    state: &mut EngineState,
    promise_type: &str,
    promise: &Promise,
    critical: impl FnOnce(&mut EngineState) -> Outcome,
) -> Outcome {
    let ifelapsed = promise
        .constraint_str("ifelapsed")
        .and_then(|v| v.parse().ok())
        .unwrap_or(state.opts.default_ifelapsed);
    let expireafter = promise
        .constraint_str("expireafter")
        .and_then(|v| v.parse().ok())
        .unwrap_or(state.opts.default_expireafter);

    let attributes: Vec<(String, String)> = promise
        .constraints
        .iter()
        .filter_map(|c| {
            c.rval
                .as_scalar()
                .map(|v| (c.lval.clone(), v.to_string()))
        })
        .collect();

    let Some(locks) = state.locks.take() else {
        warn!(promiser = %promise.promiser, "lock service unavailable, promise skipped");
        return Outcome::Skipped;
    };

    let bundle = state.ctx.current_bundle().unwrap_or("").to_string();
    let request = LockRequest {
        namespace: DEFAULT_NAMESPACE,
        bundle: &bundle,
        promise_type,
        promiser: &promise.promiser,
        attributes: &attributes,
        ifelapsed,
        expireafter,
        ignore_locks: state.opts.ignore_locks,
    };

    let now = chrono::Utc::now().timestamp();
    let outcome = match locks.acquire(&request, now) {
        Ok(lock) => {
            let outcome = critical(state);
            let done = chrono::Utc::now().timestamp();
            if let Err(e) = locks.release(lock, done) {
                warn!(error = %e, "failed to release promise lock");
            }
            outcome
        }
        Err(e @ (LockError::TooSoon { .. } | LockError::HeldByOther { .. })) => {
            debug!(promiser = %promise.promiser, reason = %e, "promise lock not acquired");
            Outcome::Skipped
        }
        Err(e) => {
            warn!(promiser = %promise.promiser, error = %e, "promise lock error");
            Outcome::Skipped
        }
    };

    state.locks = Some(locks);
    outcome
}
