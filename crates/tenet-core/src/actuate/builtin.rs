//! Engine-owned actuators: `vars`, `classes`, `methods`, `reports`.
//!
//! External promise types (`files`, `commands`, ...) register through the
//! actuator table; these four are part of the engine because pre-evaluation
//! and the convergence model depend on them.

use tracing::{debug, warn};

use super::{eval_bundle, Actuator, ActuatorTable, Outcome};
use crate::engine::EngineState;
use crate::eval::{DataType, PersistentPolicy};
use crate::policy::rval::{is_expandable, is_naked_var};
use crate::policy::{Policy, Promise, Rval};
use crate::store::DbId;

/// Defines variables from `vars` (and `meta`) promises.
pub struct VarsActuator;

impl Actuator for VarsActuator {
    fn actuate(
        &self,
        state: &mut EngineState,
        _policy: &Policy,
        _table: &ActuatorTable,
        promise: &Promise,
    ) -> Outcome {
        verify_var_promise(state, promise)
    }

    fn is_vars(&self) -> bool {
        true
    }
}

enum Coerced {
    Value(Rval),
    /// Not resolvable yet; retried on a later pass.
    Unresolved,
    Mismatch(&'static str),
}

fn coerce(dtype: DataType, rval: &Rval) -> Coerced {
    match dtype {
        DataType::String | DataType::Int | DataType::Real | DataType::Boolean => match rval {
            Rval::Scalar(s) => {
                if is_expandable(s) || is_naked_var(s, '@') {
                    return Coerced::Unresolved;
                }
                let valid = match dtype {
                    DataType::Int => s.parse::<i64>().is_ok(),
                    DataType::Real => s.parse::<f64>().is_ok(),
                    DataType::Boolean => {
                        matches!(s.as_str(), "true" | "false" | "yes" | "no" | "on" | "off")
                    }
                    _ => true,
                };
                if valid {
                    Coerced::Value(rval.clone())
                } else {
                    Coerced::Mismatch("a value of the declared scalar type")
                }
            }
            Rval::FnCall(_) => Coerced::Unresolved,
            _ => Coerced::Mismatch("a scalar"),
        },
        DataType::Slist | DataType::Rlist => match rval {
            Rval::List(_) => Coerced::Value(rval.clone()),
            Rval::Scalar(s) => {
                if is_expandable(s) || is_naked_var(s, '@') {
                    Coerced::Unresolved
                } else {
                    Coerced::Value(Rval::List(vec![rval.clone()]))
                }
            }
            Rval::FnCall(_) => Coerced::Unresolved,
            _ => Coerced::Mismatch("a list"),
        },
        DataType::Container => match rval {
            Rval::Container(_) => Coerced::Value(rval.clone()),
            Rval::Scalar(s) => match serde_json::from_str(s) {
                Ok(value) => Coerced::Value(Rval::Container(value)),
                Err(_) => {
                    if is_expandable(s) {
                        Coerced::Unresolved
                    } else {
                        Coerced::Mismatch("valid JSON")
                    }
                }
            },
            Rval::FnCall(_) => Coerced::Unresolved,
            _ => Coerced::Mismatch("a container"),
        },
    }
}

/// Define the variable a `vars` promise binds. Shared between the vars
/// actuator and the double-rate re-evaluation in the dispatcher.
pub fn verify_var_promise(state: &mut EngineState, promise: &Promise) -> Outcome {
    let Some((dtype, rval)) = promise
        .constraints
        .iter()
        .find_map(|c| DataType::from_keyword(&c.lval).map(|d| (d, &c.rval)))
    else {
        debug!(promiser = %promise.promiser, "vars promise without a type constraint");
        return Outcome::Noop;
    };

    match coerce(dtype, rval) {
        Coerced::Value(value) => {
            match state
                .ctx
                .variable_put(&promise.promiser, value, dtype, &["source=promise"])
            {
                Ok(()) => Outcome::Noop,
                Err(e) => {
                    warn!(promiser = %promise.promiser, error = %e, "cannot bind variable");
                    state.record_policy_error();
                    Outcome::Fail
                }
            }
        }
        Coerced::Unresolved => {
            debug!(
                promiser = %promise.promiser,
                "variable not resolvable yet, retrying on a later pass"
            );
            Outcome::Skipped
        }
        Coerced::Mismatch(expected) => {
            warn!(
                promiser = %promise.promiser,
                dtype = %dtype,
                expected,
                "vars promise type mismatch"
            );
            state.record_policy_error();
            Outcome::Fail
        }
    }
}

/// Defines classes from `classes` promises.
pub struct ClassesActuator;

fn literal_bool(s: &str) -> Option<bool> {
    match s {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

impl Actuator for ClassesActuator {
    fn actuate(
        &self,
        state: &mut EngineState,
        _policy: &Policy,
        _table: &ActuatorTable,
        promise: &Promise,
    ) -> Outcome {
        let defined = if let Some(expr) = promise.constraint_str("expression") {
            match literal_bool(expr) {
                Some(value) => value,
                None => match state.ctx.is_defined_class(expr) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(promiser = %promise.promiser, error = %e, "invalid class expression");
                        state.record_policy_error();
                        return Outcome::Fail;
                    }
                },
            }
        } else if let Some(Rval::List(terms)) = promise.constraint("and") {
            match eval_terms(state, terms) {
                Ok(values) => values.iter().all(|v| *v),
                Err(outcome) => return outcome,
            }
        } else if let Some(Rval::List(terms)) = promise.constraint("or") {
            match eval_terms(state, terms) {
                Ok(values) => values.iter().any(|v| *v),
                Err(outcome) => return outcome,
            }
        } else {
            // A bare classes promise defines its promiser unconditionally.
            true
        };

        if !defined {
            return Outcome::Noop;
        }

        if let Some(ttl) = promise
            .constraint_str("persistence")
            .and_then(|v| v.parse::<i64>().ok())
        {
            let db = match state.stores.open(DbId::Classes) {
                Ok(db) => db,
                Err(e) => {
                    warn!(error = %e, "persistent class store unavailable");
                    return Outcome::Skipped;
                }
            };
            if let Err(e) =
                state
                    .ctx
                    .class_put_persistent(&promise.promiser, ttl, PersistentPolicy::Reset, &db)
            {
                warn!(promiser = %promise.promiser, error = %e, "failed to persist class");
                return Outcome::Skipped;
            }
        } else if promise.constraint_str("scope") == Some("bundle") {
            state.ctx.class_put_soft_bundle(&promise.promiser);
        } else {
            state.ctx.class_put_soft(&promise.promiser);
        }

        Outcome::Noop
    }
}

fn eval_terms(state: &mut EngineState, terms: &[Rval]) -> Result<Vec<bool>, Outcome> {
    let mut out = Vec::with_capacity(terms.len());
    for term in terms {
        let Some(expr) = term.as_scalar() else {
            warn!("class term is not a scalar expression");
            state.record_policy_error();
            return Err(Outcome::Fail);
        };
        match state.ctx.is_defined_class(expr) {
            Ok(value) => out.push(value),
            Err(e) => {
                warn!(expr, error = %e, "invalid class expression");
                state.record_policy_error();
                return Err(Outcome::Fail);
            }
        }
    }
    Ok(out)
}

/// Invokes a named bundle with arguments (`methods` promises).
pub struct MethodsActuator;

impl Actuator for MethodsActuator {
    fn actuate(
        &self,
        state: &mut EngineState,
        policy: &Policy,
        table: &ActuatorTable,
        promise: &Promise,
    ) -> Outcome {
        let (name, args) = match promise.constraint("usebundle") {
            Some(Rval::Scalar(name)) => (name.clone(), Vec::new()),
            Some(Rval::FnCall(call)) => (call.name.clone(), call.args.clone()),
            _ => {
                warn!(promiser = %promise.promiser, "methods promise without usebundle");
                state.record_policy_error();
                return Outcome::Fail;
            }
        };

        let namespace = state.ctx.current_namespace().to_string();
        let Some(bundle) = policy
            .find_bundle(&namespace, &name)
            .or_else(|| policy.find_bundle(crate::policy::DEFAULT_NAMESPACE, &name))
        else {
            warn!(bundle = %name, "usebundle names an unknown bundle");
            state.record_policy_error();
            return Outcome::Fail;
        };

        eval_bundle(state, policy, table, bundle, &args)
    }
}

/// Prints `reports` promises. Runs under the promise lock so a report
/// fires once even when the convergence loop takes several passes.
pub struct ReportsActuator;

impl Actuator for ReportsActuator {
    fn actuate(
        &self,
        state: &mut EngineState,
        _policy: &Policy,
        _table: &ActuatorTable,
        promise: &Promise,
    ) -> Outcome {
        super::with_promise_lock(state, "reports", promise, |state| {
            println!("{}", promise.promiser);
            state.reports.push(promise.promiser.clone());
            Outcome::Noop
        })
    }
}
