//! # tenet-core
//!
//! Core library for tenet - a declarative configuration-management agent.
//!
//! This crate is the policy evaluation engine: it takes a parsed policy
//! document (bundles of promises plus reusable bodies), resolves variable
//! and class references, expands iteration over list and container
//! variables, evaluates per-promise class guards, and dispatches each
//! fully-resolved promise to a typed actuator.
//!
//! ## Components
//!
//! - **Evaluation context** ([`eval`]): stack of frames holding class sets,
//!   variable tables and iteration state
//! - **Expansion** ([`expand`]): `$(x)`/`@(x)` reference rewriting and the
//!   cross-product iteration engine
//! - **Class algebra** ([`classes`]): the guard sublanguage
//! - **Dispatcher** ([`actuate`]): guards, body inheritance, actuator
//!   dispatch, outcome aggregation and the convergence loop
//! - **Lock registry** ([`lock`]): `ifelapsed`/`expireafter` rate limiting
//!   across processes
//! - **Persistent store** ([`store`]): file-backed key-value databases with
//!   corruption recovery
//! - **Environment** ([`env`]): host discovery and time classes
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tenet_core::actuate::{run_policy, ActuatorTable};
//! use tenet_core::engine::{EngineOptions, EngineState};
//! use tenet_core::policy::Policy;
//! use tenet_core::store::StoreRegistry;
//!
//! let stores = Arc::new(StoreRegistry::new("/var/lib/tenet/state", "/var/lib/tenet"));
//! let mut state = EngineState::new(stores, EngineOptions::default());
//! let policy = Policy::failsafe();
//! let table = ActuatorTable::standard();
//! run_policy(&mut state, &policy, &table, None);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod actuate;
pub mod classes;
pub mod engine;
pub mod env;
pub mod eval;
pub mod expand;
pub mod funcs;
pub mod lock;
pub mod policy;
pub mod signals;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::actuate::{run_policy, Actuator, ActuatorTable, Outcome};
    pub use crate::engine::{EngineOptions, EngineState};
    pub use crate::eval::{DataType, EvalContext};
    pub use crate::policy::{Policy, Promise, Rval};
    pub use crate::store::{DbId, StoreRegistry};
}

pub use engine::{EngineOptions, EngineState};
pub use policy::Policy;
pub use store::StoreRegistry;
