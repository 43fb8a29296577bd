//! Regression coverage for the pre-evaluation passes.
//!
//! The second pre-eval pass (variables of non-common bundles) looks
//! redundant, but dynamic input selection depends on it: a control-body
//! attribute may reference a variable defined in a non-common bundle, and
//! that variable may itself depend on a class a common bundle set. Do not
//! remove the pass without these tests.

use std::sync::Arc;

use tempfile::TempDir;
use tenet_core::actuate::{run_policy, ActuatorTable};
use tenet_core::engine::{EngineOptions, EngineState};
use tenet_core::policy::Policy;
use tenet_core::store::StoreRegistry;

fn fresh_state(dir: &TempDir) -> EngineState {
    let stores = Arc::new(StoreRegistry::new(
        dir.path().join("state"),
        dir.path().join("work"),
    ));
    EngineState::new(stores, EngineOptions::default())
}

#[test]
fn dynamic_bundlesequence_from_non_common_vars() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir);

    // The agent control body picks its bundle sequence out of a variable
    // defined in a non-common bundle. Only the second pre-eval pass makes
    // this resolvable before execution starts.
    let policy = Policy::from_json_str(
        r#"{
            "bundles": [
                {"name": "inputs", "type": "agent", "sections": [
                    {"promise_type": "vars", "promises": [
                        {"promiser": "entry", "constraints": {"string": "wanted"}}
                    ]}
                ]},
                {"name": "wanted", "type": "agent", "sections": [
                    {"promise_type": "reports", "promises": [{"promiser": "dynamic entry ran"}]}
                ]},
                {"name": "unwanted", "type": "agent", "sections": [
                    {"promise_type": "reports", "promises": [{"promiser": "must not run"}]}
                ]}
            ],
            "bodies": [
                {"name": "control", "type": "agent",
                 "constraints": {"bundlesequence": "$(inputs.entry)"}}
            ]
        }"#,
    )
    .unwrap();

    run_policy(&mut state, &policy, &ActuatorTable::standard(), None);
    assert_eq!(state.reports, vec!["dynamic entry ran"]);
}

#[test]
fn common_classes_steer_non_common_vars() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir);

    // Classes set by a common bundle select the value of a variable in a
    // non-common bundle, which in turn selects the reported text. The
    // common pass must run vars, then classes, then vars again for the
    // chain to settle before execution.
    let policy = Policy::from_json_str(
        r#"{
            "bundles": [
                {"name": "classify", "type": "common", "sections": [
                    {"promise_type": "vars", "promises": [
                        {"promiser": "role_name", "constraints": {"string": "edge"}}
                    ]},
                    {"promise_type": "classes", "promises": [
                        {"promiser": "role_$(role_name)", "constraints": {"expression": "any"}}
                    ]}
                ]},
                {"name": "main", "type": "agent", "sections": [
                    {"promise_type": "vars", "promises": [
                        {"promiser": "greeting",
                         "guard": "role_edge",
                         "constraints": {"string": "hello from the edge"}}
                    ]},
                    {"promise_type": "reports", "promises": [
                        {"promiser": "$(greeting)"}
                    ]}
                ]}
            ]
        }"#,
    )
    .unwrap();

    run_policy(&mut state, &policy, &ActuatorTable::standard(), None);
    assert_eq!(state.reports, vec!["hello from the edge"]);
}
