//! End-to-end engine scenarios driven through the public API: policy
//! documents in, report output and persistent state out.

use std::sync::Arc;

use tempfile::TempDir;
use tenet_core::actuate::{run_policy, with_promise_lock, ActuatorTable, Outcome};
use tenet_core::engine::{EngineOptions, EngineState};
use tenet_core::eval::PersistentPolicy;
use tenet_core::policy::{Policy, Promise};
use tenet_core::store::{DbId, StoreRegistry};

fn fresh_state(dir: &TempDir) -> EngineState {
    let stores = Arc::new(StoreRegistry::new(
        dir.path().join("state"),
        dir.path().join("work"),
    ));
    EngineState::new(stores, EngineOptions::default())
}

#[test]
fn hello_world_report() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir);
    state.ctx.class_put_hard("DEBUG");

    let policy = Policy::from_json_str(
        r#"{
            "bundles": [
                {"name": "main", "type": "agent", "sections": [
                    {"promise_type": "vars", "promises": [
                        {"promiser": "x", "constraints": {"string": "world"}}
                    ]},
                    {"promise_type": "reports", "promises": [
                        {"promiser": "hello $(x)"}
                    ]}
                ]}
            ]
        }"#,
    )
    .unwrap();

    run_policy(&mut state, &policy, &ActuatorTable::standard(), None);
    assert_eq!(state.reports, vec!["hello world"]);
}

#[test]
fn class_guard_gates_report() {
    let policy_text = |guard: &str| {
        format!(
            r#"{{
                "bundles": [
                    {{"name": "main", "type": "agent", "sections": [
                        {{"promise_type": "classes", "promises": [
                            {{"promiser": "ok", "constraints": {{"expression": "any"}}}}
                        ]}},
                        {{"promise_type": "reports", "promises": [
                            {{"promiser": "reached", "guard": "{guard}"}}
                        ]}}
                    ]}}
                ]
            }}"#
        )
    };

    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir);
    let policy = Policy::from_json_str(&policy_text("ok")).unwrap();
    run_policy(&mut state, &policy, &ActuatorTable::standard(), None);
    assert_eq!(state.reports, vec!["reached"]);

    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir);
    let policy = Policy::from_json_str(&policy_text("!ok")).unwrap();
    run_policy(&mut state, &policy, &ActuatorTable::standard(), None);
    assert!(state.reports.is_empty());
}

#[test]
fn list_iteration_in_declared_order() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir);

    let policy = Policy::from_json_str(
        r#"{
            "bundles": [
                {"name": "main", "type": "agent", "sections": [
                    {"promise_type": "vars", "promises": [
                        {"promiser": "l", "constraints": {"slist": ["a", "b"]}}
                    ]},
                    {"promise_type": "reports", "promises": [
                        {"promiser": "/tmp/$(l)"}
                    ]}
                ]}
            ]
        }"#,
    )
    .unwrap();

    run_policy(&mut state, &policy, &ActuatorTable::standard(), None);
    assert_eq!(state.reports, vec!["/tmp/a", "/tmp/b"]);
}

#[test]
fn bundlesequence_from_control_body() {
    let dir = TempDir::new().unwrap();
    let mut state = fresh_state(&dir);

    let policy = Policy::from_json_str(
        r#"{
            "bundles": [
                {"name": "skipped", "type": "agent", "sections": [
                    {"promise_type": "reports", "promises": [{"promiser": "not me"}]}
                ]},
                {"name": "wanted", "type": "agent", "sections": [
                    {"promise_type": "reports", "promises": [{"promiser": "just me"}]}
                ]}
            ],
            "bodies": [
                {"name": "control", "type": "agent",
                 "constraints": {"bundlesequence": ["wanted"]}}
            ]
        }"#,
    )
    .unwrap();

    run_policy(&mut state, &policy, &ActuatorTable::standard(), None);
    assert_eq!(state.reports, vec!["just me"]);
}

#[test]
fn lock_registry_single_last_entry_across_runs() {
    let dir = TempDir::new().unwrap();
    let promise = Promise::new("/bin/true").with_constraint("ifelapsed", "1");

    // First run: lock acquired, critical section runs.
    let mut first = fresh_state(&dir);
    first.ctx.push_bundle_frame("default", "main");
    let outcome = with_promise_lock(&mut first, "commands", &promise, |_| Outcome::Change);
    assert_eq!(outcome, Outcome::Change);
    drop(first);

    // Second run within ifelapsed: skipped without a second entry.
    let mut second = fresh_state(&dir);
    second.ctx.push_bundle_frame("default", "main");
    let outcome = with_promise_lock(&mut second, "commands", &promise, |_| Outcome::Change);
    assert_eq!(outcome, Outcome::Skipped);

    let map = second.stores.load_into_map(DbId::Locks).unwrap();
    let last_entries: Vec<&String> = map.keys().filter(|k| k.starts_with("last")).collect();
    assert_eq!(last_entries.len(), 1);
}

#[test]
fn persistent_class_survives_new_context() {
    let dir = TempDir::new().unwrap();
    {
        let mut state = fresh_state(&dir);
        let db = state.stores.open(DbId::Classes).unwrap();
        state
            .ctx
            .class_put_persistent("maintenance_window", 10, PersistentPolicy::Reset, &db)
            .unwrap();
        assert!(state.ctx.class_defined("maintenance_window"));
    }

    // A brand new engine over the same store sees the class.
    let mut state = fresh_state(&dir);
    assert!(!state.ctx.class_defined("maintenance_window"));
    state.load_persistent_classes().unwrap();
    assert!(state.ctx.class_defined("maintenance_window"));
}

#[test]
fn dry_run_reports_but_aggregates_warn_from_actuators() {
    let dir = TempDir::new().unwrap();
    let stores = Arc::new(StoreRegistry::new(
        dir.path().join("state"),
        dir.path().join("work"),
    ));
    let mut state = EngineState::new(
        stores,
        EngineOptions {
            dry_run: true,
            ignore_locks: true,
            ..EngineOptions::default()
        },
    );

    let policy = Policy::from_json_str(
        r#"{
            "bundles": [
                {"name": "main", "type": "agent", "sections": [
                    {"promise_type": "reports", "promises": [{"promiser": "dry run says hi"}]}
                ]}
            ]
        }"#,
    )
    .unwrap();

    run_policy(&mut state, &policy, &ActuatorTable::standard(), None);
    assert_eq!(state.reports, vec!["dry run says hi"]);
}
