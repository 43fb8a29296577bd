//! Executor configuration.
//!
//! Derived from the policy's `executor` control body on load and on every
//! full reload; CLI flags override nothing here, they shape the daemon
//! process itself.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use tenet_core::eval::EvalContext;
use tenet_core::policy::Rval;

/// Scope the executor control body resolves into.
const CONTROL_SCOPE: &str = "control_executor";

/// Default schedule: every five-minute interval class.
fn default_schedule() -> Vec<String> {
    (0..12)
        .map(|i| {
            let start = i * 5;
            let end = (start + 5) % 60;
            format!("Min{start:02}_{end:02}")
        })
        .collect()
}

/// Executor settings for one policy generation.
#[derive(Debug, Clone)]
pub struct ExecdConfig {
    /// Time-class expressions; a run is due when any is defined.
    pub schedule: Vec<String>,
    /// Bounded pre-run delay in seconds, derived from the host identity so
    /// a fleet spreads without coordination.
    pub splay_time: u64,
    /// The local run command forked on a due schedule and for runagent
    /// requests.
    pub exec_command: String,
    /// Minutes after which a hung agent child's lock becomes stealable.
    pub agent_expireafter: i64,
    /// Users allowed to reach the runagent socket.
    pub runagent_allow_users: BTreeSet<String>,
}

impl ExecdConfig {
    /// Read the executor control attributes out of a resolved context.
    #[must_use]
    pub fn from_context(ctx: &EvalContext) -> Self {
        let schedule = match ctx.resolve(None, Some(CONTROL_SCOPE), "schedule") {
            Some((Rval::List(items), _)) => items
                .iter()
                .filter_map(|i| i.as_scalar().map(String::from))
                .collect(),
            Some((Rval::Scalar(single), _)) => vec![single],
            _ => default_schedule(),
        };

        let splay_limit_minutes = ctx
            .resolve(None, Some(CONTROL_SCOPE), "splaytime")
            .and_then(|(v, _)| v.as_scalar().and_then(|s| s.parse::<u64>().ok()))
            .unwrap_or(0);
        let host = ctx
            .resolve(None, Some("sys"), "fqhost")
            .and_then(|(v, _)| v.as_scalar().map(String::from))
            .unwrap_or_default();
        let splay_time = splay_seconds(&host, splay_limit_minutes);

        let exec_command = ctx
            .resolve(None, Some(CONTROL_SCOPE), "exec_command")
            .and_then(|(v, _)| v.as_scalar().map(String::from))
            .unwrap_or_default();

        let agent_expireafter = ctx
            .resolve(None, Some(CONTROL_SCOPE), "agent_expireafter")
            .and_then(|(v, _)| v.as_scalar().and_then(|s| s.parse().ok()))
            .unwrap_or(120);

        let runagent_allow_users = match ctx.resolve(None, Some(CONTROL_SCOPE), "runagent_allow_users")
        {
            Some((Rval::List(items), _)) => items
                .iter()
                .filter_map(|i| i.as_scalar().map(String::from))
                .collect(),
            Some((Rval::Scalar(single), _)) => BTreeSet::from([single]),
            _ => BTreeSet::new(),
        };

        Self {
            schedule,
            splay_time,
            exec_command,
            agent_expireafter,
            runagent_allow_users,
        }
    }
}

/// Deterministic splay: a host hashes to the same slot every run, so the
/// fleet spreads while each host stays predictable.
#[must_use]
pub fn splay_seconds(host: &str, limit_minutes: u64) -> u64 {
    if limit_minutes == 0 {
        return 0;
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    host.hash(&mut hasher);
    hasher.finish() % (limit_minutes * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_control_body() {
        let ctx = EvalContext::new();
        let cfg = ExecdConfig::from_context(&ctx);
        assert_eq!(cfg.schedule.len(), 12);
        assert!(cfg.schedule.contains(&"Min00_05".to_string()));
        assert!(cfg.schedule.contains(&"Min55_00".to_string()));
        assert_eq!(cfg.splay_time, 0);
        assert!(cfg.exec_command.is_empty());
        assert_eq!(cfg.agent_expireafter, 120);
        assert!(cfg.runagent_allow_users.is_empty());
    }

    #[test]
    fn test_control_attributes_respected() {
        let mut ctx = EvalContext::new();
        ctx.variable_put(
            "control_executor.schedule",
            Rval::List(vec![Rval::from("Min00_05")]),
            tenet_core::eval::DataType::Slist,
            &[],
        )
        .unwrap();
        ctx.variable_put(
            "control_executor.exec_command",
            Rval::from("/usr/bin/tenet-agent -I"),
            tenet_core::eval::DataType::String,
            &[],
        )
        .unwrap();
        ctx.variable_put(
            "control_executor.runagent_allow_users",
            Rval::List(vec![Rval::from("operator")]),
            tenet_core::eval::DataType::Slist,
            &[],
        )
        .unwrap();

        let cfg = ExecdConfig::from_context(&ctx);
        assert_eq!(cfg.schedule, vec!["Min00_05".to_string()]);
        assert_eq!(cfg.exec_command, "/usr/bin/tenet-agent -I");
        assert!(cfg.runagent_allow_users.contains("operator"));
    }

    #[test]
    fn test_splay_bounded_and_stable() {
        let a = splay_seconds("host-a.example.com", 5);
        let b = splay_seconds("host-a.example.com", 5);
        assert_eq!(a, b);
        assert!(a < 300);
        assert_eq!(splay_seconds("any", 0), 0);
    }
}
