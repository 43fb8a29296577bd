//! Variable and promise expansion.
//!
//! Expanding variables is the easy part; expanding lists requires the
//! iteration engine. The conventions:
//!
//! - Any list or container variable occurring *within* a scalar, i.e.
//!   `$(name)`, is assumed to be iterated (see [`iteration`]).
//! - A naked list reference `@(name)` is not iterated but dropped into
//!   place where the surrounding rvalue allows it.
//! - A reference that cannot be resolved is preserved verbatim so that a
//!   later pass can resolve it.
//! - Function calls are evaluated eagerly during expansion, once per
//!   iteration, even when the surrounding promise is later skipped by its
//!   class guard. Side-effecting functions rely on this to populate classes
//!   that later promises guard on.

pub mod iteration;

use tracing::debug;

use crate::eval::EvalContext;
use crate::funcs;
use crate::policy::rval::{
    extract_reference, get_naked, is_data_or_list_reference, is_expandable, is_naked_var,
    scalar_prefix_len,
};
use crate::policy::{FnCallExpr, Rval};

/// Stringify a container leaf for scalar interpolation. Non-primitive
/// values do not stringify; the reference stays intact.
fn container_primitive(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(_) | serde_json::Value::Number(_) | serde_json::Value::Null => {
            Some(value.to_string())
        }
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
    }
}

/// Rewrite a scalar, replacing every well-formed `$(R)`/`${R}` reference
/// with the value of `R`. References inside references expand depth-first;
/// a miss preserves the original syntax verbatim.
#[must_use]
pub fn expand_scalar(
    ctx: &EvalContext,
    ns: Option<&str>,
    scope: Option<&str>,
    input: &str,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while !rest.is_empty() {
        let prefix = scalar_prefix_len(rest);
        out.push_str(&rest[..prefix]);
        rest = &rest[prefix..];
        if rest.is_empty() {
            break;
        }

        let Some((inner, consumed, open)) = extract_reference(rest) else {
            // Unterminated reference: keep the sigil and move on.
            out.push('$');
            rest = &rest[1..];
            continue;
        };
        rest = &rest[consumed..];

        // Depth-first: the reference may itself contain references.
        let mut name = inner.to_string();
        if is_expandable(&name) {
            name = expand_scalar(ctx, ns, scope, &name);
        }

        if !is_expandable(&name) {
            if let Some((value, _)) = ctx.resolve(ns, scope, &name) {
                match &value {
                    Rval::Scalar(s) => {
                        out.push_str(s);
                        continue;
                    }
                    Rval::Container(json) => {
                        if let Some(text) = container_primitive(json) {
                            out.push_str(&text);
                            continue;
                        }
                    }
                    _ => {}
                }
            }
        }

        // Unresolved (or non-scalar): preserve with the original bracket
        // style, inner expansion included.
        if open == '{' {
            out.push_str("${");
            out.push_str(&name);
            out.push('}');
        } else {
            out.push_str("$(");
            out.push_str(&name);
            out.push(')');
        }
    }

    debug!(input, output = %out, "expanded scalar");
    out
}

/// Expand one list entry. With `expand_naked`, a naked `@(x)` entry whose
/// variable resolves is replaced by the variable's (expanded) value.
fn expand_list_entry(
    ctx: &EvalContext,
    ns: Option<&str>,
    scope: Option<&str>,
    expand_naked: bool,
    entry: &Rval,
) -> Rval {
    let mut entry = entry.clone();

    // '@($(name))' and friends: expand the nested variable first, then
    // re-interpret the result as a reference.
    if let Rval::Scalar(s) = &entry {
        if is_data_or_list_reference(s) {
            entry = Rval::Scalar(expand_scalar(ctx, ns, scope, s));
        }
    }

    if let Rval::Scalar(s) = &entry {
        if is_naked_var(s, '@') {
            if !expand_naked {
                return entry;
            }
            let mut naked = get_naked(s).to_string();
            if is_expandable(&naked) {
                naked = expand_scalar(ctx, ns, scope, &naked);
            }
            if !is_expandable(&naked) {
                if let Some((value, _)) = ctx.resolve(ns, scope, &naked) {
                    return expand_private_rval(ctx, ns, scope, &value);
                }
            }
        }
    }

    expand_private_rval(ctx, ns, scope, &entry)
}

/// Expand a list element-wise. Naked `@(x)` entries that resolve to lists
/// are inlined into the parent list rather than nested.
#[must_use]
pub fn expand_list(
    ctx: &EvalContext,
    ns: Option<&str>,
    scope: Option<&str>,
    items: &[Rval],
    expand_naked: bool,
) -> Vec<Rval> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match expand_list_entry(ctx, ns, scope, expand_naked, item) {
            Rval::List(inner) => out.extend(inner),
            other => out.push(other),
        }
    }
    out
}

/// Expand an rvalue without evaluating function calls: scalars are
/// rewritten, lists element-wise, function arguments expanded in place,
/// containers copied.
#[must_use]
pub fn expand_private_rval(
    ctx: &EvalContext,
    ns: Option<&str>,
    scope: Option<&str>,
    rval: &Rval,
) -> Rval {
    match rval {
        Rval::Scalar(s) => Rval::Scalar(expand_scalar(ctx, ns, scope, s)),
        Rval::List(items) => Rval::List(expand_list(ctx, ns, scope, items, true)),
        Rval::FnCall(call) => Rval::FnCall(FnCallExpr {
            name: call.name.clone(),
            args: call
                .args
                .iter()
                .map(|a| expand_private_rval(ctx, ns, scope, a))
                .collect(),
        }),
        Rval::Container(value) => Rval::Container(value.clone()),
        Rval::Empty => Rval::Empty,
    }
}

/// Fully evaluate an rvalue: expand references, inline naked list
/// references, and apply the built-in function table. This is the final
/// form handed to actuators.
#[must_use]
pub fn evaluate_final_rval(
    ctx: &mut EvalContext,
    ns: Option<&str>,
    scope: Option<&str>,
    rval: &Rval,
) -> Rval {
    let mut result = match rval {
        // A scalar consisting of exactly one '@(name)' is replaced by the
        // named list when it resolves.
        Rval::Scalar(s) if is_naked_var(s, '@') => {
            let mut naked = get_naked(s).to_string();
            if is_expandable(&naked) {
                naked = expand_scalar(ctx, ns, scope, &naked);
            }
            match ctx.resolve(ns, scope, &naked) {
                Some((Rval::List(items), _)) => {
                    Rval::List(expand_list(ctx, ns, scope, &items, true))
                }
                Some((Rval::Container(value), _)) => Rval::Container(value),
                _ => expand_private_rval(ctx, None, Some("this"), rval),
            }
        }
        other => expand_private_rval(ctx, ns, scope, other),
    };

    // Evaluate function calls, outermost last so that evaluated list
    // entries settle first.
    result = match result {
        Rval::List(items) => Rval::List(
            items
                .into_iter()
                .map(|item| match item {
                    Rval::FnCall(call) => funcs::evaluate(ctx, ns, scope, &call),
                    Rval::Scalar(s) if is_expandable(&s) => {
                        Rval::Scalar(expand_scalar(ctx, None, Some("this"), &s))
                    }
                    other => other,
                })
                .collect(),
        ),
        Rval::FnCall(call) => funcs::evaluate(ctx, ns, scope, &call),
        other => other,
    };

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{DataType, EvalContext};

    fn ctx() -> EvalContext {
        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame("default", "main");
        ctx
    }

    fn put(ctx: &mut EvalContext, name: &str, value: Rval, dtype: DataType) {
        ctx.variable_put(name, value, dtype, &[]).unwrap();
    }

    #[test]
    fn test_scalar_without_references_round_trips() {
        let ctx = ctx();
        assert_eq!(expand_scalar(&ctx, None, None, "plain text"), "plain text");
        assert_eq!(expand_scalar(&ctx, None, None, ""), "");
    }

    #[test]
    fn test_simple_substitution() {
        let mut ctx = ctx();
        put(&mut ctx, "x", Rval::from("world"), DataType::String);
        assert_eq!(expand_scalar(&ctx, None, None, "hello $(x)"), "hello world");
        assert_eq!(expand_scalar(&ctx, None, None, "hello ${x}"), "hello world");
    }

    #[test]
    fn test_miss_preserved_verbatim() {
        let ctx = ctx();
        assert_eq!(
            expand_scalar(&ctx, None, None, "keep $(missing) here"),
            "keep $(missing) here"
        );
        assert_eq!(expand_scalar(&ctx, None, None, "a ${gone}"), "a ${gone}");
    }

    #[test]
    fn test_nested_reference_expands_depth_first() {
        let mut ctx = ctx();
        put(&mut ctx, "key", Rval::from("x"), DataType::String);
        put(&mut ctx, "x", Rval::from("deep"), DataType::String);
        assert_eq!(expand_scalar(&ctx, None, None, "$($(key))"), "deep");
    }

    #[test]
    fn test_nested_miss_keeps_expanded_inner() {
        let mut ctx = ctx();
        put(&mut ctx, "key", Rval::from("gone"), DataType::String);
        assert_eq!(expand_scalar(&ctx, None, None, "$($(key))"), "$(gone)");
    }

    #[test]
    fn test_container_primitive_stringifies() {
        let mut ctx = ctx();
        put(
            &mut ctx,
            "cfg",
            Rval::Container(serde_json::json!({"port": 22, "host": "db1"})),
            DataType::Container,
        );
        assert_eq!(expand_scalar(&ctx, None, None, "p=$(cfg[port])"), "p=22");
        assert_eq!(expand_scalar(&ctx, None, None, "h=$(cfg[host])"), "h=db1");
        // Non-primitive leaf: reference left intact.
        assert_eq!(expand_scalar(&ctx, None, None, "$(cfg)"), "$(cfg)");
    }

    #[test]
    fn test_list_reference_in_scalar_not_inlined() {
        let mut ctx = ctx();
        put(
            &mut ctx,
            "l",
            Rval::List(vec![Rval::from("a"), Rval::from("b")]),
            DataType::Slist,
        );
        // Without an iteration binding a list does not stringify.
        assert_eq!(expand_scalar(&ctx, None, None, "$(l)"), "$(l)");
    }

    #[test]
    fn test_naked_list_inlined_into_parent_list() {
        let mut ctx = ctx();
        put(
            &mut ctx,
            "l",
            Rval::List(vec![Rval::from("b"), Rval::from("c")]),
            DataType::Slist,
        );
        let items = vec![Rval::from("a"), Rval::from("@(l)"), Rval::from("d")];
        let expanded = expand_list(&ctx, None, None, &items, true);
        let flat: Vec<&str> = expanded.iter().filter_map(Rval::as_scalar).collect();
        assert_eq!(flat, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_data_or_list_reference_dereferences() {
        let mut ctx = ctx();
        put(&mut ctx, "name", Rval::from("l"), DataType::String);
        put(
            &mut ctx,
            "l",
            Rval::List(vec![Rval::from("x"), Rval::from("y")]),
            DataType::Slist,
        );
        // '@($(name))' goes through the scalar expansion first, then the
        // result is treated as '@(l)'.
        let items = vec![Rval::from("@($(name))")];
        let expanded = expand_list(&ctx, None, None, &items, true);
        let flat: Vec<&str> = expanded.iter().filter_map(Rval::as_scalar).collect();
        assert_eq!(flat, vec!["x", "y"]);
    }

    #[test]
    fn test_final_rval_naked_list() {
        let mut ctx = ctx();
        put(
            &mut ctx,
            "l",
            Rval::List(vec![Rval::from("a"), Rval::from("b")]),
            DataType::Slist,
        );
        let result = evaluate_final_rval(&mut ctx, None, None, &Rval::from("@(l)"));
        assert_eq!(
            result,
            Rval::List(vec![Rval::from("a"), Rval::from("b")])
        );
    }

    #[test]
    fn test_final_rval_evaluates_functions() {
        let mut ctx = ctx();
        let call = Rval::FnCall(FnCallExpr {
            name: "canonify".to_string(),
            args: vec![Rval::from("a b-c")],
        });
        let result = evaluate_final_rval(&mut ctx, None, None, &call);
        assert_eq!(result.as_scalar(), Some("a_b_c"));
    }
}
