//! The built-in function table.
//!
//! Functions are looked up in a single table keyed by name; each entry
//! declares its arity. Calls are evaluated eagerly during expansion, once
//! per iteration, even when the surrounding promise is skipped by its class
//! guard afterwards — side-effecting functions must run so the classes they
//! define are visible to later promises.
//!
//! A call that cannot be evaluated (unknown name, bad arity, failed
//! handler) is preserved verbatim, like an unresolved variable reference.

use thiserror::Error;
use tracing::{debug, warn};

use crate::classes::canonify;
use crate::eval::{DataType, EvalContext, FrameKind};
use crate::expand::{evaluate_final_rval, expand_scalar};
use crate::policy::{FnCallExpr, Rval};

/// Function evaluation errors. These never abort a run; the call is left
/// unevaluated and the promise may end up `SKIPPED`.
#[derive(Debug, Error)]
pub enum FnError {
    /// An argument had the wrong shape.
    #[error("function '{name}': argument {index} must be {expected}")]
    Type {
        /// Function name.
        name: &'static str,
        /// Zero-based argument index.
        index: usize,
        /// What was expected.
        expected: &'static str,
    },

    /// A referenced variable was not resolvable.
    #[error("function '{name}': unresolved argument '{what}'")]
    Unresolved {
        /// Function name.
        name: &'static str,
        /// The unresolved reference.
        what: String,
    },

    /// The underlying I/O failed.
    #[error("function '{name}': {source}")]
    Io {
        /// Function name.
        name: &'static str,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A class expression argument failed to parse.
    #[error("function '{name}': {source}")]
    ClassExpr {
        /// Function name.
        name: &'static str,
        /// Underlying parse error.
        source: crate::classes::ClassExprError,
    },
}

type Handler = fn(&mut EvalContext, &[Rval]) -> Result<Rval, FnError>;

struct FnSpec {
    name: &'static str,
    min_args: usize,
    max_args: usize,
    handler: Handler,
}

const VARIADIC: usize = usize::MAX;

static FUNCTIONS: &[FnSpec] = &[
    FnSpec { name: "and", min_args: 1, max_args: VARIADIC, handler: fn_and },
    FnSpec { name: "canonify", min_args: 1, max_args: 1, handler: fn_canonify },
    FnSpec { name: "classmatch", min_args: 1, max_args: 1, handler: fn_classmatch },
    FnSpec { name: "concat", min_args: 0, max_args: VARIADIC, handler: fn_concat },
    FnSpec { name: "getindices", min_args: 1, max_args: 1, handler: fn_getindices },
    FnSpec { name: "ifelse", min_args: 1, max_args: VARIADIC, handler: fn_ifelse },
    FnSpec { name: "mapdata", min_args: 3, max_args: 3, handler: fn_mapdata },
    FnSpec { name: "maparray", min_args: 2, max_args: 2, handler: fn_maparray },
    FnSpec { name: "maplist", min_args: 2, max_args: 2, handler: fn_maplist },
    FnSpec { name: "not", min_args: 1, max_args: 1, handler: fn_not },
    FnSpec { name: "or", min_args: 1, max_args: VARIADIC, handler: fn_or },
    FnSpec { name: "readfile", min_args: 1, max_args: 2, handler: fn_readfile },
    FnSpec { name: "splitstring", min_args: 3, max_args: 3, handler: fn_splitstring },
    FnSpec { name: "strcmp", min_args: 2, max_args: 2, handler: fn_strcmp },
];

/// Whether a name is in the built-in table.
#[must_use]
pub fn is_builtin(name: &str) -> bool {
    FUNCTIONS.iter().any(|f| f.name == name)
}

/// Evaluate a function call. Arguments are fully evaluated first (inner
/// calls, naked list references). Failures preserve the call verbatim.
#[must_use]
pub fn evaluate(
    ctx: &mut EvalContext,
    ns: Option<&str>,
    scope: Option<&str>,
    call: &FnCallExpr,
) -> Rval {
    let Some(spec) = FUNCTIONS.iter().find(|f| f.name == call.name) else {
        debug!(name = %call.name, "unknown function, call preserved");
        return Rval::FnCall(call.clone());
    };

    let args: Vec<Rval> = call
        .args
        .iter()
        .map(|arg| evaluate_final_rval(ctx, ns, scope, arg))
        .collect();

    if args.len() < spec.min_args || args.len() > spec.max_args {
        warn!(
            name = %call.name,
            got = args.len(),
            "function called with wrong number of arguments"
        );
        return Rval::FnCall(call.clone());
    }

    match (spec.handler)(ctx, &args) {
        Ok(result) => result,
        Err(e) => {
            debug!(name = %call.name, error = %e, "function evaluation failed, call preserved");
            Rval::FnCall(call.clone())
        }
    }
}

fn scalar_arg<'a>(
    name: &'static str,
    args: &'a [Rval],
    index: usize,
) -> Result<&'a str, FnError> {
    args.get(index)
        .and_then(Rval::as_scalar)
        .ok_or(FnError::Type {
            name,
            index,
            expected: "a scalar",
        })
}

fn list_arg<'a>(name: &'static str, args: &'a [Rval], index: usize) -> Result<&'a [Rval], FnError> {
    args.get(index).and_then(Rval::as_list).ok_or(FnError::Type {
        name,
        index,
        expected: "a list",
    })
}

fn truthy(s: &str) -> bool {
    matches!(s, "true" | "yes" | "on" | "1")
}

fn bool_scalar(b: bool) -> Rval {
    Rval::Scalar(if b { "true" } else { "false" }.to_string())
}

// ----- handlers ----------------------------------------------------------

fn fn_canonify(_ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    Ok(Rval::Scalar(canonify(scalar_arg("canonify", args, 0)?)))
}

fn fn_concat(_ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    let mut out = String::new();
    for (index, arg) in args.iter().enumerate() {
        out.push_str(arg.as_scalar().ok_or(FnError::Type {
            name: "concat",
            index,
            expected: "a scalar",
        })?);
    }
    Ok(Rval::Scalar(out))
}

/// `ifelse(expr1, value1, expr2, value2, ..., default)`: the value of the
/// first class expression that holds, else the trailing default.
fn fn_ifelse(ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    let mut i = 0;
    while i + 1 < args.len() {
        let condition = scalar_arg("ifelse", args, i)?;
        let defined = ctx
            .is_defined_class(condition)
            .map_err(|e| FnError::ClassExpr {
                name: "ifelse",
                source: e,
            })?;
        if defined {
            return Ok(args[i + 1].clone());
        }
        i += 2;
    }
    // Odd trailing argument (or a single argument) is the fallback.
    args.get(i).cloned().ok_or(FnError::Type {
        name: "ifelse",
        index: i,
        expected: "a fallback value",
    })
}

fn fn_strcmp(_ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    Ok(bool_scalar(
        scalar_arg("strcmp", args, 0)? == scalar_arg("strcmp", args, 1)?,
    ))
}

fn fn_not(_ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    Ok(bool_scalar(!truthy(scalar_arg("not", args, 0)?)))
}

fn fn_and(ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    for index in 0..args.len() {
        let expr = scalar_arg("and", args, index)?;
        let defined = ctx.is_defined_class(expr).map_err(|e| FnError::ClassExpr {
            name: "and",
            source: e,
        })?;
        if !defined {
            return Ok(bool_scalar(false));
        }
    }
    Ok(bool_scalar(true))
}

fn fn_or(ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    for index in 0..args.len() {
        let expr = scalar_arg("or", args, index)?;
        let defined = ctx.is_defined_class(expr).map_err(|e| FnError::ClassExpr {
            name: "or",
            source: e,
        })?;
        if defined {
            return Ok(bool_scalar(true));
        }
    }
    Ok(bool_scalar(false))
}

fn fn_classmatch(ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    let pattern = scalar_arg("classmatch", args, 0)?;
    let expr = format!("class_matching(/{pattern}/)");
    let matched = ctx.is_defined_class(&expr).map_err(|e| FnError::ClassExpr {
        name: "classmatch",
        source: e,
    })?;
    Ok(bool_scalar(matched))
}

fn fn_readfile(_ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    let path = scalar_arg("readfile", args, 0)?;
    let max_bytes = match args.get(1).and_then(Rval::as_scalar) {
        Some(limit) => limit.parse::<usize>().map_err(|_| FnError::Type {
            name: "readfile",
            index: 1,
            expected: "a byte count",
        })?,
        None => usize::MAX,
    };
    let mut contents = std::fs::read_to_string(path).map_err(|e| FnError::Io {
        name: "readfile",
        source: e,
    })?;
    if max_bytes != 0 && contents.len() > max_bytes {
        let mut cut = max_bytes;
        while !contents.is_char_boundary(cut) {
            cut -= 1;
        }
        contents.truncate(cut);
    }
    Ok(Rval::Scalar(contents))
}

fn fn_splitstring(_ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    let input = scalar_arg("splitstring", args, 0)?;
    let pattern = scalar_arg("splitstring", args, 1)?;
    let max = scalar_arg("splitstring", args, 2)?
        .parse::<usize>()
        .map_err(|_| FnError::Type {
            name: "splitstring",
            index: 2,
            expected: "a maximum count",
        })?;
    let re = regex::Regex::new(pattern).map_err(|_| FnError::Type {
        name: "splitstring",
        index: 1,
        expected: "a valid regex",
    })?;
    let parts: Vec<Rval> = re
        .splitn(input, max.max(1))
        .map(|part| Rval::Scalar(part.to_string()))
        .collect();
    Ok(Rval::List(parts))
}

/// Expand `pattern` once per list element with `$(this)` bound to the
/// element.
fn fn_maplist(ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    let pattern = scalar_arg("maplist", args, 0)?.to_string();
    let items = list_arg("maplist", args, 1)?.to_vec();

    let mut out = Vec::with_capacity(items.len());
    ctx.push_promise_frame();
    ctx.push_iteration_frame();
    for item in items {
        ctx.bind_iteration("this", item, DataType::String);
        out.push(Rval::Scalar(expand_scalar(ctx, None, None, &pattern)));
    }
    ctx.pop_frame(FrameKind::PromiseIteration);
    ctx.pop_frame(FrameKind::Promise);
    Ok(Rval::List(out))
}

/// Expand `pattern` once per key of a container variable with `$(this.k)`
/// and `$(this.v)` bound to each entry.
fn fn_maparray(ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    let pattern = scalar_arg("maparray", args, 0)?.to_string();
    let entries = container_entries("maparray", ctx, &args[1])?;

    let mut out = Vec::with_capacity(entries.len());
    ctx.push_promise_frame();
    ctx.push_iteration_frame();
    for (key, value) in entries {
        ctx.bind_iteration("this.k", Rval::Scalar(key), DataType::String);
        ctx.bind_iteration("this.v", Rval::Scalar(value), DataType::String);
        out.push(Rval::Scalar(expand_scalar(ctx, None, None, &pattern)));
    }
    ctx.pop_frame(FrameKind::PromiseIteration);
    ctx.pop_frame(FrameKind::Promise);
    Ok(Rval::List(out))
}

/// Like `maparray` but produces a container; the first argument selects
/// the interpretation of the expanded pattern (`none` keeps strings,
/// `json` parses each result).
fn fn_mapdata(ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    let mode = scalar_arg("mapdata", args, 0)?.to_string();
    let pattern = scalar_arg("mapdata", args, 1)?.to_string();
    let entries = container_entries("mapdata", ctx, &args[2])?;

    let mut out = Vec::with_capacity(entries.len());
    ctx.push_promise_frame();
    ctx.push_iteration_frame();
    for (key, value) in entries {
        ctx.bind_iteration("this.k", Rval::Scalar(key), DataType::String);
        ctx.bind_iteration("this.v", Rval::Scalar(value), DataType::String);
        let expanded = expand_scalar(ctx, None, None, &pattern);
        let element = if mode == "json" {
            serde_json::from_str(&expanded)
                .unwrap_or(serde_json::Value::String(expanded))
        } else {
            serde_json::Value::String(expanded)
        };
        out.push(element);
    }
    ctx.pop_frame(FrameKind::PromiseIteration);
    ctx.pop_frame(FrameKind::Promise);
    Ok(Rval::Container(serde_json::Value::Array(out)))
}

fn fn_getindices(ctx: &mut EvalContext, args: &[Rval]) -> Result<Rval, FnError> {
    let name = scalar_arg("getindices", args, 0)?;
    let Some((value, _)) = ctx.resolve(None, None, name) else {
        return Err(FnError::Unresolved {
            name: "getindices",
            what: name.to_string(),
        });
    };
    let indices = match value {
        Rval::Container(serde_json::Value::Object(map)) => {
            map.keys().map(|k| Rval::Scalar(k.clone())).collect()
        }
        Rval::Container(serde_json::Value::Array(items)) => (0..items.len())
            .map(|i| Rval::Scalar(i.to_string()))
            .collect(),
        Rval::List(items) => (0..items.len())
            .map(|i| Rval::Scalar(i.to_string()))
            .collect(),
        _ => Vec::new(),
    };
    Ok(Rval::List(indices))
}

/// Key/value pairs of a container argument, either inline or named.
fn container_entries(
    name: &'static str,
    ctx: &EvalContext,
    arg: &Rval,
) -> Result<Vec<(String, String)>, FnError> {
    let container = match arg {
        Rval::Container(value) => value.clone(),
        Rval::Scalar(reference) => match ctx.resolve(None, None, reference) {
            Some((Rval::Container(value), _)) => value,
            _ => {
                return Err(FnError::Unresolved {
                    name,
                    what: reference.clone(),
                })
            }
        },
        _ => {
            return Err(FnError::Type {
                name,
                index: 1,
                expected: "a container",
            })
        }
    };

    let stringify = |v: &serde_json::Value| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    Ok(match container {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), stringify(v)))
            .collect(),
        serde_json::Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), stringify(v)))
            .collect(),
        _ => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EvalContext {
        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame("default", "main");
        ctx
    }

    fn call(name: &str, args: Vec<Rval>) -> FnCallExpr {
        FnCallExpr {
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn test_canonify_and_concat() {
        let mut c = ctx();
        let result = evaluate(&mut c, None, None, &call("canonify", vec![Rval::from("a b.c")]));
        assert_eq!(result.as_scalar(), Some("a_b_c"));

        let result = evaluate(
            &mut c,
            None,
            None,
            &call("concat", vec![Rval::from("a"), Rval::from("b")]),
        );
        assert_eq!(result.as_scalar(), Some("ab"));
    }

    #[test]
    fn test_ifelse_picks_first_defined() {
        let mut c = ctx();
        c.class_put_hard("second");
        let result = evaluate(
            &mut c,
            None,
            None,
            &call(
                "ifelse",
                vec![
                    Rval::from("first"),
                    Rval::from("no"),
                    Rval::from("second"),
                    Rval::from("yes"),
                    Rval::from("fallback"),
                ],
            ),
        );
        assert_eq!(result.as_scalar(), Some("yes"));
    }

    #[test]
    fn test_ifelse_fallback() {
        let mut c = ctx();
        let result = evaluate(
            &mut c,
            None,
            None,
            &call(
                "ifelse",
                vec![Rval::from("missing"), Rval::from("no"), Rval::from("default")],
            ),
        );
        assert_eq!(result.as_scalar(), Some("default"));
    }

    #[test]
    fn test_unknown_function_preserved() {
        let mut c = ctx();
        let original = call("no_such_function", vec![Rval::from("x")]);
        let result = evaluate(&mut c, None, None, &original);
        assert_eq!(result, Rval::FnCall(original));
    }

    #[test]
    fn test_bad_arity_preserved() {
        let mut c = ctx();
        let original = call("canonify", vec![]);
        let result = evaluate(&mut c, None, None, &original);
        assert_eq!(result, Rval::FnCall(original));
    }

    #[test]
    fn test_maplist_binds_this() {
        let mut c = ctx();
        let list = Rval::List(vec![Rval::from("a"), Rval::from("b")]);
        let result = evaluate(
            &mut c,
            None,
            None,
            &call("maplist", vec![Rval::from("<$(this)>"), list]),
        );
        let items: Vec<&str> = result.as_list().unwrap().iter().filter_map(Rval::as_scalar).collect();
        assert_eq!(items, vec!["<a>", "<b>"]);
    }

    #[test]
    fn test_maplist_resolves_named_list() {
        let mut c = ctx();
        c.variable_put(
            "l",
            Rval::List(vec![Rval::from("x"), Rval::from("y")]),
            DataType::Slist,
            &[],
        )
        .unwrap();
        let result = evaluate(
            &mut c,
            None,
            None,
            &call("maplist", vec![Rval::from("$(this)!"), Rval::from("@(l)")]),
        );
        let items: Vec<&str> = result.as_list().unwrap().iter().filter_map(Rval::as_scalar).collect();
        assert_eq!(items, vec!["x!", "y!"]);
    }

    #[test]
    fn test_maparray_binds_key_and_value() {
        let mut c = ctx();
        c.variable_put(
            "m",
            Rval::Container(serde_json::json!({"a": 1, "b": 2})),
            DataType::Container,
            &[],
        )
        .unwrap();
        let result = evaluate(
            &mut c,
            None,
            None,
            &call("maparray", vec![Rval::from("$(this.k)=$(this.v)"), Rval::from("m")]),
        );
        let items: Vec<&str> = result.as_list().unwrap().iter().filter_map(Rval::as_scalar).collect();
        assert_eq!(items, vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_splitstring() {
        let mut c = ctx();
        let result = evaluate(
            &mut c,
            None,
            None,
            &call(
                "splitstring",
                vec![Rval::from("a,b,c"), Rval::from(","), Rval::from("10")],
            ),
        );
        let items: Vec<&str> = result.as_list().unwrap().iter().filter_map(Rval::as_scalar).collect();
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_boolean_functions() {
        let mut c = ctx();
        c.class_put_hard("yes_class");
        let result = evaluate(
            &mut c,
            None,
            None,
            &call("and", vec![Rval::from("yes_class"), Rval::from("any")]),
        );
        assert_eq!(result.as_scalar(), Some("true"));

        let result = evaluate(
            &mut c,
            None,
            None,
            &call("or", vec![Rval::from("nope"), Rval::from("yes_class")]),
        );
        assert_eq!(result.as_scalar(), Some("true"));

        let result = evaluate(&mut c, None, None, &call("not", vec![Rval::from("true")]));
        assert_eq!(result.as_scalar(), Some("false"));

        let result = evaluate(
            &mut c,
            None,
            None,
            &call("strcmp", vec![Rval::from("x"), Rval::from("x")]),
        );
        assert_eq!(result.as_scalar(), Some("true"));
    }

    #[test]
    fn test_getindices() {
        let mut c = ctx();
        c.variable_put(
            "m",
            Rval::Container(serde_json::json!({"one": 1, "two": 2})),
            DataType::Container,
            &[],
        )
        .unwrap();
        let result = evaluate(&mut c, None, None, &call("getindices", vec![Rval::from("m")]));
        let mut items: Vec<&str> = result.as_list().unwrap().iter().filter_map(Rval::as_scalar).collect();
        items.sort_unstable();
        assert_eq!(items, vec!["one", "two"]);
    }

    #[test]
    fn test_readfile() {
        let mut c = ctx();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("content.txt");
        std::fs::write(&path, "file contents here").unwrap();
        let result = evaluate(
            &mut c,
            None,
            None,
            &call(
                "readfile",
                vec![
                    Rval::Scalar(path.display().to_string()),
                    Rval::from("4"),
                ],
            ),
        );
        assert_eq!(result.as_scalar(), Some("file"));
    }
}
