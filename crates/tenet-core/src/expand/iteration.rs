//! The iteration engine.
//!
//! Before a promise is expanded, every rvalue is scanned for variable
//! references. Each reference that resolves to a list or container adds a
//! *wheel* to the promise's iterator, with the variable as its axis and the
//! elements as its tick values. `advance` then walks the cross product in
//! odometer order: the first wheel registered is the outermost, the last
//! the innermost (fastest turning).
//!
//! Wheels are keyed by the reference text, so multiple references to the
//! same list within one promise see the same index at every step. An empty
//! wheel suppresses the whole promise. An unresolvable reference adds no
//! wheel at all; the reference simply survives expansion verbatim.

use tracing::debug;

use crate::eval::{DataType, EvalContext};
use crate::expand::expand_scalar;
use crate::policy::rval::{extract_reference, is_expandable, scalar_prefix_len};
use crate::policy::Rval;

/// Function names exempt from iterator discovery over their arguments.
/// Their inner references must stay unresolved so the functions can bind
/// them per element on a later pass; discovering wheels inside them would
/// pin indices that never resolve.
const MAP_FAMILY: [&str; 3] = ["maplist", "mapdata", "maparray"];

struct Wheel {
    /// The reference text this wheel binds, as written after inner
    /// expansion.
    text: String,
    /// Tick values in order.
    ticks: Vec<(Rval, DataType)>,
}

/// Cross-product iterator over every iterable variable a promise
/// references.
#[derive(Default)]
pub struct PromiseIterator {
    wheels: Vec<Wheel>,
    position: Vec<usize>,
    started: bool,
}

impl PromiseIterator {
    /// Create an iterator with no wheels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of wheels registered.
    #[must_use]
    pub fn wheel_count(&self) -> usize {
        self.wheels.len()
    }

    /// Scan a scalar for references and register a wheel for every one
    /// that resolves to an iterable value. Inner references are scanned
    /// first, depth-first, so `$(a[$(i)])` registers a wheel for `i`.
    pub fn prepare(&mut self, ctx: &EvalContext, text: &str) {
        let mut rest = text;
        while !rest.is_empty() {
            let prefix = scalar_prefix_len(rest);
            rest = &rest[prefix..];
            if rest.is_empty() {
                break;
            }
            let Some((inner, consumed, _)) = extract_reference(rest) else {
                rest = &rest[1..];
                continue;
            };
            self.prepare_reference(ctx, inner);
            rest = &rest[consumed..];
        }
    }

    fn prepare_reference(&mut self, ctx: &EvalContext, reference: &str) {
        // Inner references become their own candidate wheels first.
        let mut name = reference.to_string();
        if is_expandable(&name) {
            self.prepare(ctx, &name);
            name = expand_scalar(ctx, None, None, &name);
            if is_expandable(&name) {
                // Still unresolvable: no wheel.
                return;
            }
        }

        if self.wheels.iter().any(|w| w.text == name) {
            return;
        }

        let Some((value, dtype)) = ctx.resolve(None, None, &name) else {
            return;
        };
        if !dtype.is_iterable() {
            return;
        }

        let ticks = ticks_of(&value);
        debug!(reference = %name, ticks = ticks.len(), "registered iteration wheel");
        self.wheels.push(Wheel { text: name, ticks });
        self.position.push(0);
    }

    /// Walk a whole rvalue, registering wheels for every reference found.
    /// Function calls contribute their name; their arguments too, except
    /// for the map family.
    pub fn prepare_rval(&mut self, ctx: &EvalContext, rval: &Rval) {
        match rval {
            Rval::Scalar(s) => self.prepare(ctx, s),
            Rval::List(items) => {
                for item in items {
                    self.prepare_rval(ctx, item);
                }
            }
            Rval::FnCall(call) => {
                self.prepare(ctx, &call.name);
                if !MAP_FAMILY.contains(&call.name.as_str()) {
                    for arg in &call.args {
                        self.prepare_rval(ctx, arg);
                    }
                }
            }
            Rval::Container(_) | Rval::Empty => {}
        }
    }

    /// Advance to the next cross-product tuple. The first call positions
    /// the odometer at the origin; with no wheels it succeeds exactly once.
    /// Any empty wheel suppresses the promise: `advance` never succeeds.
    pub fn advance(&mut self) -> bool {
        if !self.started {
            self.started = true;
            if self.wheels.iter().any(|w| w.ticks.is_empty()) {
                return false;
            }
            return true;
        }

        if self.wheels.is_empty() {
            return false;
        }

        // Odometer: increment the innermost wheel, carrying left.
        let mut i = self.wheels.len();
        loop {
            if i == 0 {
                return false;
            }
            i -= 1;
            self.position[i] += 1;
            if self.position[i] < self.wheels[i].ticks.len() {
                return true;
            }
            self.position[i] = 0;
        }
    }

    /// Bind the current tick of every wheel into the innermost iteration
    /// frame.
    pub fn bind_current(&self, ctx: &mut EvalContext) {
        for (wheel, &pos) in self.wheels.iter().zip(&self.position) {
            if let Some((value, dtype)) = wheel.ticks.get(pos) {
                ctx.bind_iteration(&wheel.text, value.clone(), *dtype);
            }
        }
    }

    /// Register wheels that have become resolvable since the last scan,
    /// e.g. a variable defined mid-iteration by a function call. Newly
    /// added wheels start at their first tick and turn as the innermost.
    pub fn discover(&mut self, ctx: &EvalContext, rvals: &[&Rval]) {
        for rval in rvals {
            self.prepare_rval(ctx, rval);
        }
    }
}

fn ticks_of(value: &Rval) -> Vec<(Rval, DataType)> {
    match value {
        Rval::List(items) => items
            .iter()
            .map(|item| {
                let dtype = match item {
                    Rval::Container(_) => DataType::Container,
                    _ => DataType::String,
                };
                (item.clone(), dtype)
            })
            .collect(),
        Rval::Container(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(s) => (Rval::Scalar(s.clone()), DataType::String),
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                    (Rval::Container(item.clone()), DataType::Container)
                }
                other => (Rval::Scalar(other.to_string()), DataType::String),
            })
            .collect(),
        Rval::Container(serde_json::Value::Object(map)) => map
            .keys()
            .map(|k| (Rval::Scalar(k.clone()), DataType::String))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EvalContext;

    fn ctx_with(vars: &[(&str, Rval, DataType)]) -> EvalContext {
        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame("default", "main");
        for (name, value, dtype) in vars {
            ctx.variable_put(name, value.clone(), *dtype, &[]).unwrap();
        }
        ctx
    }

    fn slist(items: &[&str]) -> Rval {
        Rval::List(items.iter().map(|s| Rval::from(*s)).collect())
    }

    fn collect_steps(ctx: &mut EvalContext, iter: &mut PromiseIterator, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        ctx.push_promise_frame();
        while iter.advance() {
            ctx.push_iteration_frame();
            iter.bind_current(ctx);
            out.push(expand_scalar(ctx, None, None, text));
            ctx.pop_frame(crate::eval::FrameKind::PromiseIteration);
        }
        ctx.pop_frame(crate::eval::FrameKind::Promise);
        out
    }

    #[test]
    fn test_no_wheels_fires_exactly_once() {
        let mut ctx = ctx_with(&[]);
        let mut iter = PromiseIterator::new();
        iter.prepare(&ctx, "no references here");
        let steps = collect_steps(&mut ctx, &mut iter, "static");
        assert_eq!(steps, vec!["static"]);
    }

    #[test]
    fn test_single_list_iterates_in_order() {
        let mut ctx = ctx_with(&[("l", slist(&["a", "b", "c"]), DataType::Slist)]);
        let mut iter = PromiseIterator::new();
        iter.prepare(&ctx, "item $(l)");
        let steps = collect_steps(&mut ctx, &mut iter, "item $(l)");
        assert_eq!(steps, vec!["item a", "item b", "item c"]);
    }

    #[test]
    fn test_cross_product_odometer_order() {
        let mut ctx = ctx_with(&[
            ("xs", slist(&["1", "2"]), DataType::Slist),
            ("ys", slist(&["p", "q"]), DataType::Slist),
        ]);
        let mut iter = PromiseIterator::new();
        iter.prepare(&ctx, "$(xs)$(ys)");
        let steps = collect_steps(&mut ctx, &mut iter, "($(xs),$(ys))");
        assert_eq!(steps, vec!["(1,p)", "(1,q)", "(2,p)", "(2,q)"]);
    }

    #[test]
    fn test_same_list_shares_index() {
        let mut ctx = ctx_with(&[("l", slist(&["a", "b"]), DataType::Slist)]);
        let mut iter = PromiseIterator::new();
        iter.prepare(&ctx, "$(l) and $(l) again");
        assert_eq!(iter.wheel_count(), 1);
        let steps = collect_steps(&mut ctx, &mut iter, "$(l)$(l)");
        assert_eq!(steps, vec!["aa", "bb"]);
    }

    #[test]
    fn test_empty_wheel_suppresses_promise() {
        let mut ctx = ctx_with(&[("l", Rval::List(Vec::new()), DataType::Slist)]);
        let mut iter = PromiseIterator::new();
        iter.prepare(&ctx, "$(l)");
        assert!(!iter.advance());
    }

    #[test]
    fn test_unresolvable_reference_adds_no_wheel() {
        let ctx = ctx_with(&[]);
        let mut iter = PromiseIterator::new();
        iter.prepare(&ctx, "$(missing)");
        assert_eq!(iter.wheel_count(), 0);
    }

    #[test]
    fn test_scalar_reference_adds_no_wheel() {
        let ctx = ctx_with(&[("s", Rval::from("just a string"), DataType::String)]);
        let mut iter = PromiseIterator::new();
        iter.prepare(&ctx, "$(s)");
        assert_eq!(iter.wheel_count(), 0);
    }

    #[test]
    fn test_container_array_iterates_elements() {
        let mut ctx = ctx_with(&[(
            "d",
            Rval::Container(serde_json::json!(["x", "y"])),
            DataType::Container,
        )]);
        let mut iter = PromiseIterator::new();
        iter.prepare(&ctx, "$(d)");
        let steps = collect_steps(&mut ctx, &mut iter, "$(d)");
        assert_eq!(steps, vec!["x", "y"]);
    }

    #[test]
    fn test_container_object_iterates_keys() {
        let mut ctx = ctx_with(&[(
            "d",
            Rval::Container(serde_json::json!({"alpha": 1, "beta": 2})),
            DataType::Container,
        )]);
        let mut iter = PromiseIterator::new();
        iter.prepare(&ctx, "$(d)");
        let steps = collect_steps(&mut ctx, &mut iter, "$(d)");
        assert_eq!(steps, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_map_family_arguments_not_scanned() {
        let ctx = ctx_with(&[("l", slist(&["a", "b"]), DataType::Slist)]);
        let mut iter = PromiseIterator::new();
        let call = Rval::FnCall(crate::policy::FnCallExpr {
            name: "maplist".to_string(),
            args: vec![Rval::from("$(this)"), Rval::from("@(l)")],
        });
        iter.prepare_rval(&ctx, &call);
        assert_eq!(iter.wheel_count(), 0);

        // A non-exempt function's arguments are scanned.
        let call = Rval::FnCall(crate::policy::FnCallExpr {
            name: "concat".to_string(),
            args: vec![Rval::from("$(l)")],
        });
        iter.prepare_rval(&ctx, &call);
        assert_eq!(iter.wheel_count(), 1);
    }
}
