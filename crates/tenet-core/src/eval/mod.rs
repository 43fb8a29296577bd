//! The evaluation context: a stack of frames over a global class state.
//!
//! Frames are pushed and popped LIFO around bundles, bundle sections,
//! bodies, promise copies and iteration steps. Each frame can hold
//! variables; bundle-qualified variables are promoted to a bundle-wide
//! table so that `ns:bundle.x` resolves from any frame. The context also
//! owns the process-wide hard class set, the namespace-scoped soft class
//! set, and the `sys`/`const` system variable tables.
//!
//! Nothing here is process-global: the whole engine state is a value
//! threaded through every call. The only permitted global is the
//! pending-termination flag in [`crate::signals`], reserved for the
//! signal-handler fast path.

pub mod vars;

use std::collections::{HashMap, HashSet};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::classes::{canonify, ClassExpr, ClassExprError, ClassQuery};
use crate::policy::{Rval, DEFAULT_NAMESPACE};
use crate::store::{Db, StoreError};
pub use vars::{DataType, VarRef, Variable, VariableTable};

/// Context errors.
#[derive(Debug, Error)]
pub enum EvalError {
    /// A variable put targeted a scope with no live frame.
    #[error("no frame for scope '{0}'")]
    ScopeAbsent(String),

    /// The guard expression could not be parsed.
    #[error(transparent)]
    ClassExpr(#[from] ClassExprError),

    /// Persistent class state could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The five frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A bundle being evaluated.
    Bundle,
    /// One promise-type section within a bundle.
    BundleSection,
    /// A body being resolved.
    Body,
    /// A promise copy under expansion.
    Promise,
    /// One step of a promise's iteration.
    PromiseIteration,
}

struct Frame {
    kind: FrameKind,
    /// Bundle namespace (bundle frames only).
    namespace: Option<String>,
    /// Bundle name, section promise type, or body name.
    name: Option<String>,
    /// Frame-local variables: the `this` scope on promise and iteration
    /// frames, body locals on body frames.
    vars: VariableTable,
    /// Iterator bindings keyed by the reference text as written.
    bindings: VariableTable,
    /// Bundle-scoped soft classes.
    soft: HashSet<String>,
}

impl Frame {
    fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            namespace: None,
            name: None,
            vars: VariableTable::new(),
            bindings: VariableTable::new(),
            soft: HashSet::new(),
        }
    }
}

/// Retention policy for persistent classes that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistentPolicy {
    /// Keep the existing expiry.
    Preserve,
    /// Restart the clock.
    Reset,
}

/// The evaluation context.
pub struct EvalContext {
    frames: Vec<Frame>,
    /// Bundle-wide variable tables keyed by `namespace:bundle`.
    bundle_vars: HashMap<String, VariableTable>,
    sys: VariableTable,
    const_vars: VariableTable,
    mon: VariableTable,
    match_vars: VariableTable,
    hard: HashSet<String>,
    /// Expiry timestamps for hard classes loaded from the persistent set.
    hard_expiry: HashMap<String, i64>,
    /// Namespace-scoped soft classes.
    soft: HashSet<String>,
    /// Classes forced undefined for the whole run.
    negated: HashSet<String>,
    pass: usize,
}

impl Default for EvalContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalContext {
    /// Create a context with the system constants loaded and the `any`
    /// class defined.
    #[must_use]
    pub fn new() -> Self {
        let mut ctx = Self {
            frames: Vec::new(),
            bundle_vars: HashMap::new(),
            sys: VariableTable::new(),
            const_vars: VariableTable::new(),
            mon: VariableTable::new(),
            match_vars: VariableTable::new(),
            hard: HashSet::new(),
            hard_expiry: HashMap::new(),
            soft: HashSet::new(),
            negated: HashSet::new(),
            pass: 0,
        };
        ctx.load_constants();
        ctx.hard.insert("any".to_string());
        ctx
    }

    /// Clear all mutable evaluation state, keeping negations. Used on
    /// reload before environment rediscovery.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.bundle_vars.clear();
        self.sys.clear();
        self.mon.clear();
        self.match_vars.clear();
        self.hard.clear();
        self.hard_expiry.clear();
        self.soft.clear();
        self.const_vars.clear();
        self.load_constants();
        self.hard.insert("any".to_string());
        self.pass = 0;
    }

    fn load_constants(&mut self) {
        for (name, value) in [
            ("at", "@"),
            ("dollar", "$"),
            ("n", "\n"),
            ("r", "\r"),
            ("t", "\t"),
            ("endl", "\n"),
            ("dirsep", "/"),
        ] {
            self.const_vars.insert(
                name.to_string(),
                Variable::new(Rval::from(value), DataType::String, &["source=agent"]),
            );
        }
    }

    // ----- frames ---------------------------------------------------------

    /// Push a bundle frame.
    pub fn push_bundle_frame(&mut self, namespace: &str, name: &str) {
        let mut frame = Frame::new(FrameKind::Bundle);
        frame.namespace = Some(namespace.to_string());
        frame.name = Some(name.to_string());
        self.frames.push(frame);
    }

    /// Push a bundle-section frame.
    pub fn push_section_frame(&mut self, promise_type: &str) {
        let mut frame = Frame::new(FrameKind::BundleSection);
        frame.name = Some(promise_type.to_string());
        self.frames.push(frame);
    }

    /// Push a body frame.
    pub fn push_body_frame(&mut self, name: &str) {
        let mut frame = Frame::new(FrameKind::Body);
        frame.name = Some(name.to_string());
        self.frames.push(frame);
    }

    /// Push a promise frame.
    pub fn push_promise_frame(&mut self) {
        self.frames.push(Frame::new(FrameKind::Promise));
    }

    /// Push a promise-iteration frame.
    pub fn push_iteration_frame(&mut self) {
        self.frames.push(Frame::new(FrameKind::PromiseIteration));
    }

    /// Pop the innermost frame, asserting its kind.
    pub fn pop_frame(&mut self, kind: FrameKind) {
        match self.frames.pop() {
            Some(frame) => debug_assert_eq!(frame.kind, kind, "frame stack out of order"),
            None => debug_assert!(false, "pop on empty frame stack"),
        }
    }

    /// Namespace of the innermost bundle frame.
    #[must_use]
    pub fn current_namespace(&self) -> &str {
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.namespace.as_deref())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Name of the innermost bundle frame.
    #[must_use]
    pub fn current_bundle(&self) -> Option<&str> {
        self.frames
            .iter()
            .rev()
            .find(|f| f.kind == FrameKind::Bundle)
            .and_then(|f| f.name.as_deref())
    }

    // ----- variables ------------------------------------------------------

    /// Bind a variable. Unqualified references land in the current bundle's
    /// table; `this` lands in the innermost promise frame; `sys`, `const`,
    /// `mon` and `match` resolve to their tables directly.
    ///
    /// # Errors
    ///
    /// [`EvalError::ScopeAbsent`] when the requested scope has no frame.
    pub fn variable_put(
        &mut self,
        text: &str,
        value: Rval,
        dtype: DataType,
        tags: &[&str],
    ) -> Result<(), EvalError> {
        let r = VarRef::parse(text);
        let variable = Variable::new(value, dtype, tags);
        let key = r.key();

        match r.scope.as_deref() {
            Some("this") => {
                let frame = self
                    .frames
                    .iter_mut()
                    .rev()
                    .find(|f| matches!(f.kind, FrameKind::Promise | FrameKind::PromiseIteration))
                    .ok_or_else(|| EvalError::ScopeAbsent("this".to_string()))?;
                frame.vars.insert(key, variable);
            }
            Some("sys") => {
                self.sys.insert(key, variable);
            }
            Some("const") => {
                self.const_vars.insert(key, variable);
            }
            Some("mon") => {
                self.mon.insert(key, variable);
            }
            Some("match") => {
                self.match_vars.insert(key, variable);
            }
            Some(bundle) => {
                let ns = r
                    .namespace
                    .unwrap_or_else(|| self.current_namespace().to_string());
                self.bundle_vars
                    .entry(format!("{ns}:{bundle}"))
                    .or_default()
                    .insert(key, variable);
            }
            None => {
                let Some(bundle) = self.current_bundle().map(String::from) else {
                    return Err(EvalError::ScopeAbsent(text.to_string()));
                };
                let ns = self.current_namespace().to_string();
                self.bundle_vars
                    .entry(format!("{ns}:{bundle}"))
                    .or_default()
                    .insert(key, variable);
            }
        }
        Ok(())
    }

    /// Bind a variable in the `this` scope of the innermost promise frame.
    pub fn put_this(&mut self, lval: &str, value: Rval) {
        if let Some(frame) = self
            .frames
            .iter_mut()
            .rev()
            .find(|f| matches!(f.kind, FrameKind::Promise | FrameKind::PromiseIteration))
        {
            frame.vars.insert(
                lval.to_string(),
                Variable::new(value, DataType::String, &["source=promise"]),
            );
        } else {
            warn!(lval, "this-scope put outside a promise frame");
        }
    }

    /// Bind a system variable.
    pub fn put_sys(&mut self, lval: &str, value: impl Into<Rval>) {
        self.sys.insert(
            lval.to_string(),
            Variable::new(value.into(), DataType::String, &["source=agent"]),
        );
    }

    /// Bind an iterator value under the reference text as written, in the
    /// innermost iteration frame.
    pub fn bind_iteration(&mut self, text: &str, value: Rval, dtype: DataType) {
        if let Some(frame) = self
            .frames
            .iter_mut()
            .rev()
            .find(|f| f.kind == FrameKind::PromiseIteration)
        {
            frame
                .bindings
                .insert(text.to_string(), Variable::new(value, dtype, &[]));
        } else {
            warn!(text, "iteration binding outside an iteration frame");
        }
    }

    /// Resolve a variable reference. Searches iterator bindings
    /// innermost-first, then the special scopes, then bundle tables.
    /// Returns an owned copy of the value.
    #[must_use]
    pub fn resolve(
        &self,
        namespace: Option<&str>,
        scope: Option<&str>,
        text: &str,
    ) -> Option<(Rval, DataType)> {
        // Iterator bindings shadow everything, keyed by the raw text so
        // that repeated references to one list share an index.
        for frame in self.frames.iter().rev() {
            if frame.kind == FrameKind::PromiseIteration {
                if let Some(var) = frame.bindings.get(text) {
                    return Some((var.value.clone(), var.dtype));
                }
            }
        }

        let r = VarRef::parse(text);
        let effective_scope = r
            .scope
            .clone()
            .or_else(|| scope.map(String::from));

        match effective_scope.as_deref() {
            Some("this") => {
                // Inner-to-outer: promise frames first, then the current
                // bundle's table for unqualified names.
                for frame in self.frames.iter().rev() {
                    if matches!(frame.kind, FrameKind::Promise | FrameKind::PromiseIteration) {
                        if let Some(var) = frame.vars.get(&r.key()) {
                            return Some((var.value.clone(), var.dtype));
                        }
                    }
                }
                if r.scope.is_none() {
                    let ns = namespace.unwrap_or_else(|| self.current_namespace());
                    let bundle = self.current_bundle()?;
                    return self
                        .bundle_vars
                        .get(&format!("{ns}:{bundle}"))
                        .and_then(|table| lookup(table, &r));
                }
                None
            }
            Some("sys") => lookup(&self.sys, &r),
            Some("const") => lookup(&self.const_vars, &r),
            Some("mon") => lookup(&self.mon, &r),
            Some("match") => lookup(&self.match_vars, &r),
            Some(bundle) => {
                let ns = r
                    .namespace
                    .as_deref()
                    .or(namespace)
                    .unwrap_or_else(|| self.current_namespace());
                self.bundle_vars
                    .get(&format!("{ns}:{bundle}"))
                    .and_then(|table| lookup(table, &r))
            }
            None => {
                let ns = namespace.unwrap_or_else(|| self.current_namespace());
                let bundle = self.current_bundle()?;
                self.bundle_vars
                    .get(&format!("{ns}:{bundle}"))
                    .and_then(|table| lookup(table, &r))
            }
        }
    }

    // ----- classes --------------------------------------------------------

    /// Define a hard (whole-run, global) class.
    pub fn class_put_hard(&mut self, name: &str) {
        let canonical = canonify(name);
        debug!(class = %canonical, "defining hard class");
        self.hard.insert(canonical);
    }

    /// Define a soft class in the namespace scope.
    pub fn class_put_soft(&mut self, name: &str) {
        let canonical = canonify(name);
        debug!(class = %canonical, "defining soft class");
        self.soft.insert(canonical);
    }

    /// Define a soft class scoped to the innermost bundle frame.
    pub fn class_put_soft_bundle(&mut self, name: &str) {
        let canonical = canonify(name);
        if let Some(frame) = self
            .frames
            .iter_mut()
            .rev()
            .find(|f| f.kind == FrameKind::Bundle)
        {
            frame.soft.insert(canonical);
        } else {
            self.soft.insert(canonical);
        }
    }

    /// Force a class undefined for the whole run.
    pub fn class_negate(&mut self, name: &str) {
        self.negated.insert(canonify(name));
    }

    /// Define a persistent class with a time-to-live, recording it in the
    /// persistent class database.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn class_put_persistent(
        &mut self,
        name: &str,
        ttl_minutes: i64,
        policy: PersistentPolicy,
        db: &Db,
    ) -> Result<(), EvalError> {
        let canonical = canonify(name);
        let now = chrono::Utc::now().timestamp();
        let expiry = now + ttl_minutes * 60;

        let write = match policy {
            PersistentPolicy::Reset => true,
            PersistentPolicy::Preserve => match db.read(&canonical)? {
                Some(bytes) => decode_expiry(&bytes) <= now,
                None => true,
            },
        };
        if write {
            db.write(&canonical, &expiry.to_le_bytes())?;
        }

        let effective = match db.read(&canonical)? {
            Some(bytes) => decode_expiry(&bytes),
            None => expiry,
        };
        self.hard.insert(canonical.clone());
        self.hard_expiry.insert(canonical, effective);
        Ok(())
    }

    /// Load unexpired persistent classes into the hard set, deleting
    /// expired entries as they are encountered.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn load_persistent_classes(&mut self, db: &Db) -> Result<(), EvalError> {
        let now = chrono::Utc::now().timestamp();
        let mut cursor = db.cursor()?;
        let mut live = Vec::new();
        while let Some((key, value)) = cursor.advance() {
            let Some(stripped) = key.strip_suffix(&[0u8]) else {
                continue;
            };
            let Ok(name) = std::str::from_utf8(stripped) else {
                continue;
            };
            let expiry = decode_expiry(&value);
            if expiry <= now {
                cursor.delete_current()?;
            } else {
                live.push((name.to_string(), expiry));
            }
        }
        for (name, expiry) in live {
            debug!(class = %name, expiry, "loaded persistent class");
            self.hard.insert(name.clone());
            self.hard_expiry.insert(name, expiry);
        }
        Ok(())
    }

    /// Whether a single class is currently defined.
    #[must_use]
    pub fn class_defined(&self, name: &str) -> bool {
        if self.negated.contains(name) {
            return false;
        }
        if let Some(expiry) = self.hard_expiry.get(name) {
            if *expiry <= chrono::Utc::now().timestamp() {
                return false;
            }
        }
        if self.hard.contains(name) || self.soft.contains(name) {
            return true;
        }
        self.frames.iter().any(|f| f.soft.contains(name))
    }

    /// Evaluate a class expression over the combined class sets.
    ///
    /// # Errors
    ///
    /// Returns the parse error for invalid syntax; the caller maps it to a
    /// `FAIL` outcome.
    pub fn is_defined_class(&self, expr: &str) -> Result<bool, ClassExprError> {
        Ok(ClassExpr::parse(expr)?.eval(self))
    }

    /// Total number of defined classes; the convergence loop compares this
    /// across passes.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.hard.len() + self.soft.len() + self.frames.iter().map(|f| f.soft.len()).sum::<usize>()
    }

    /// Current convergence pass, 1-based during evaluation.
    #[must_use]
    pub const fn pass(&self) -> usize {
        self.pass
    }

    /// Record the convergence pass.
    pub fn set_pass(&mut self, pass: usize) {
        self.pass = pass;
    }
}

impl ClassQuery for EvalContext {
    fn is_defined(&self, name: &str) -> bool {
        self.class_defined(name)
    }

    fn count_matching(&self, pattern: &Regex) -> usize {
        let frame_soft = self.frames.iter().flat_map(|f| f.soft.iter());
        self.hard
            .iter()
            .chain(self.soft.iter())
            .chain(frame_soft)
            .filter(|name| self.class_defined(name.as_str()) && pattern.is_match(name.as_str()))
            .count()
    }
}

fn lookup(table: &VariableTable, r: &VarRef) -> Option<(Rval, DataType)> {
    if let Some(var) = table.get(&r.key()) {
        return Some((var.value.clone(), var.dtype));
    }
    // Index path into a container variable.
    if !r.indices.is_empty() {
        if let Some(var) = table.get(&r.lval) {
            if let Rval::Container(value) = &var.value {
                let mut current = value;
                for index in &r.indices {
                    current = match current {
                        serde_json::Value::Object(map) => map.get(index)?,
                        serde_json::Value::Array(items) => {
                            items.get(index.parse::<usize>().ok()?)?
                        }
                        _ => return None,
                    };
                }
                return Some((Rval::Container(current.clone()), DataType::Container));
            }
        }
    }
    None
}

fn decode_expiry(bytes: &[u8]) -> i64 {
    <[u8; 8]>::try_from(bytes).map_or(0, i64::from_le_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_bundle() -> EvalContext {
        let mut ctx = EvalContext::new();
        ctx.push_bundle_frame("default", "main");
        ctx
    }

    #[test]
    fn test_put_and_resolve_bundle_variable() {
        let mut ctx = ctx_with_bundle();
        ctx.variable_put("x", Rval::from("world"), DataType::String, &[])
            .unwrap();
        let (value, dtype) = ctx.resolve(None, None, "x").unwrap();
        assert_eq!(value.as_scalar(), Some("world"));
        assert_eq!(dtype, DataType::String);
    }

    #[test]
    fn test_qualified_resolution_across_bundles() {
        let mut ctx = ctx_with_bundle();
        ctx.variable_put("x", Rval::from("one"), DataType::String, &[])
            .unwrap();
        ctx.pop_frame(FrameKind::Bundle);

        ctx.push_bundle_frame("default", "other");
        // Unqualified: not visible from another bundle.
        assert!(ctx.resolve(None, None, "x").is_none());
        // Bundle-qualified: visible from anywhere.
        let (value, _) = ctx.resolve(None, None, "main.x").unwrap();
        assert_eq!(value.as_scalar(), Some("one"));
        let (value, _) = ctx.resolve(None, None, "default:main.x").unwrap();
        assert_eq!(value.as_scalar(), Some("one"));
    }

    #[test]
    fn test_rebinding_overwrites() {
        let mut ctx = ctx_with_bundle();
        ctx.variable_put("x", Rval::from("a"), DataType::String, &[])
            .unwrap();
        ctx.variable_put("x", Rval::from("b"), DataType::String, &[])
            .unwrap();
        let (value, _) = ctx.resolve(None, None, "x").unwrap();
        assert_eq!(value.as_scalar(), Some("b"));
    }

    #[test]
    fn test_scope_absent_without_bundle_frame() {
        let mut ctx = EvalContext::new();
        let err = ctx
            .variable_put("x", Rval::from("v"), DataType::String, &[])
            .unwrap_err();
        assert!(matches!(err, EvalError::ScopeAbsent(_)));
    }

    #[test]
    fn test_this_scope_lives_on_promise_frame() {
        let mut ctx = ctx_with_bundle();
        ctx.push_promise_frame();
        ctx.put_this("promiser", Rval::from("/tmp/file"));
        let (value, _) = ctx.resolve(None, None, "this.promiser").unwrap();
        assert_eq!(value.as_scalar(), Some("/tmp/file"));
        ctx.pop_frame(FrameKind::Promise);
        assert!(ctx.resolve(None, None, "this.promiser").is_none());
    }

    #[test]
    fn test_const_variables_present() {
        let ctx = EvalContext::new();
        let (value, _) = ctx.resolve(None, None, "const.n").unwrap();
        assert_eq!(value.as_scalar(), Some("\n"));
        let (value, _) = ctx.resolve(None, None, "const.dollar").unwrap();
        assert_eq!(value.as_scalar(), Some("$"));
    }

    #[test]
    fn test_iteration_binding_shadows() {
        let mut ctx = ctx_with_bundle();
        ctx.variable_put(
            "l",
            Rval::List(vec![Rval::from("a"), Rval::from("b")]),
            DataType::Slist,
            &[],
        )
        .unwrap();
        ctx.push_promise_frame();
        ctx.push_iteration_frame();
        ctx.bind_iteration("l", Rval::from("a"), DataType::String);
        let (value, dtype) = ctx.resolve(None, None, "l").unwrap();
        assert_eq!(value.as_scalar(), Some("a"));
        assert_eq!(dtype, DataType::String);
        ctx.pop_frame(FrameKind::PromiseIteration);
        // Unshadowed again: the list.
        let (value, _) = ctx.resolve(None, None, "l").unwrap();
        assert!(value.as_list().is_some());
    }

    #[test]
    fn test_container_index_descent() {
        let mut ctx = ctx_with_bundle();
        let json = serde_json::json!({"net": {"port": 22}, "names": ["a", "b"]});
        ctx.variable_put("cfg", Rval::Container(json), DataType::Container, &[])
            .unwrap();
        let (value, _) = ctx.resolve(None, None, "cfg[net][port]").unwrap();
        assert_eq!(value, Rval::Container(serde_json::json!(22)));
        let (value, _) = ctx.resolve(None, None, "cfg[names][1]").unwrap();
        assert_eq!(value, Rval::Container(serde_json::json!("b")));
    }

    #[test]
    fn test_hard_and_soft_classes() {
        let mut ctx = ctx_with_bundle();
        ctx.class_put_hard("linux");
        ctx.class_put_soft("webserver");
        assert!(ctx.class_defined("linux"));
        assert!(ctx.class_defined("webserver"));
        assert!(ctx.is_defined_class("linux.webserver").unwrap());
        assert!(!ctx.is_defined_class("linux.!webserver").unwrap());
    }

    #[test]
    fn test_bundle_soft_class_dies_with_frame() {
        let mut ctx = ctx_with_bundle();
        ctx.class_put_soft_bundle("local_only");
        assert!(ctx.class_defined("local_only"));
        ctx.pop_frame(FrameKind::Bundle);
        assert!(!ctx.class_defined("local_only"));
    }

    #[test]
    fn test_negated_class_never_defined() {
        let mut ctx = ctx_with_bundle();
        ctx.class_negate("banned");
        ctx.class_put_hard("banned");
        assert!(!ctx.class_defined("banned"));
    }

    #[test]
    fn test_class_names_canonicalised() {
        let mut ctx = ctx_with_bundle();
        ctx.class_put_hard("web-01.example");
        assert!(ctx.class_defined("web_01_example"));
    }
}
