//! The policy data model.
//!
//! A policy is a rooted, immutable tree: an ordered sequence of bundles
//! (each an ordered group of promise sections) plus an ordered sequence of
//! bodies (reusable attribute blocks with inheritance). Everything mutable
//! lives in the evaluation context; once loaded, the tree is never touched.
//!
//! Policy documents are JSON. The grammar-level text parser is an external
//! collaborator; this module consumes its output shape.

pub mod rval;

use std::collections::HashSet;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

pub use rval::{FnCallExpr, Rval};

/// Default policy namespace.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Policy loading errors.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The document could not be read.
    #[error("failed to read policy file '{path}': {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The document could not be deserialised.
    #[error("failed to parse policy: {0}")]
    Parse(#[from] serde_json::Error),

    /// A body inheritance chain loops.
    #[error("body inheritance cycle through '{0}'")]
    BodyCycle(String),

    /// A body reference names no known body.
    #[error("unknown body '{0}'")]
    UnknownBody(String),
}

/// Source location of a promise or body, carried through for diagnostics
/// and default handles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SourceInfo {
    /// Originating file.
    #[serde(default)]
    pub file: String,
    /// Line within the file.
    #[serde(default)]
    pub line: u32,
}

/// One `lval => rval` attribute of a promise or body.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    /// Attribute name.
    pub lval: String,
    /// Attribute value.
    pub rval: Rval,
}

impl Constraint {
    /// Build a constraint.
    pub fn new(lval: impl Into<String>, rval: impl Into<Rval>) -> Self {
        Self {
            lval: lval.into(),
            rval: rval.into(),
        }
    }
}

/// Deserialise constraints from a JSON object, preserving document order.
fn de_constraints<'de, D>(deserializer: D) -> Result<Vec<Constraint>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ConstraintVisitor;

    impl<'de> Visitor<'de> for ConstraintVisitor {
        type Value = Vec<Constraint>;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a map of attribute names to rvalues")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut out = Vec::new();
            while let Some((lval, rval)) = map.next_entry::<String, Rval>()? {
                out.push(Constraint { lval, rval });
            }
            Ok(out)
        }
    }

    deserializer.deserialize_map(ConstraintVisitor)
}

/// A promise: the declaration that a named object should have a named
/// property. The atom of evaluation.
#[derive(Debug, Clone, Deserialize)]
pub struct Promise {
    /// The object the promise is about.
    pub promiser: String,

    /// Optional promisee (scalar or list).
    #[serde(default)]
    pub promisee: Option<Rval>,

    /// Class guard; the promise is skipped unless this expression holds.
    #[serde(default = "default_guard")]
    pub guard: String,

    /// Ordered attributes.
    #[serde(default, deserialize_with = "de_constraints")]
    pub constraints: Vec<Constraint>,

    /// Where the promise was written.
    #[serde(default)]
    pub source: SourceInfo,
}

fn default_guard() -> String {
    "any".to_string()
}

impl Promise {
    /// Build a promise with the default guard and no constraints.
    pub fn new(promiser: impl Into<String>) -> Self {
        Self {
            promiser: promiser.into(),
            promisee: None,
            guard: default_guard(),
            constraints: Vec::new(),
            source: SourceInfo::default(),
        }
    }

    /// Replace the class guard.
    #[must_use]
    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = guard.into();
        self
    }

    /// Append a constraint.
    #[must_use]
    pub fn with_constraint(mut self, lval: impl Into<String>, rval: impl Into<Rval>) -> Self {
        self.constraints.push(Constraint::new(lval, rval));
        self
    }

    /// First rvalue bound to the given attribute name.
    #[must_use]
    pub fn constraint(&self, lval: &str) -> Option<&Rval> {
        self.constraints
            .iter()
            .find(|c| c.lval == lval)
            .map(|c| &c.rval)
    }

    /// Scalar value of the given attribute, when present and scalar.
    #[must_use]
    pub fn constraint_str(&self, lval: &str) -> Option<&str> {
        self.constraint(lval).and_then(Rval::as_scalar)
    }
}

/// One section of a bundle: all promises of a single promise type, in
/// declaration order.
#[derive(Debug, Clone, Deserialize)]
pub struct BundleSection {
    /// The promise type this section holds (`vars`, `files`, ...).
    pub promise_type: String,
    /// Promises in declaration order.
    #[serde(default)]
    pub promises: Vec<Promise>,
}

/// A bundle: an ordered, named group of promise sections.
#[derive(Debug, Clone, Deserialize)]
pub struct Bundle {
    /// Policy namespace, defaulting to `default`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Bundle name.
    pub name: String,
    /// Bundle type (`common`, `agent`, ...).
    #[serde(rename = "type", default = "default_bundle_type")]
    pub bundle_type: String,
    /// Formal parameter names for `methods` invocation.
    #[serde(default)]
    pub params: Vec<String>,
    /// Promise sections in declaration order.
    #[serde(default)]
    pub sections: Vec<BundleSection>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_bundle_type() -> String {
    "agent".to_string()
}

impl Bundle {
    /// Build an empty bundle in the default namespace.
    pub fn new(name: impl Into<String>, bundle_type: impl Into<String>) -> Self {
        Self {
            namespace: default_namespace(),
            name: name.into(),
            bundle_type: bundle_type.into(),
            params: Vec::new(),
            sections: Vec::new(),
        }
    }

    /// Append a promise section.
    #[must_use]
    pub fn with_section(
        mut self,
        promise_type: impl Into<String>,
        promises: Vec<Promise>,
    ) -> Self {
        self.sections.push(BundleSection {
            promise_type: promise_type.into(),
            promises,
        });
        self
    }

    /// Sections holding the given promise type, in declaration order.
    pub fn sections_of<'a>(
        &'a self,
        promise_type: &'a str,
    ) -> impl Iterator<Item = &'a BundleSection> + 'a {
        self.sections
            .iter()
            .filter(move |s| s.promise_type == promise_type)
    }
}

/// A body: a named, typed attribute block inlined into promises via
/// constraint references.
#[derive(Debug, Clone, Deserialize)]
pub struct Body {
    /// Policy namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Body name, referenced from constraint rvalues.
    pub name: String,
    /// Body type; must match the constraint lval that references it.
    #[serde(rename = "type")]
    pub body_type: String,
    /// Parent body whose attributes this one refines.
    #[serde(default)]
    pub inherit_from: Option<String>,
    /// Attributes, later entries overriding inherited ones.
    #[serde(default, deserialize_with = "de_constraints")]
    pub constraints: Vec<Constraint>,
}

/// A complete, immutable policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Policy {
    /// Bundles in declaration order.
    #[serde(default)]
    pub bundles: Vec<Bundle>,
    /// Bodies in declaration order.
    #[serde(default)]
    pub bodies: Vec<Body>,
}

impl Policy {
    /// Parse a policy document.
    ///
    /// # Errors
    ///
    /// Returns a parse error for malformed documents and a cycle error for
    /// looping body inheritance.
    pub fn from_json_str(text: &str) -> Result<Self, PolicyError> {
        let policy: Self = serde_json::from_str(text)?;
        policy.check_body_inheritance()?;
        Ok(policy)
    }

    /// Load a policy document from disk.
    ///
    /// # Errors
    ///
    /// Propagates I/O and parse errors.
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path).map_err(|e| PolicyError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_json_str(&text)
    }

    /// The failsafe policy used when the configured inputs are missing or
    /// corrupt: report the condition and do nothing else.
    #[must_use]
    pub fn failsafe() -> Self {
        Self {
            bundles: vec![Bundle::new("failsafe", "agent").with_section(
                "reports",
                vec![Promise::new(
                    "running failsafe policy: configured inputs missing or invalid",
                )],
            )],
            bodies: Vec::new(),
        }
    }

    /// Find a bundle by name within a namespace.
    #[must_use]
    pub fn find_bundle(&self, namespace: &str, name: &str) -> Option<&Bundle> {
        self.bundles
            .iter()
            .find(|b| b.namespace == namespace && b.name == name)
    }

    /// Find a body by type and name.
    #[must_use]
    pub fn find_body(&self, body_type: &str, name: &str) -> Option<&Body> {
        self.bodies
            .iter()
            .find(|b| b.body_type == body_type && b.name == name)
    }

    /// Resolve a body's effective attributes: the `inherit_from` chain is
    /// walked oldest-first, later attributes overriding earlier ones.
    ///
    /// # Errors
    ///
    /// [`PolicyError::UnknownBody`] for a dangling reference and
    /// [`PolicyError::BodyCycle`] for a looping chain.
    pub fn resolve_body(&self, body_type: &str, name: &str) -> Result<Vec<Constraint>, PolicyError> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(name.to_string());

        while let Some(body_name) = current {
            if !visited.insert(body_name.clone()) {
                return Err(PolicyError::BodyCycle(body_name));
            }
            let body = self
                .find_body(body_type, &body_name)
                .ok_or_else(|| PolicyError::UnknownBody(body_name.clone()))?;
            chain.push(body);
            current = body.inherit_from.clone();
        }

        // Oldest ancestor first, each descendant overriding by lval.
        let mut merged: Vec<Constraint> = Vec::new();
        for body in chain.iter().rev() {
            for constraint in &body.constraints {
                if let Some(existing) = merged.iter_mut().find(|c| c.lval == constraint.lval) {
                    *existing = constraint.clone();
                } else {
                    merged.push(constraint.clone());
                }
            }
        }
        Ok(merged)
    }

    fn check_body_inheritance(&self) -> Result<(), PolicyError> {
        for body in &self.bodies {
            self.resolve_body(&body.body_type, &body.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_document() {
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

        assert_eq!(policy.bundles.len(), 1);
        let bundle = &policy.bundles[0];
        assert_eq!(bundle.namespace, DEFAULT_NAMESPACE);
        assert_eq!(bundle.sections.len(), 2);
        let vars = &bundle.sections[0].promises[0];
        assert_eq!(vars.constraint_str("string"), Some("world"));
        assert_eq!(vars.guard, "any");
    }

    #[test]
    fn test_constraint_order_preserved() {
        let policy = Policy::from_json_str(
            r#"{
                "bundles": [
                    {"name": "b", "sections": [
                        {"promise_type": "commands", "promises": [
                            {"promiser": "/bin/true",
                             "constraints": {"args": "-v", "ifelapsed": "5", "contain": "silent"}}
                        ]}
                    ]}
                ]
            }"#,
        )
        .unwrap();
        let promise = &policy.bundles[0].sections[0].promises[0];
        let lvals: Vec<&str> = promise.constraints.iter().map(|c| c.lval.as_str()).collect();
        assert_eq!(lvals, vec!["args", "ifelapsed", "contain"]);
    }

    #[test]
    fn test_body_inheritance_oldest_first() {
        let policy = Policy::from_json_str(
            r#"{
                "bodies": [
                    {"name": "base", "type": "action",
                     "constraints": {"ifelapsed": "60", "expireafter": "120"}},
                    {"name": "fast", "type": "action", "inherit_from": "base",
                     "constraints": {"ifelapsed": "1"}}
                ]
            }"#,
        )
        .unwrap();

        let merged = policy.resolve_body("action", "fast").unwrap();
        let ifelapsed = merged.iter().find(|c| c.lval == "ifelapsed").unwrap();
        let expireafter = merged.iter().find(|c| c.lval == "expireafter").unwrap();
        assert_eq!(ifelapsed.rval.as_scalar(), Some("1"));
        assert_eq!(expireafter.rval.as_scalar(), Some("120"));
    }

    #[test]
    fn test_body_cycle_rejected() {
        let err = Policy::from_json_str(
            r#"{
                "bodies": [
                    {"name": "a", "type": "action", "inherit_from": "b", "constraints": {}},
                    {"name": "b", "type": "action", "inherit_from": "a", "constraints": {}}
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::BodyCycle(_)));
    }

    #[test]
    fn test_failsafe_policy_reports() {
        let policy = Policy::failsafe();
        assert_eq!(policy.bundles.len(), 1);
        assert_eq!(policy.bundles[0].sections[0].promise_type, "reports");
    }
}
