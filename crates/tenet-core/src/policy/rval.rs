//! Rvalues: the right-hand side of promise constraints.
//!
//! An rvalue is a scalar (possibly containing `$(x)`/`${x}`/`@(x)`
//! references), an ordered list, a function call, a JSON container, or
//! empty. Scalars are the interesting case: the helpers here classify the
//! reference syntax so the expansion and iteration engines agree on what a
//! string means.

use serde::{Deserialize, Serialize};

/// A constraint rvalue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rval {
    /// A string, possibly containing variable references.
    Scalar(String),
    /// An ordered list of rvalues.
    List(Vec<Rval>),
    /// A call into the built-in function table.
    FnCall(FnCallExpr),
    /// No value (absent promisee).
    Empty,
    /// A nested map/array of JSON primitives.
    Container(serde_json::Value),
}

/// A function call rvalue: name plus argument list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnCallExpr {
    /// Function name, looked up in the built-in table.
    #[serde(rename = "fn")]
    pub name: String,
    /// Arguments, evaluated eagerly during expansion.
    #[serde(default)]
    pub args: Vec<Rval>,
}

impl Rval {
    /// The scalar contents, when this is a scalar.
    #[must_use]
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// The list elements, when this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Rval]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for Rval {
    fn from(s: &str) -> Self {
        Self::Scalar(s.to_string())
    }
}

impl From<String> for Rval {
    fn from(s: String) -> Self {
        Self::Scalar(s)
    }
}

const fn opposite(c: char) -> char {
    match c {
        '(' => ')',
        '{' => '}',
        _ => '\0',
    }
}

/// Check whether `s` consists of exactly one `<sigil>(name)` or
/// `<sigil>{name}` reference and nothing else. Nested references inside the
/// brackets are allowed: `@(blah$(blue))` is naked, `x$(y)` is not.
#[must_use]
pub fn is_naked_var(s: &str, sigil: char) -> bool {
    let bytes: Vec<char> = s.chars().collect();
    if bytes.len() < 3 || bytes[0] != sigil || (bytes[1] != '(' && bytes[1] != '{') {
        return false;
    }
    if bytes[bytes.len() - 1] != opposite(bytes[1]) {
        return false;
    }

    let mut depth = 0i32;
    for (i, c) in bytes.iter().enumerate() {
        match c {
            '(' | '{' => depth += 1,
            ')' | '}' => {
                depth -= 1;
                // The reference must close at the very last character.
                if depth == 0 && i + 1 != bytes.len() {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Strip the sigil and brackets from a naked reference: `@(list)` becomes
/// `list`. Callers must have validated with [`is_naked_var`] first.
#[must_use]
pub fn get_naked(s: &str) -> &str {
    if s.len() < 4 {
        return s;
    }
    &s[2..s.len() - 1]
}

/// Whether `s` contains at least one complete `$(...)` or `${...}`
/// reference.
#[must_use]
pub fn is_expandable(s: &str) -> bool {
    let mut vars = 0;
    let mut depth = 0i32;
    let mut dollar = false;
    let mut left = 'x';
    let mut right = 'x';

    let chars: Vec<char> = s.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        match c {
            '$' => {
                if matches!(chars.get(i + 1), Some('(' | '{')) {
                    dollar = true;
                }
            }
            '(' | '{' => {
                if dollar {
                    left = *c;
                    depth += 1;
                }
            }
            ')' | '}' => {
                if dollar {
                    depth -= 1;
                    right = *c;
                }
            }
            _ => {}
        }
        if dollar && depth == 0 {
            if (left == '(' && right == ')') || (left == '{' && right == '}') {
                vars += 1;
                dollar = false;
            }
        }
    }

    depth == 0 && vars > 0
}

/// Length of the literal prefix of `s` before the first `$(` or `${`.
#[must_use]
pub fn scalar_prefix_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && (bytes[i + 1] == b'(' || bytes[i + 1] == b'{')
        {
            return i;
        }
        i += 1;
    }
    bytes.len()
}

/// Extract the reference starting at the front of `s`, which must begin
/// with `$(` or `${`. Returns the inner text, the total number of bytes
/// consumed (including sigil and brackets), and the opening bracket.
/// `None` when the brackets never balance.
#[must_use]
pub fn extract_reference(s: &str) -> Option<(&str, usize, char)> {
    let bytes = s.as_bytes();
    if bytes.len() < 3 || bytes[0] != b'$' || (bytes[1] != b'(' && bytes[1] != b'{') {
        return None;
    }
    let open = bytes[1] as char;
    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate().skip(1) {
        match b {
            b'(' | b'{' => depth += 1,
            b')' | b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&s[2..i], i + 1, open));
                }
            }
            _ => {}
        }
    }
    None
}

/// Detect a variable expansion inside of a data/list reference, for example
/// `@(${container_name})`, `@(prefix${name})`, `@(ns:${name})` or
/// `@(name[${field}])`. Such a scalar is expanded first and the result
/// re-interpreted as an rvalue reference, which is what makes `@($(x))`
/// behave as a dereference.
#[must_use]
pub fn is_data_or_list_reference(s: &str) -> bool {
    // At least '@($(X))' is needed.
    if s.len() < 7 {
        return false;
    }
    let chars: Vec<char> = s.chars().collect();
    if !(chars[0] == '@' && (chars[1] == '(' || chars[1] == '{')) {
        return false;
    }

    // After '@(' only name characters, ':', '.', '[' and a nested "$(" or
    // "${" with a matching close bracket are accepted.
    for i in 2..chars.len() {
        let c = chars[i];
        if !(c.is_alphanumeric() || c == '_' || c == ':' || c == '$' || c == '.' || c == '[') {
            return false;
        }
        if c == '$' {
            return match chars.get(i + 1) {
                Some(&open @ ('(' | '{')) => s[i + 2..].contains(opposite(open)),
                _ => false,
            };
        }
    }
    false
}
