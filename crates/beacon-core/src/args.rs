//! Argument tuples carried by signal dispatches.
//!
//! A dispatch carries an ordered tuple of JSON values. The core never looks
//! inside the values; only the transport imposes size and count limits.

use std::ops::Deref;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered argument tuple of a single dispatch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(Vec<Value>);

impl Args {
    /// Empty tuple.
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Wrap an existing vector of values.
    #[must_use]
    pub fn from_vec(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Append a value.
    pub fn push(&mut self, value: impl Into<Value>) {
        self.0.push(value.into());
    }

    /// First argument, if any.
    #[must_use]
    pub fn first(&self) -> Option<&Value> {
        self.0.first()
    }

    /// First argument as a string slice, if it is a string.
    #[must_use]
    pub fn first_str(&self) -> Option<&str> {
        self.first().and_then(Value::as_str)
    }

    /// Consume the tuple and return the inner vector.
    #[must_use]
    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl Deref for Args {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl FromIterator<Value> for Args {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Args {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Args {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Build an [`Args`] tuple from JSON-like expressions.
///
/// ```ignore
/// let args = args!["ok", 1, {"nested": true}];
/// assert_eq!(args.len(), 3);
/// ```
#[macro_export]
macro_rules! args {
    () => {
        $crate::args::Args::new()
    };
    ($($value:tt),+ $(,)?) => {
        $crate::args::Args::from_vec(vec![$($crate::__serde_json::json!($value)),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_macro_builds_empty_tuple() {
        let args = crate::args![];
        assert!(args.is_empty());
    }

    #[test]
    fn macro_preserves_order_and_types() {
        let args = crate::args!["ok", 1, true, null];
        assert_eq!(args.len(), 4);
        assert_eq!(args[0], json!("ok"));
        assert_eq!(args[1], json!(1));
        assert_eq!(args[2], json!(true));
        assert!(args[3].is_null());
    }

    #[test]
    fn macro_accepts_nested_json() {
        let args = crate::args![{"hp": 10}, [1, 2]];
        assert_eq!(args[0]["hp"], 10);
        assert_eq!(args[1], json!([1, 2]));
    }

    #[test]
    fn first_str_only_for_strings() {
        assert_eq!(crate::args!["blocked", 1].first_str(), Some("blocked"));
        assert_eq!(crate::args![1].first_str(), None);
        assert_eq!(Args::new().first_str(), None);
    }

    #[test]
    fn push_and_collect() {
        let mut args = Args::new();
        args.push("a");
        args.push(2);
        let collected: Args = args.clone().into_iter().collect();
        assert_eq!(collected, args);
        assert_eq!(args.into_inner(), vec![json!("a"), json!(2)]);
    }

    #[test]
    fn serializes_as_plain_array() {
        let args = crate::args!["x", 3];
        let json = serde_json::to_string(&args).unwrap();
        assert_eq!(json, r#"["x",3]"#);
        let back: Args = serde_json::from_str(&json).unwrap();
        assert_eq!(back, args);
    }
}
