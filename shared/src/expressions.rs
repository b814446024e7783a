//! Compiled expression sets shared by a consumer with its subscriptions
//!
//! Consumers ship a list of named regular expressions alongside each
//! refresh. The scheduler stores the compiled set on the client and hands
//! it to plugins through the export/watch context, where log-style
//! plugins use it to filter produced lines.

use regex::Regex;
use tracing::warn;

/// One named pattern of an expression set.
#[derive(Debug, Clone)]
pub struct Expression {
    pub name: String,
    pub regex: Regex,
}

/// A compiled, immutable set of expressions.
///
/// An empty set matches everything; this keeps plugins free of a special
/// case for consumers that never configured expressions.
#[derive(Debug, Default)]
pub struct ExpressionSet {
    expressions: Vec<Expression>,
}

impl ExpressionSet {
    /// Compiles `(name, pattern)` pairs, skipping patterns that fail to
    /// compile with a warning. A consumer-side typo must not take down
    /// the whole subscription batch.
    pub fn compile<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut expressions = Vec::new();
        for (name, pattern) in pairs {
            match Regex::new(pattern) {
                Ok(regex) => expressions.push(Expression {
                    name: name.to_string(),
                    regex,
                }),
                Err(err) => warn!("ignoring invalid expression \"{name}\": {err}"),
            }
        }
        Self { expressions }
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.expressions.len()
    }

    /// True when any expression matches, or when the set is empty.
    pub fn matches(&self, text: &str) -> bool {
        self.expressions.is_empty() || self.expressions.iter().any(|e| e.regex.is_match(text))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Expression> {
        self.expressions.iter()
    }
}
