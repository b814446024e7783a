//! Item key access rules
//!
//! Rules restrict which keys non-local clients may request. A rule
//! pattern is a key with optional parameters where `*` matches any
//! sequence, e.g. `system.run[*]` or `vfs.file.contents[/etc/*,*]`.
//! Allow rules are consulted first, deny rules second; a key matching
//! neither list is allowed. A denied key reports the same error as an
//! unknown one, so probing reveals nothing.

use anyhow::{Context, Result};
use regex::Regex;

use metricd_core::parse_key;

struct KeyPattern {
    key: Regex,
    /// Per-position parameter patterns; `None` accepts any invocation.
    params: Option<Vec<Regex>>,
}

impl KeyPattern {
    fn compile(pattern: &str) -> Result<Self> {
        // `*` is not a key character, swap it out before parsing
        let parsed = pattern.replace('*', "WILDCARD");
        let (key, params) =
            parse_key(&parsed).with_context(|| format!("invalid key pattern \"{pattern}\""))?;
        let params = if pattern.contains('[') {
            Some(
                params
                    .iter()
                    .map(|p| wildcard_regex(p))
                    .collect::<Result<Vec<_>>>()?,
            )
        } else {
            None
        };
        Ok(Self {
            key: wildcard_regex(&key)?,
            params,
        })
    }

    fn matches(&self, key: &str, params: &[String]) -> bool {
        if !self.key.is_match(key) {
            return false;
        }
        let Some(rule_params) = &self.params else {
            return true;
        };
        // a final `*` pattern swallows all remaining parameters
        let open_ended = rule_params
            .last()
            .is_some_and(|p| p.as_str() == wildcard_only());
        if !open_ended && params.len() > rule_params.len() {
            return false;
        }
        for (i, rule_param) in rule_params.iter().enumerate() {
            let value = params.get(i).map(String::as_str).unwrap_or("");
            if !rule_param.is_match(value) {
                return false;
            }
        }
        true
    }
}

fn wildcard_only() -> &'static str {
    "^.*$"
}

/// Translates a wildcard pattern (after the `WILDCARD` placeholder
/// substitution) into an anchored regex.
fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::from("^");
    let mut first = true;
    for part in pattern.split("WILDCARD") {
        if !first {
            expr.push_str(".*");
        }
        first = false;
        expr.push_str(&regex::escape(part));
    }
    expr.push('$');
    Regex::new(&expr).context("cannot compile key pattern")
}

pub(crate) struct KeyAccessRules {
    allow: Vec<KeyPattern>,
    deny: Vec<KeyPattern>,
}

impl KeyAccessRules {
    pub fn compile(allow: &[String], deny: &[String]) -> Result<Self> {
        Ok(Self {
            allow: allow
                .iter()
                .map(|p| KeyPattern::compile(p))
                .collect::<Result<Vec<_>>>()?,
            deny: deny
                .iter()
                .map(|p| KeyPattern::compile(p))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    /// True when the parsed key may be requested.
    pub fn check(&self, key: &str, params: &[String]) -> bool {
        if self.allow.iter().any(|rule| rule.matches(key, params)) {
            return true;
        }
        !self.deny.iter().any(|rule| rule.matches(key, params))
    }
}
