//! Key alias table
//!
//! Aliases remap incoming item keys before parsing, so consumers can use
//! friendly or legacy names. An alias line has the form `name:key`; a
//! wildcard pair `name[*]:key[*]` forwards the bracketed parameter part
//! of the incoming key to the target key.

use anyhow::{bail, Context, Result};

use metricd_core::parse_key;

struct Alias {
    name: String,
    key: String,
}

pub(crate) struct AliasManager {
    aliases: Vec<Alias>,
}

impl AliasManager {
    /// Parses `name:key` alias lines, validating both sides as item
    /// keys and rejecting duplicate names.
    pub fn new(lines: &[String]) -> Result<Self> {
        let mut aliases: Vec<Alias> = Vec::with_capacity(lines.len());
        for line in lines {
            let Some((name, key)) = line.split_once(':') else {
                bail!("cannot add alias \"{line}\": not a name:key pair");
            };
            let (name, key) = (name.trim().to_string(), key.trim().to_string());
            parse_key(wildcard_base(&name))
                .with_context(|| format!("cannot add alias \"{line}\""))?;
            parse_key(wildcard_base(&key))
                .with_context(|| format!("cannot add alias \"{line}\""))?;
            if aliases.iter().any(|a| a.name == name) {
                bail!("cannot add alias \"{line}\": duplicate name");
            }
            aliases.push(Alias { name, key });
        }
        Ok(Self { aliases })
    }

    /// Maps an incoming key through the alias table. Exact matches win
    /// over wildcard matches; an unaliased key passes through unchanged.
    pub fn resolve(&self, key: &str) -> String {
        for alias in &self.aliases {
            if alias.name == key {
                return alias.key.clone();
            }
        }
        for alias in &self.aliases {
            let Some(prefix) = alias.name.strip_suffix("[*]") else {
                continue;
            };
            if key.starts_with(prefix) && key[prefix.len()..].starts_with('[') {
                if let Some(target) = alias.key.strip_suffix("[*]") {
                    return format!("{target}{}", &key[prefix.len()..]);
                }
                return alias.key.clone();
            }
        }
        key.to_string()
    }
}

/// Strips the `[*]` wildcard suffix for validation purposes.
fn wildcard_base(key: &str) -> &str {
    key.strip_suffix("[*]").unwrap_or(key)
}
