//! Item key parsing
//!
//! Item keys take the form `key` or `key[param1,"quoted param",[a,b]]`.
//! The bare key may contain alphanumerics, dots, underscores and dashes.
//! Parameters are comma separated; a parameter may be unquoted, quoted
//! with double quotes (embedded quotes escaped as `\"`) or a bracketed
//! list whose raw inner text becomes the parameter value.

use anyhow::{bail, Result};

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Splits a raw item key into its bare key and parameter list.
///
/// `cpu.load` parses to `("cpu.load", [])`, `vfs.fs.size[/,free]` to
/// `("vfs.fs.size", ["/", "free"])`. Malformed input (empty key, stray
/// characters, unbalanced brackets or quotes) is an error.
pub fn parse_key(raw: &str) -> Result<(String, Vec<String>)> {
    let chars: Vec<char> = raw.chars().collect();
    let mut pos = 0;

    while pos < chars.len() && is_key_char(chars[pos]) {
        pos += 1;
    }
    if pos == 0 {
        bail!("invalid item key format: \"{raw}\"");
    }
    let key: String = chars[..pos].iter().collect();

    if pos == chars.len() {
        return Ok((key, Vec::new()));
    }
    if chars[pos] != '[' {
        bail!("invalid character '{}' in item key \"{raw}\"", chars[pos]);
    }

    let params = parse_params(&chars, &mut pos, raw)?;
    if pos != chars.len() {
        bail!("unexpected trailing characters in item key \"{raw}\"");
    }
    Ok((key, params))
}

/// Parses `[...]` starting at `pos` (which points at the opening
/// bracket), leaving `pos` just past the closing bracket.
fn parse_params(chars: &[char], pos: &mut usize, raw: &str) -> Result<Vec<String>> {
    let mut params = Vec::new();
    *pos += 1; // consume '['

    loop {
        // skip leading spaces of the parameter
        while *pos < chars.len() && chars[*pos] == ' ' {
            *pos += 1;
        }
        if *pos >= chars.len() {
            bail!("unterminated parameter list in item key \"{raw}\"");
        }

        let param = match chars[*pos] {
            '"' => parse_quoted(chars, pos, raw)?,
            '[' => parse_array(chars, pos, raw)?,
            _ => parse_unquoted(chars, pos),
        };

        // skip trailing spaces before the separator
        while *pos < chars.len() && chars[*pos] == ' ' {
            *pos += 1;
        }
        if *pos >= chars.len() {
            bail!("unterminated parameter list in item key \"{raw}\"");
        }
        params.push(param);

        match chars[*pos] {
            ',' => {
                *pos += 1;
            }
            ']' => {
                *pos += 1;
                return Ok(params);
            }
            c => bail!("invalid character '{c}' in item key \"{raw}\""),
        }
    }
}

fn parse_quoted(chars: &[char], pos: &mut usize, raw: &str) -> Result<String> {
    let mut value = String::new();
    *pos += 1; // consume opening quote
    while *pos < chars.len() {
        match chars[*pos] {
            '\\' if *pos + 1 < chars.len() && chars[*pos + 1] == '"' => {
                value.push('"');
                *pos += 2;
            }
            '"' => {
                *pos += 1;
                return Ok(value);
            }
            c => {
                value.push(c);
                *pos += 1;
            }
        }
    }
    bail!("unterminated quoted parameter in item key \"{raw}\"");
}

/// A bracketed list parameter; the raw inner text is the value.
fn parse_array(chars: &[char], pos: &mut usize, raw: &str) -> Result<String> {
    let start = *pos + 1;
    let mut depth = 1;
    *pos += 1;
    while *pos < chars.len() {
        match chars[*pos] {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    let value: String = chars[start..*pos].iter().collect();
                    *pos += 1;
                    return Ok(value);
                }
            }
            _ => {}
        }
        *pos += 1;
    }
    bail!("unbalanced brackets in item key \"{raw}\"");
}

fn parse_unquoted(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < chars.len() && chars[*pos] != ',' && chars[*pos] != ']' {
        *pos += 1;
    }
    // unquoted values keep inner spaces, trailing ones are trimmed
    let value: String = chars[start..*pos].iter().collect();
    value.trim_end_matches(' ').to_string()
}
