//! `HostSNIRegexp` template expansion.
//!
//! `{sub}.example.{tld:(com|org)}` becomes
//! `(?i)^(?P<v0>[^.]+)\.example\.(?P<v1>(com|org))$`.

use super::RuleError;

const MATCHER: &str = "HostSNIRegexp";
const DEFAULT_PATTERN: &str = "[^.]+";

fn invalid(value: &str, reason: impl Into<String>) -> RuleError {
    RuleError::InvalidArgument {
        matcher: MATCHER,
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Start/end byte offsets of every top-level `{...}` block.
///
/// Nested braces inside a template pattern (`{id:[0-9]{3}}`) are kept with
/// their parent block.
fn brace_indices(raw: &str) -> Result<Vec<(usize, usize)>, RuleError> {
    let mut level = 0usize;
    let mut start = 0usize;
    let mut blocks = Vec::new();

    for (i, b) in raw.bytes().enumerate() {
        match b {
            b'{' => {
                if level == 0 {
                    start = i;
                }
                level += 1;
            }
            b'}' => {
                if level == 0 {
                    return Err(invalid(raw, "has unbalanced braces"));
                }
                level -= 1;
                if level == 0 {
                    blocks.push((start, i + 1));
                }
            }
            _ => {}
        }
    }

    if level != 0 {
        return Err(invalid(raw, "has unbalanced braces"));
    }
    Ok(blocks)
}

/// Expand a templated host pattern into an anchored, case-insensitive regex.
pub fn prepare_pattern(raw: &str) -> Result<String, RuleError> {
    let blocks = brace_indices(raw)?;

    let mut pattern = String::from("(?i)^");
    let mut end = 0usize;
    for (i, (start, stop)) in blocks.into_iter().enumerate() {
        pattern.push_str(&regex::escape(&raw[end..start]));

        let inner = &raw[start + 1..stop - 1];
        let (name, patt) = match inner.split_once(':') {
            Some((name, patt)) => (name, patt),
            None => (inner, DEFAULT_PATTERN),
        };
        if name.is_empty() || patt.is_empty() {
            return Err(invalid(raw, format!("has an empty template {{{inner}}}")));
        }

        pattern.push_str(&format!("(?P<v{i}>{patt})"));
        end = stop;
    }
    pattern.push_str(&regex::escape(&raw[end..]));
    pattern.push('$');

    Ok(pattern)
}
