//! Action name grammar.
//!
//! `name = "/" ns "/" [pkg "/"] action` (fully qualified) or
//! `[pkg "/"] action` (unqualified, implicit namespace `_`).

use super::ComposeError;

/// Parse and fully qualify an action name.
///
/// Unqualified one- and two-segment names gain the `/_/` prefix; qualified
/// three-segment names without a leading slash gain a `/`. Two-segment names
/// with a leading slash and four-segment names without one are invalid, as is
/// any empty segment.
pub fn parse_action_name(name: &str) -> Result<String, ComposeError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ComposeError::InvalidName(name.to_string()));
    }

    let parts: Vec<&str> = name.split('/').collect();
    let n = parts.len();
    let leading_slash = name.starts_with('/');
    if n > 4 || (leading_slash && n == 2) || (!leading_slash && n == 4) {
        return Err(ComposeError::InvalidName(name.to_string()));
    }
    if parts
        .iter()
        .enumerate()
        .any(|(i, part)| i > 0 && part.trim().is_empty())
    {
        return Err(ComposeError::InvalidName(name.to_string()));
    }

    let joined = parts.join("/");
    if leading_slash {
        Ok(joined)
    } else if n < 3 {
        Ok(format!("/_/{joined}"))
    } else {
        Ok(format!("/{joined}"))
    }
}
