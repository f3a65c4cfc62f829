//! Avatar expression and action label tables.
//!
//! The response LLM closes each generation with a trailing code pair such as
//! `1_joy|2_nod`; the tables here resolve numeric codes to label names for
//! the SYSTEM_STATE stream.

/// Expression labels indexed by code; 0 is the neutral fallback.
pub const EXPRESSIONS: [&str; 9] = [
    "normal",
    "joy",
    "impressed",
    "convinced",
    "interested",
    "sleepy",
    "surprise",
    "embarrassed",
    "angry",
];

/// Action labels indexed by code; 0 is the neutral fallback.
pub const ACTIONS: [&str; 9] = [
    "wait",
    "listening",
    "nod",
    "head_tilt",
    "thinking",
    "light_greeting",
    "greeting",
    "deep_nod",
    "dismiss",
];

/// Resolve an expression code, clamping unknown codes to `normal`.
pub fn expression(code: u8) -> &'static str {
    EXPRESSIONS.get(code as usize).copied().unwrap_or(EXPRESSIONS[0])
}

/// Resolve an action code, clamping unknown codes to `wait`.
pub fn action(code: u8) -> &'static str {
    ACTIONS.get(code as usize).copied().unwrap_or(ACTIONS[0])
}

/// Resolve a `<id>_<label>` or bare-label token against a table, returning
/// the canonical label. Unknown tokens resolve to the neutral entry.
fn resolve(token: &str, table: &[&'static str]) -> &'static str {
    let head = token.split('_').next().unwrap_or("");
    if let Ok(code) = head.parse::<u8>() {
        return table.get(code as usize).copied().unwrap_or(table[0]);
    }
    let lowered = token.to_ascii_lowercase();
    table
        .iter()
        .find(|label| **label == lowered)
        .copied()
        .unwrap_or(table[0])
}

/// Resolve an expression token like `1_joy`, `joy`, or `1`.
pub fn resolve_expression(token: &str) -> &'static str {
    resolve(token.trim(), &EXPRESSIONS)
}

/// Resolve an action token like `2_nod`, `nod`, or `2`.
pub fn resolve_action(token: &str) -> &'static str {
    resolve(token.trim(), &ACTIONS)
}

/// Numeric code of a resolved token against a table.
fn code(token: &str, table: &[&'static str]) -> u8 {
    let head = token.split('_').next().unwrap_or("");
    if let Ok(code) = head.parse::<u8>() {
        if (code as usize) < table.len() {
            return code;
        }
        return 0;
    }
    let lowered = token.to_ascii_lowercase();
    table
        .iter()
        .position(|label| **label == lowered)
        .map_or(0, |i| i as u8)
}

/// Numeric expression code of a token like `1_joy`, `joy`, or `1`.
pub fn expression_code(token: &str) -> u8 {
    code(token.trim(), &EXPRESSIONS)
}

/// Numeric action code of a token like `2_nod`, `nod`, or `2`.
pub fn action_code(token: &str) -> u8 {
    code(token.trim(), &ACTIONS)
}

/// Parse a trailing `<expr>|<action>` code pair from the end of a
/// generation, e.g. `1_joy|2_nod`. Returns `None` when the fragment is
/// ordinary speakable text.
pub fn parse_code_pair(fragment: &str) -> Option<(&'static str, &'static str)> {
    let fragment = fragment.trim();
    let (left, right) = fragment.split_once('|')?;
    let left = left.trim();
    let right = right.trim();
    // Both sides must start with a digit; otherwise this is prose
    // that happens to contain a pipe.
    if !left.chars().next().is_some_and(|c| c.is_ascii_digit())
        || !right.chars().next().is_some_and(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some((resolve_expression(left), resolve_action(right)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_resolve_to_labels() {
        assert_eq!(expression(1), "joy");
        assert_eq!(action(2), "nod");
        assert_eq!(expression(200), "normal");
        assert_eq!(action(200), "wait");
    }

    #[test]
    fn tokens_resolve_in_every_spelling() {
        assert_eq!(resolve_expression("1_joy"), "joy");
        assert_eq!(resolve_expression("joy"), "joy");
        assert_eq!(resolve_expression("1"), "joy");
        assert_eq!(resolve_expression("garbage"), "normal");
        assert_eq!(resolve_action("2_nod"), "nod");
    }

    #[test]
    fn codes_resolve_from_tokens() {
        assert_eq!(expression_code("1_joy"), 1);
        assert_eq!(expression_code("joy"), 1);
        assert_eq!(action_code("2_nod"), 2);
        assert_eq!(action_code("unknown"), 0);
        assert_eq!(expression_code("42"), 0);
    }

    #[test]
    fn code_pair_parses_only_coded_fragments() {
        assert_eq!(parse_code_pair("1_joy|2_nod"), Some(("joy", "nod")));
        assert_eq!(parse_code_pair(" 6_surprise | 4_thinking "), Some(("surprise", "thinking")));
        assert_eq!(parse_code_pair("apples|oranges"), None);
        assert_eq!(parse_code_pair("no pipe here"), None);
    }
}
