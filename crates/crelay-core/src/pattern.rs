//! Glob-lite matching for model allow-lists: `*` matches any run of
//! characters, everything else is literal. Case-sensitive, like the
//! provider model ids themselves.

pub fn matches(pattern: &str, value: &str) -> bool {
    fn inner(pattern: &[u8], value: &[u8]) -> bool {
        match (pattern.first(), value.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], value)
                    || (!value.is_empty() && inner(pattern, &value[1..]))
            }
            (Some(p), Some(v)) if p == v => inner(&pattern[1..], &value[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

pub fn matches_any<'a>(patterns: impl IntoIterator<Item = &'a str>, value: &str) -> bool {
    patterns.into_iter().any(|pattern| matches(pattern, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_wildcard_forms() {
        assert!(matches("claude-3-5-sonnet", "claude-3-5-sonnet"));
        assert!(matches("claude-*", "claude-3-5-sonnet"));
        assert!(matches("*sonnet*", "claude-3-5-sonnet-20241022"));
        assert!(!matches("claude-*", "gemini-2.0-flash"));
        assert!(!matches("claude-3-5", "claude-3-5-sonnet"));
    }

    #[test]
    fn star_matches_empty_run() {
        assert!(matches("claude-*", "claude-"));
        assert!(matches("*", ""));
    }
}
