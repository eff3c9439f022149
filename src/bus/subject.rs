//! Subject pattern matching for the broadcast bus.

/// Check if a subject matches a subscription pattern.
///
/// Matching rules (token-wise on `.`):
/// - `*` matches exactly one token
/// - `>` as the last token matches one or more remaining tokens
/// - any other token must match exactly
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');

    for token in pattern.split('.') {
        match (token, subject_tokens.next()) {
            (">", Some(_)) => return true,
            ("*", Some(s)) if !s.is_empty() => {}
            (t, Some(s)) if t == s => {}
            _ => return false,
        }
    }

    subject_tokens.next().is_none()
}
