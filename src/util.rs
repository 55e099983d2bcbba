//! Small shared helpers.

/// Truncate `s` to at most `max` characters, appending an ellipsis when
/// anything was cut. Multi-byte safe.
pub fn truncate_with_ellipsis(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    let truncated: String = s.chars().take(max).collect();
    format!("{truncated}…")
}

/// Constant-time string equality for secrets and signatures.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Current time as an RFC 3339 UTC timestamp (the store's column format).
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_string_unchanged() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
    }

    #[test]
    fn truncate_long_string() {
        let out = truncate_with_ellipsis("hello world", 5);
        assert_eq!(out, "hello…");
    }

    #[test]
    fn truncate_multibyte_safe() {
        let out = truncate_with_ellipsis("評分結果已發布", 3);
        assert_eq!(out, "評分結…");
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secrex"));
        assert!(!constant_time_eq("secret", "secre"));
        assert!(constant_time_eq("", ""));
    }
}
