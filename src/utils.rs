use chrono::Utc;

pub struct Utils {}

impl Utils {
    /// Current time as Unix seconds (UTC).
    pub fn now_secs() -> i64 {
        Utc::now().timestamp()
    }

    /// Truncate to at most `max_chars` characters without splitting a code point.
    pub fn truncate_chars(s: &str, max_chars: usize) -> String {
        match s.char_indices().nth(max_chars) {
            Some((idx, _)) => s[..idx].to_owned(),
            None => s.to_owned(),
        }
    }

    pub fn opt_truncate(s: Option<&str>, max_chars: usize) -> Option<String> {
        s.filter(|s| !s.is_empty())
            .map(|s| Self::truncate_chars(s, max_chars))
    }
}
