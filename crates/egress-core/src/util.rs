use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Parse a boolean-like flag.
/// Accepts 1/0, true/false, yes/no, on/off (case-insensitive).
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read an environment variable and parse it as a boolean flag using [`parse_bool_flag`].
pub fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|raw| parse_bool_flag(&raw))
}

/// Non-empty, trimmed environment value.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an environment value; `Err` carries the raw text when it does not parse.
pub fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, String> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| raw),
    }
}

#[inline]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env;

    #[test]
    fn parse_bool_flag_recognizes_common_values() {
        assert_eq!(parse_bool_flag("true"), Some(true));
        assert_eq!(parse_bool_flag("YES"), Some(true));
        assert_eq!(parse_bool_flag("0"), Some(false));
        assert_eq!(parse_bool_flag("off"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
        assert_eq!(parse_bool_flag(""), None);
    }

    #[test]
    #[serial_test::serial]
    fn env_parse_reports_raw_value_on_failure() {
        let mut guard = env::guard();
        guard.set("EGRESS_TEST_NUM", " 42 ");
        assert_eq!(env_parse::<u16>("EGRESS_TEST_NUM"), Ok(Some(42)));
        guard.set("EGRESS_TEST_NUM", "forty");
        assert_eq!(env_parse::<u16>("EGRESS_TEST_NUM"), Err("forty".to_string()));
        guard.set("EGRESS_TEST_NUM", "  ");
        assert_eq!(env_parse::<u16>("EGRESS_TEST_NUM"), Ok(None));
        guard.set("EGRESS_TEST_BOOL", "on");
        assert_eq!(env_bool("EGRESS_TEST_BOOL"), Some(true));
        guard.remove("EGRESS_TEST_BOOL");
        assert_eq!(env_bool("EGRESS_TEST_BOOL"), None);
    }
}
