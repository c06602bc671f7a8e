// ABOUTME: Configuration and environment variable helpers for Corral
// ABOUTME: Exposes env var names and typed lookups with defaults

pub mod constants;

use std::str::FromStr;
use tracing::warn;

/// Parse `raw` for the setting `name`, falling back to `default` when it is
/// absent or does not parse.
pub fn parse_or<T>(name: &str, raw: Option<&str>, default: T) -> T
where
    T: FromStr,
{
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => match value.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Ignoring invalid value for {}: {:?}", name, value);
                default
            }
        },
        None => default,
    }
}

/// Read a string environment variable, treating empty values as unset.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_falls_back_on_parse_error() {
        let value: u64 = parse_or("CORRAL_TEST_BAD_NUMBER", Some("not-a-number"), 7);
        assert_eq!(value, 7);
    }

    #[test]
    fn test_parse_or_trims_input() {
        let value: f32 = parse_or("CORRAL_TEST_FLOAT", Some(" 1.5 "), 0.0);
        assert_eq!(value, 1.5);
    }

    #[test]
    fn test_env_string_filters_blank() {
        std::env::set_var("CORRAL_TEST_BLANK", "   ");
        assert_eq!(env_string("CORRAL_TEST_BLANK"), None);
        std::env::remove_var("CORRAL_TEST_BLANK");
    }
}
