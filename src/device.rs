//! Device-identifier parsing.
//!
//! Event sources are device locators such as `mac:11:22:33:44:55:66/config`.
//! Deliveries carry the canonical identifier (scheme plus normalized id,
//! without the trailing service path) in the `X-Webpa-Device-Id` and
//! `X-Webpa-Device-Name` headers.

use std::sync::OnceLock;

use regex::Regex;

fn locator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?i)(mac|uuid|dns|serial):([^/]+)").expect("device locator pattern is valid")
    })
}

/// Parse the canonical device identifier out of a source locator.
///
/// The scheme is lowercased and `mac` ids are normalized to twelve bare
/// hex digits. Returns `None` for locators that do not name a device.
#[must_use]
pub fn parse_device_id(source: &str) -> Option<String> {
    let captures = locator_pattern().captures(source)?;
    let scheme = captures[1].to_ascii_lowercase();
    let id = &captures[2];

    if scheme == "mac" {
        let digits: String = id
            .chars()
            .filter(char::is_ascii_hexdigit)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if digits.len() != 12 {
            return None;
        }
        return Some(format!("mac:{digits}"));
    }

    Some(format!("{scheme}:{id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mac_with_separators() {
        assert_eq!(
            parse_device_id("mac:11:22:33:44:55:66/config"),
            Some("mac:112233445566".to_string())
        );
        assert_eq!(
            parse_device_id("MAC:11-aa-BB-44-55-66"),
            Some("mac:11aabb445566".to_string())
        );
    }

    #[test]
    fn parses_other_schemes() {
        assert_eq!(
            parse_device_id("uuid:f81d4fae-7dec/service"),
            Some("uuid:f81d4fae-7dec".to_string())
        );
        assert_eq!(
            parse_device_id("serial:ABC123"),
            Some("serial:ABC123".to_string())
        );
        assert_eq!(
            parse_device_id("dns:gateway.example.net"),
            Some("dns:gateway.example.net".to_string())
        );
    }

    #[test]
    fn rejects_non_device_sources() {
        assert_eq!(parse_device_id("https://example.com"), None);
        assert_eq!(parse_device_id("mac:112233"), None);
        assert_eq!(parse_device_id(""), None);
    }
}
