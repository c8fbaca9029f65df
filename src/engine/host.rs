//! Host header validation (component C).
//!
//! Accepts only `ALPHA / DIGIT / '-' / '.'` in normal segments, a
//! bracketed IPv6 literal, and a single trailing `:port`. Lower-cases
//! the result only when uppercase actually appears, so the common case
//! returns the input unchanged with no allocation.

use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// Contains a byte outside the accepted set, an empty label, `..`,
    /// or an embedded NUL.
    Invalid,
}

/// Validate and normalize a `Host` header value (or request-line
/// authority). Trims one trailing solitary `.`, lower-cases if needed.
pub fn validate_host(raw: &str) -> Result<Cow<'_, str>, HostError> {
    if raw.is_empty() {
        return Err(HostError::Invalid);
    }

    let trimmed = raw.strip_suffix('.').unwrap_or(raw);
    if trimmed.is_empty() {
        return Err(HostError::Invalid);
    }

    let (host_part, port_part) = split_port(trimmed)?;
    validate_host_part(host_part)?;

    if let Some(port) = port_part {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(HostError::Invalid);
        }
    }

    if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
        Ok(Cow::Owned(trimmed.to_ascii_lowercase()))
    } else {
        Ok(Cow::Borrowed(trimmed))
    }
}

/// Split `host:port` respecting IPv6 literals (`[::1]:8080`). Returns
/// `(host_or_bracketed, Some(port))` or `(host, None)`.
fn split_port(s: &str) -> Result<(&str, Option<&str>), HostError> {
    if let Some(rest) = s.strip_prefix('[') {
        let close = rest.find(']').ok_or(HostError::Invalid)?;
        let (ipv6, after) = rest.split_at(close);
        let after = &after[1..]; // drop ']'
        if after.is_empty() {
            return Ok((ipv6, None));
        }
        let port = after.strip_prefix(':').ok_or(HostError::Invalid)?;
        return Ok((ipv6, Some(port)));
    }

    match s.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok((host, Some(port))),
        _ => Ok((s, None)),
    }
}

fn validate_host_part(host: &str) -> Result<(), HostError> {
    if host.is_empty() || host.contains("..") {
        return Err(HostError::Invalid);
    }
    // `[...]` IPv6 literal content was already unwrapped by `split_port`;
    // accept hex digits and colons there, otherwise the normal charset.
    let is_ipv6_literal = host.bytes().any(|b| b == b':');
    for label in host.split('.') {
        if label.is_empty() {
            return Err(HostError::Invalid);
        }
        let ok = label.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b == b'-' || (is_ipv6_literal && (b == b':' || b == b'%'))
        });
        if !ok {
            return Err(HostError::Invalid);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_host() {
        assert_eq!(validate_host("example.com").unwrap(), "example.com");
    }

    #[test]
    fn lowercases_only_when_needed() {
        assert_eq!(validate_host("Example.COM").unwrap(), "example.com");
        assert!(matches!(validate_host("example.com").unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn accepts_host_with_port() {
        assert_eq!(validate_host("example.com:8080").unwrap(), "example.com:8080");
    }

    #[test]
    fn accepts_ipv6_literal_with_port() {
        assert_eq!(validate_host("[::1]:8080").unwrap(), "[::1]:8080");
    }

    #[test]
    fn trims_trailing_solitary_dot() {
        assert_eq!(validate_host("example.com.").unwrap(), "example.com");
    }

    #[test]
    fn rejects_empty_label() {
        assert!(validate_host("example..com").is_err());
    }

    #[test]
    fn rejects_embedded_nul_and_path_separators() {
        assert!(validate_host("example.com\0").is_err());
        assert!(validate_host("example.com/evil").is_err());
    }

    #[test]
    fn rejects_bad_port() {
        assert!(validate_host("example.com:abc").is_err());
    }

    #[test]
    fn rejects_empty_host() {
        assert!(validate_host("").is_err());
    }
}
