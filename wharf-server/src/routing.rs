//! Pure host-matching logic for the data plane.
//!
//! Route lookup itself lives on the [`crate::store::Store`] — a hostname
//! maps to at most one `Route` — but the normalization rule a request's Host
//! header must go through before that lookup is pure and worth testing in
//! isolation, free of any Pingora types.

/// Strip an optional `:port` suffix and lowercase the remainder. `host`
/// header values are matched against the Store's route keys after this
/// normalization.
pub fn normalize_host(host: &str) -> String {
    let without_port = match host.rsplit_once(':') {
        // Only treat this as a port split if the remainder is all-digits and
        // the host is not a bare IPv6 literal (which uses colons itself).
        Some((h, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    };
    without_port.trim().to_lowercase()
}

/// Does this request path begin the ACME HTTP-01 challenge prefix?
pub fn is_acme_challenge_path(path: &str) -> bool {
    path.starts_with("/.well-known/acme-challenge/")
}

/// Extract the token from a challenge path, if well-formed.
pub fn acme_challenge_token(path: &str) -> Option<&str> {
    path.strip_prefix("/.well-known/acme-challenge/")
        .filter(|t| !t.is_empty() && !t.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_host_strips_port_and_lowercases() {
        assert_eq!(normalize_host("Example.COM:8443"), "example.com");
    }

    #[test]
    fn normalize_host_without_port_is_unchanged_but_lowercased() {
        assert_eq!(normalize_host("Example.com"), "example.com");
    }

    #[test]
    fn normalize_host_preserves_ipv6_literal_without_treating_it_as_a_port() {
        assert_eq!(normalize_host("::1"), "::1");
    }

    #[test]
    fn is_acme_challenge_path_matches_well_known_prefix() {
        assert!(is_acme_challenge_path(
            "/.well-known/acme-challenge/abc123"
        ));
        assert!(!is_acme_challenge_path("/other/path"));
    }

    #[test]
    fn acme_challenge_token_extracts_the_trailing_segment() {
        assert_eq!(
            acme_challenge_token("/.well-known/acme-challenge/abc123"),
            Some("abc123")
        );
        assert_eq!(acme_challenge_token("/.well-known/acme-challenge/"), None);
        assert_eq!(
            acme_challenge_token("/.well-known/acme-challenge/a/b"),
            None
        );
    }
}
