//! Recipient address normalization and syntax validation.
//!
//! Lowercasing must happen at exactly one place and be used by every call
//! site that compares or stores an address against the suppression list —
//! the suppression check, the suppression upsert, and message insertion all
//! funnel through here. If any of the three used a different rule,
//! suppression could silently be bypassed.
use email_address::EmailAddress;

pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// The domain part of an address, as found in the string (not lowercased —
/// callers compare against an already-lowercased domain name, or lowercase
/// it themselves). Used to look up the sending domain's DKIM key; returns
/// `None` for an address without an `@`.
pub fn domain_part(address: &str) -> Option<&str> {
    address.rsplit_once('@').map(|(_, domain)| domain)
}

/// Rejects a syntactically invalid sender or recipient before it ever
/// reaches a `messages` row. The HTTP surface is expected to do this too;
/// the Store checks again so a malformed address can never reach the SMTP
/// client regardless of which caller inserted it.
pub fn validate(address: &str) -> Result<(), email_address::Error> {
    address.parse::<EmailAddress>().map(|_| ())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(normalize_address(" Gone@Example.COM "), "gone@example.com");
    }

    #[test]
    fn extracts_domain() {
        assert_eq!(domain_part("a@example.com"), Some("example.com"));
        assert_eq!(domain_part("not-an-email"), None);
    }

    #[test]
    fn validates_syntax() {
        assert!(validate("a@example.com").is_ok());
        assert!(validate("not-an-email").is_err());
    }
}
