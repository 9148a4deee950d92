//! Vendor implementations of [`DnsProvider`](super::DnsProvider).

pub mod aliyun;
pub mod cloudflare;
pub mod namesilo;
pub mod tencent;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Everything but the RFC 3986 unreserved characters.
const RFC3986: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encodes `input` keeping only the RFC 3986 unreserved characters.
pub(crate) fn percent_encode(input: &str) -> String {
    utf8_percent_encode(input, RFC3986).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("a-Z_0.~"), "a-Z_0.~");
        assert_eq!(percent_encode("a b*c/"), "a%20b%2Ac%2F");
        assert_eq!(percent_encode("2024-01-02T03:04:05Z"), "2024-01-02T03%3A04%3A05Z");
        assert_eq!(percent_encode("é"), "%C3%A9");
    }
}
