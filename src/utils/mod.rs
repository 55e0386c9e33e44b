//! Utility functions and helpers.

pub mod log;
pub mod time;

use url::Url;

/// Parse a link, accepting protocol-relative links (`//host/path`) as https.
pub fn parse_link(link: &str) -> Option<Url> {
    match link.strip_prefix("//") {
        Some(rest) => Url::parse(&format!("https://{rest}")).ok(),
        None => Url::parse(link).ok(),
    }
}
