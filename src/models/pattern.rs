//! Tracked URL patterns.

use serde::{Deserialize, Serialize};
use url::Url;

/// Host suffix of the Wikipedia Library access proxy.
pub const LIBRARY_PROXY_SUFFIX: &str = ".wikipedialibrary.idm.oclc.org";

/// A tracked URL fragment, e.g. `jstor.org` or `gale.com/ebooks`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlPattern {
    pub id: i64,

    /// Fragment matched against incoming links. Not necessarily a valid URL.
    pub url: String,

    pub collection_id: Option<i64>,
}

impl UrlPattern {
    /// The pattern as rewritten by the institutional proxy (`.` becomes `-`).
    pub fn proxied_url(&self) -> String {
        self.url.replace('.', "-")
    }

    /// Loose association: the raw or proxied fragment occurs anywhere in the link.
    pub fn is_substring_of(&self, link: &str) -> bool {
        link.contains(&self.url) || link.contains(&self.proxied_url())
    }

    /// Host part of the pattern, without a leading `*.`.
    fn host(&self) -> &str {
        let host = self.url.split('/').next().unwrap_or_default();
        host.strip_prefix("*.").unwrap_or(host)
    }

    /// Path part of the pattern including its leading `/`, if any.
    fn path(&self) -> Option<&str> {
        self.url.find('/').map(|idx| &self.url[idx..])
    }

    /// Whether a parsed link belongs to this pattern's domain.
    ///
    /// The link host must be the pattern host or one of its subdomains, or the
    /// library proxy host for it. A pattern path must prefix the link path.
    pub fn tracks(&self, link: &Url) -> bool {
        let Some(link_host) = link.host_str() else {
            return false;
        };
        let host = self.host();
        if host.is_empty() {
            return false;
        }

        let direct = link_host == host || link_host.ends_with(&format!(".{host}"));
        let proxied = link_host
            .strip_suffix(LIBRARY_PROXY_SUFFIX)
            .map(|prefix| {
                let proxied_host = host.replace('.', "-");
                prefix == proxied_host || prefix.ends_with(&format!("-{proxied_host}"))
            })
            .unwrap_or(false);

        if !(direct || proxied) {
            return false;
        }

        match self.path() {
            Some(path) => link.path().starts_with(path),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(url: &str) -> UrlPattern {
        UrlPattern {
            id: 1,
            url: url.to_string(),
            collection_id: None,
        }
    }

    #[test]
    fn test_proxied_url() {
        assert_eq!(pattern("gale.com").proxied_url(), "gale-com");
        assert_eq!(
            pattern("platform.almanhal.com").proxied_url(),
            "platform-almanhal-com"
        );
    }

    #[test]
    fn test_tracks_subdomain_and_www() {
        let p = pattern("test.com");
        assert!(p.tracks(&Url::parse("https://test.com/testurl").unwrap()));
        assert!(p.tracks(&Url::parse("https://foo.test.com/testurl").unwrap()));
        assert!(p.tracks(&Url::parse("https://www.test.com/testurl").unwrap()));
    }

    #[test]
    fn test_tracks_rejects_partial_domain() {
        let p = pattern("test.com");
        assert!(!p.tracks(&Url::parse("https://thisisatest.com/").unwrap()));
        assert!(!p.tracks(&Url::parse("https://web.archive.org/https://test.com/").unwrap()));
    }

    #[test]
    fn test_tracks_library_proxy_only() {
        let p = pattern("test.com");
        assert!(p.tracks(&Url::parse("https://www-test-com.wikipedialibrary.idm.oclc.org/").unwrap()));
        assert!(!p.tracks(&Url::parse("https://www-test-com.university.idm.oclc.org/").unwrap()));
    }

    #[test]
    fn test_tracks_wildcard_and_path() {
        let p = pattern("*.testurl.com/test");
        assert!(p.tracks(&Url::parse("https://www.testurl.com/test/page").unwrap()));
        assert!(!p.tracks(&Url::parse("https://www.testurl.com/other").unwrap()));
    }
}
