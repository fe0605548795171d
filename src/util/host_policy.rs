//! Which hosts feedline is willing to contact.
//!
//! Feed URLs come from users, OPML files and redirects chosen by remote
//! servers. [`HostPolicy::PublicOnly`] keeps all of them away from loopback,
//! private and link-local addresses. Hostnames are checked as written; they
//! are not resolved.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use url::{Host, Url};

/// Why a URL was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlRejected {
    #[error("Invalid URL: {0}")]
    Malformed(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    Scheme(String),
    #[error("URL has no host")]
    NoHost,
    /// Loopback, private, link-local or unspecified address, or a
    /// `localhost` name.
    #[error("Host not allowed: {0}")]
    PrivateHost(String),
}

/// Network reach allowed for feed and enclosure URLs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostPolicy {
    /// Only hosts on the public internet.
    #[default]
    PublicOnly,
    /// Any http(s) host, including the local machine and the LAN.
    AllowPrivate,
}

impl HostPolicy {
    pub fn from_allow_private(allow: bool) -> Self {
        if allow {
            HostPolicy::AllowPrivate
        } else {
            HostPolicy::PublicOnly
        }
    }

    /// Parses `raw` and checks it with [`HostPolicy::check`].
    ///
    /// # Examples
    ///
    /// ```
    /// use feedline::util::HostPolicy;
    ///
    /// let url = HostPolicy::PublicOnly.parse("https://example.com/feed.xml").unwrap();
    /// assert_eq!(url.host_str(), Some("example.com"));
    /// assert!(HostPolicy::PublicOnly.parse("http://192.168.1.1/feed").is_err());
    /// assert!(HostPolicy::AllowPrivate.parse("http://192.168.1.1/feed").is_ok());
    /// assert!(HostPolicy::AllowPrivate.parse("file:///etc/passwd").is_err());
    /// ```
    pub fn parse(self, raw: &str) -> Result<Url, UrlRejected> {
        let url = Url::parse(raw.trim())?;
        self.check(&url)?;
        Ok(url)
    }

    /// Checks an already parsed URL. The scheme must be http or https under
    /// either policy.
    pub fn check(self, url: &Url) -> Result<(), UrlRejected> {
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(UrlRejected::Scheme(other.to_owned())),
        }
        let host = url.host().ok_or(UrlRejected::NoHost)?;
        if self == HostPolicy::AllowPrivate {
            return Ok(());
        }
        let private = match &host {
            Host::Domain(name) => is_localhost_name(name),
            Host::Ipv4(ip) => is_private_v4(ip),
            Host::Ipv6(ip) => is_private_v6(ip),
        };
        if private {
            return Err(UrlRejected::PrivateHost(host.to_string()));
        }
        Ok(())
    }

    pub fn allows(self, url: &Url) -> bool {
        self.check(url).is_ok()
    }
}

/// Whether `s` looks like an absolute web URL (`http://` or `https://` with a host).
///
/// Used by the item repair heuristics: some feeds put the only usable URL in
/// `<guid>`, and a guid is only promoted to a link when it passes this check.
/// No host policy applies here.
///
/// # Examples
///
/// ```
/// use feedline::util::is_web_url;
///
/// assert!(is_web_url("http://example.com/x"));
/// assert!(!is_web_url("urn:uuid:1234"));
/// assert!(!is_web_url("example.com/x"));
/// ```
pub fn is_web_url(s: &str) -> bool {
    let s = s.trim();
    let has_prefix = |prefix: &str| {
        s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    };
    if !has_prefix("http://") && !has_prefix("https://") {
        return false;
    }
    Url::parse(s).is_ok_and(|u| u.host_str().is_some_and(|h| !h.is_empty()))
}

fn is_localhost_name(name: &str) -> bool {
    let name = name.trim_end_matches('.');
    name.eq_ignore_ascii_case("localhost") || name.to_ascii_lowercase().ends_with(".localhost")
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7
        || (first & 0xfe00) == 0xfc00
        // fe80::/10
        || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rejected(raw: &str) -> UrlRejected {
        HostPolicy::PublicOnly.parse(raw).unwrap_err()
    }

    #[test]
    fn test_is_web_url() {
        assert!(is_web_url("https://example.com"));
        assert!(is_web_url("  HTTP://Example.com/a?b=c "));
        assert!(!is_web_url("ftp://example.com/file"));
        assert!(!is_web_url("tag:example.com,2024:1"));
        assert!(!is_web_url("http://"));
        assert!(!is_web_url(""));
    }

    #[test]
    fn test_public_hosts_pass() {
        for raw in [
            "https://example.com/feed.xml",
            "http://news.example.org",
            "https://example.com:443/feed.xml",
            "http://93.184.216.34/rss",
        ] {
            assert!(HostPolicy::PublicOnly.parse(raw).is_ok(), "{raw}");
        }
    }

    #[test]
    fn test_scheme_checked_under_both_policies() {
        for policy in [HostPolicy::PublicOnly, HostPolicy::AllowPrivate] {
            assert_eq!(
                policy.parse("file:///etc/passwd").unwrap_err(),
                UrlRejected::Scheme("file".into())
            );
            assert!(matches!(
                policy.parse("gopher://example.com").unwrap_err(),
                UrlRejected::Scheme(_)
            ));
        }
        assert!(matches!(rejected("not a url"), UrlRejected::Malformed(_)));
    }

    #[test]
    fn test_local_names_and_addresses_blocked() {
        for raw in [
            "http://localhost/feed",
            "http://LOCALHOST./feed",
            "http://feeds.localhost/rss",
            "http://127.0.0.1:8080/feed",
            "http://10.0.0.1/feed",
            "http://172.16.0.1/feed",
            "http://192.168.1.1:3000/feed",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/feed",
            "http://[::1]/feed",
            "http://[fe80::1]/feed",
            "http://[fd00::5]/feed",
        ] {
            assert!(
                matches!(rejected(raw), UrlRejected::PrivateHost(_)),
                "{raw} should be blocked"
            );
        }
    }

    #[test]
    fn test_obfuscated_loopback_blocked() {
        // The url crate normalizes these to dotted IPv4 before the check.
        assert!(matches!(rejected("http://2130706433/"), UrlRejected::PrivateHost(_)));
        assert!(matches!(rejected("http://0x7f.1/"), UrlRejected::PrivateHost(_)));
        assert!(matches!(
            rejected("http://[::ffff:127.0.0.1]/feed"),
            UrlRejected::PrivateHost(_)
        ));
    }

    #[test]
    fn test_allow_private_accepts_lan() {
        let url = HostPolicy::AllowPrivate.parse("http://127.0.0.1:8080/feed").unwrap();
        assert_eq!(url.port(), Some(8080));
        assert!(HostPolicy::AllowPrivate.allows(&url));
        assert!(!HostPolicy::PublicOnly.allows(&url));
    }

    #[test]
    fn test_from_allow_private() {
        assert_eq!(HostPolicy::from_allow_private(false), HostPolicy::PublicOnly);
        assert_eq!(HostPolicy::from_allow_private(true), HostPolicy::AllowPrivate);
        assert_eq!(HostPolicy::default(), HostPolicy::PublicOnly);
    }
}
