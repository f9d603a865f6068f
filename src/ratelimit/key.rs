//! Caller identity and bucket key derivation.

use axum::http::HeaderMap;
use std::net::IpAddr;

/// Header consulted first when resolving the caller identity.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Identity used when neither a forwarded address nor a peer address is known.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// The caller a bucket is counted against.
///
/// Resolution precedence is fixed:
/// 1. the first address listed in `X-Forwarded-For`,
/// 2. the transport peer address,
/// 3. the literal `unknown`.
///
/// Behind a proxy this limits per real client. A deployment without a trusted
/// proxy in front should strip the header at the edge, since clients can set it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Resolve the identity from request headers and the peer address.
    pub fn resolve(headers: &HeaderMap, peer: Option<IpAddr>) -> Self {
        let forwarded = headers
            .get(FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty());

        match (forwarded, peer) {
            (Some(first), _) => Self(first.to_string()),
            (None, Some(ip)) => Self(ip.to_string()),
            (None, None) => Self(UNKNOWN_IDENTITY.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of one bucket: `{key_prefix}:{identity}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn new(key_prefix: &str, identity: &ClientIdentity) -> Self {
        Self(format!("{}:{}", key_prefix, identity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BucketKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_forwarded_for_first_entry_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let peer: IpAddr = "10.0.0.1".parse().unwrap();

        let identity = ClientIdentity::resolve(&headers, Some(peer));
        assert_eq!(identity.as_str(), "203.0.113.7");
    }

    #[test]
    fn test_peer_used_without_header() {
        let headers = HeaderMap::new();
        let peer: IpAddr = "192.168.1.20".parse().unwrap();

        let identity = ClientIdentity::resolve(&headers, Some(peer));
        assert_eq!(identity.as_str(), "192.168.1.20");
    }

    #[test]
    fn test_empty_header_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static(" , 10.0.0.1"));
        let peer: IpAddr = "::1".parse().unwrap();

        let identity = ClientIdentity::resolve(&headers, Some(peer));
        assert_eq!(identity.as_str(), "::1");
    }

    #[test]
    fn test_unknown_sentinel() {
        let identity = ClientIdentity::resolve(&HeaderMap::new(), None);
        assert_eq!(identity.as_str(), UNKNOWN_IDENTITY);
    }

    #[test]
    fn test_bucket_key_format() {
        let identity = ClientIdentity::new("1.2.3.4");
        let key = BucketKey::new("login", &identity);
        assert_eq!(key.as_str(), "login:1.2.3.4");
        assert_eq!(key.to_string(), "login:1.2.3.4");
    }

    #[test]
    fn test_prefixes_do_not_collide() {
        let identity = ClientIdentity::new("1.2.3.4");
        assert_ne!(
            BucketKey::new("login", &identity),
            BucketKey::new("invite", &identity)
        );
    }
}
