use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::{HeaderMap, request::Parts};

const UNKNOWN_CLIENT: &str = "unknown";

/// Derive the usage bucket for a request: first `X-Forwarded-For` hop,
/// then `X-Real-IP`, then the TCP peer.
pub fn resolve_client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(first) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        && !first.is_empty()
    {
        return first.to_string();
    }

    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        && !real_ip.is_empty()
    {
        return real_ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Extractor yielding the resolved client key
pub struct ClientIdentity(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self(resolve_client_key(&parts.headers, peer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("192.168.1.20:51234".parse().unwrap())
    }

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let h = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1, 10.0.0.2"),
            ("x-real-ip", "198.51.100.1"),
        ]);
        assert_eq!(resolve_client_key(&h, peer()), "203.0.113.7");
    }

    #[test]
    fn test_empty_forwarded_for_falls_through() {
        let h = headers(&[("x-forwarded-for", " , 10.0.0.1"), ("x-real-ip", " 198.51.100.1 ")]);
        assert_eq!(resolve_client_key(&h, peer()), "198.51.100.1");
    }

    #[test]
    fn test_peer_address_fallback() {
        assert_eq!(resolve_client_key(&HeaderMap::new(), peer()), "192.168.1.20");

        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(resolve_client_key(&HeaderMap::new(), Some(v6)), "2001:db8::1");
    }

    #[test]
    fn test_unknown_without_any_source() {
        assert_eq!(resolve_client_key(&HeaderMap::new(), None), "unknown");
    }
}
