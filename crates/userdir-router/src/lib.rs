//! Protocol demultiplexing for the shared-listener deployment
//!
//! One port carries both gRPC and plain HTTP. Each request is classified
//! by negotiated protocol version and content type and dispatched to the
//! RPC server or the fallback handler. The predicate lives here, apart
//! from any listener, so the routing rule is testable on its own.

use std::net::SocketAddr;

use http::{header::CONTENT_TYPE, Request, Version};

/// Content-type prefix carried by gRPC requests.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Path prefix where domain-validation proofs are served.
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Where a request should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The gRPC server.
    Rpc,
    /// The plain HTTP fallback handler.
    Fallback,
}

/// A request is gRPC when it arrived over HTTP/2 with a gRPC content type.
/// Everything else, HTTP/1.x included, belongs to the fallback handler.
pub fn is_grpc_request(version: Version, content_type: Option<&str>) -> bool {
    version == Version::HTTP_2
        && content_type
            .map(|ct| ct.starts_with(GRPC_CONTENT_TYPE))
            .unwrap_or(false)
}

/// Classify one request.
pub fn dispatch<B>(request: &Request<B>) -> Dispatch {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    if is_grpc_request(request.version(), content_type) {
        Dispatch::Rpc
    } else {
        Dispatch::Fallback
    }
}

/// Token of a domain-validation challenge request, if the path is one.
pub fn acme_challenge_token(path: &str) -> Option<&str> {
    path.strip_prefix(ACME_CHALLENGE_PREFIX)
        .filter(|token| !token.is_empty() && !token.contains('/'))
}

/// Transport-security parameters negotiated for a connection, as reported
/// by the fallback handler.
#[derive(Debug, Clone, Default)]
pub struct TlsSessionInfo {
    pub protocol: Option<String>,
    pub cipher_suite: Option<String>,
    pub alpn: Option<String>,
    pub server_name: Option<String>,
}

/// Plaintext diagnostic body for non-gRPC callers.
pub fn fallback_body(peer: SocketAddr, tls: Option<&TlsSessionInfo>) -> String {
    let mut body = String::from("user directory service\n\n");
    body.push_str(&format!("caller: {peer}\n"));

    match tls {
        Some(info) => {
            body.push_str(&format!(
                "tls protocol: {}\n",
                info.protocol.as_deref().unwrap_or("unknown")
            ));
            body.push_str(&format!(
                "cipher suite: {}\n",
                info.cipher_suite.as_deref().unwrap_or("unknown")
            ));
            body.push_str(&format!(
                "alpn: {}\n",
                info.alpn.as_deref().unwrap_or("none")
            ));
            if let Some(sni) = &info.server_name {
                body.push_str(&format!("server name: {sni}\n"));
            }
        }
        None => body.push_str("tls: none\n"),
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(version: Version, content_type: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().version(version).uri("/");
        if let Some(ct) = content_type {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_grpc_request_goes_to_rpc() {
        let req = request(Version::HTTP_2, Some("application/grpc"));
        assert_eq!(dispatch(&req), Dispatch::Rpc);
    }

    #[test]
    fn test_grpc_proto_subtype_goes_to_rpc() {
        let req = request(Version::HTTP_2, Some("application/grpc+proto"));
        assert_eq!(dispatch(&req), Dispatch::Rpc);
    }

    #[test]
    fn test_plain_http2_goes_to_fallback() {
        let req = request(Version::HTTP_2, Some("text/html"));
        assert_eq!(dispatch(&req), Dispatch::Fallback);
    }

    #[test]
    fn test_missing_content_type_goes_to_fallback() {
        let req = request(Version::HTTP_2, None);
        assert_eq!(dispatch(&req), Dispatch::Fallback);
    }

    #[test]
    fn test_http11_never_rpc_even_with_grpc_content_type() {
        let req = request(Version::HTTP_11, Some("application/grpc"));
        assert_eq!(dispatch(&req), Dispatch::Fallback);
    }

    #[test]
    fn test_challenge_token_extraction() {
        assert_eq!(
            acme_challenge_token("/.well-known/acme-challenge/tok123"),
            Some("tok123")
        );
        assert_eq!(acme_challenge_token("/.well-known/acme-challenge/"), None);
        assert_eq!(
            acme_challenge_token("/.well-known/acme-challenge/a/b"),
            None
        );
        assert_eq!(acme_challenge_token("/index.html"), None);
    }

    #[test]
    fn test_fallback_body_reports_peer_and_tls() {
        let peer: SocketAddr = "203.0.113.9:52100".parse().unwrap();
        let info = TlsSessionInfo {
            protocol: Some("TLSv1_3".to_string()),
            cipher_suite: Some("TLS13_AES_128_GCM_SHA256".to_string()),
            alpn: Some("h2".to_string()),
            server_name: Some("example.com".to_string()),
        };

        let body = fallback_body(peer, Some(&info));
        assert!(body.contains("203.0.113.9:52100"));
        assert!(body.contains("TLSv1_3"));
        assert!(body.contains("example.com"));

        let plain = fallback_body(peer, None);
        assert!(plain.contains("tls: none"));
    }
}
