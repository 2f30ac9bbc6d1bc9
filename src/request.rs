//! Request assembly and transport dispatch.
//!
//! Builds the on-the-wire header sequence, pseudo-headers first in the
//! fixed order `:authority, :method, :path, :scheme`, and routes the
//! message to the HTTP/2 or HTTP/3 engine based on the target scheme.

use crate::dns_cache::DnsCache;
use crate::error::RequestError;
use crate::headers::{Header, Headers};
use crate::{http2, http3};
use std::time::Duration;
use url::Url;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";

/// Everything a single probe request needs.
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub target: Url,
    pub method: String,
    /// Overrides the address derived from the target when set.
    pub connect_addr: Option<String>,
    pub headers: Headers,
    /// Emit only `headers`, verbatim, without any pseudo-headers. Some
    /// transforms depend on supplying those themselves, in their own
    /// order.
    pub no_auto_headers: bool,
    pub no_user_agent: bool,
    pub body: Vec<Vec<u8>>,
    pub timeout: Duration,
    pub add_content_length: bool,
    pub body_parts_delay: Duration,
    pub skip_body_end_flag: bool,
}

impl RequestParams {
    pub fn new(target: Url, method: impl Into<String>, timeout: Duration) -> Self {
        RequestParams {
            target,
            method: method.into(),
            connect_addr: None,
            headers: Headers::new(),
            no_auto_headers: false,
            no_user_agent: false,
            body: Vec::new(),
            timeout,
            add_content_length: false,
            body_parts_delay: Duration::ZERO,
            skip_body_end_flag: false,
        }
    }
}

/// A request or response: header sequence plus body as separate chunks.
/// Chunks stay separate so the wire engines can frame and delay them
/// individually.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpMessage {
    pub headers: Headers,
    pub body: Vec<Vec<u8>>,
}

impl HttpMessage {
    pub fn body_len(&self) -> usize {
        self.body.iter().map(Vec::len).sum()
    }
}

enum Transport {
    Http2,
    Http3,
}

fn transport_for(url: &Url) -> Result<Transport, RequestError> {
    match url.scheme() {
        "https" | "https+http2" => Ok(Transport::Http2),
        "https+h3" => Ok(Transport::Http3),
        other => Err(RequestError::InvalidScheme(other.to_string())),
    }
}

/// `host[:port]` part of the URL, as it appears in `:authority`.
fn url_host(url: &Url) -> Result<String, RequestError> {
    let host = url.host_str().ok_or_else(|| RequestError::InvalidTarget {
        target: url.to_string(),
        reason: "missing host".to_string(),
    })?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Assembles the final header sequence for the message.
///
/// A user header whose name matches a default replaces that default's
/// value in place (so pseudo-headers stay first and unique); additional
/// duplicates of the same name are appended as-is.
pub fn build_headers(params: &RequestParams) -> Result<Headers, RequestError> {
    let mut headers = if params.no_auto_headers {
        params.headers.clone()
    } else {
        let path = match params.target.path() {
            "" => "/",
            p => p,
        };
        let mut defaults = vec![
            Header::new(":authority", url_host(&params.target)?),
            Header::new(":method", params.method.as_bytes()),
            Header::new(":path", path),
            Header::new(":scheme", "https"),
        ];
        if !params.no_user_agent {
            defaults.push(Header::new("user-agent", DEFAULT_USER_AGENT));
        }

        let mut to_skip: Vec<Vec<u8>> = Vec::new();
        for default in defaults.iter_mut() {
            if let Some(value) = params.headers.get(&default.name) {
                default.value = value.to_vec();
                to_skip.push(default.name.clone());
            }
        }

        let mut headers = Headers(defaults);
        for h in &params.headers {
            if let Some(at) = to_skip.iter().position(|name| *name == h.name.as_slice()) {
                // Only the first occurrence replaced a default.
                to_skip.remove(at);
                continue;
            }
            headers.push(h.clone());
        }
        headers
    };

    if params.add_content_length {
        let total: usize = params.body.iter().map(Vec::len).sum();
        headers.push(Header::new("content-length", total.to_string()));
    }

    Ok(headers)
}

/// Builds the message and sends it over the scheme-selected transport.
pub fn send_request(params: &RequestParams, dns: &DnsCache) -> Result<HttpMessage, RequestError> {
    let transport = transport_for(&params.target)?;
    let headers = build_headers(params)?;
    let message = HttpMessage {
        headers,
        body: params.body.clone(),
    };

    let host = url_host(&params.target)?;
    let connect_addr = params.connect_addr.as_deref().unwrap_or(&host);
    let server_name = params.target.host_str().unwrap_or_default();

    match transport {
        Transport::Http2 => http2::send_request(
            connect_addr,
            server_name,
            &message,
            params.timeout,
            params.body_parts_delay,
            params.skip_body_end_flag,
            dns,
        ),
        Transport::Http3 => http3::send_request(
            connect_addr,
            server_name,
            &message,
            params.timeout,
            params.body_parts_delay,
            params.skip_body_end_flag,
            dns,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(target: &str) -> RequestParams {
        RequestParams::new(
            Url::parse(target).unwrap(),
            "GET",
            Duration::from_secs(10),
        )
    }

    fn names(headers: &Headers) -> Vec<Vec<u8>> {
        headers.iter().map(|h| h.name.clone()).collect()
    }

    #[test]
    fn pseudo_headers_first_in_fixed_order() {
        let mut p = params("https://example.com/x?q=1");
        p.headers.push(Header::new("x-custom", "1"));
        p.headers.push(Header::new("x-other", "2"));
        let headers = build_headers(&p).unwrap();
        assert_eq!(
            names(&headers),
            vec![
                b":authority".to_vec(),
                b":method".to_vec(),
                b":path".to_vec(),
                b":scheme".to_vec(),
                b"user-agent".to_vec(),
                b"x-custom".to_vec(),
                b"x-other".to_vec(),
            ]
        );
        assert_eq!(headers.get(b":path"), Some(&b"/x"[..]));
        assert_eq!(headers.get(b":scheme"), Some(&b"https"[..]));
    }

    #[test]
    fn authority_keeps_explicit_port() {
        let p = params("https://example.com:8443/");
        let headers = build_headers(&p).unwrap();
        assert_eq!(headers.get(b":authority"), Some(&b"example.com:8443"[..]));
    }

    #[test]
    fn user_header_overrides_default_in_place() {
        let mut p = params("https://example.com/");
        p.headers.push(Header::new(":path", "/evil HTTP/1.1\r\nx: y"));
        p.headers.push(Header::new("user-agent", "custom"));
        let headers = build_headers(&p).unwrap();

        // Replaced values, still exactly one occurrence each, still in
        // pseudo-header position.
        assert_eq!(names(&headers).len(), 5);
        assert_eq!(names(&headers)[2], b":path".to_vec());
        assert_eq!(headers.get(b":path"), Some(&b"/evil HTTP/1.1\r\nx: y"[..]));
        assert_eq!(headers.get(b"user-agent"), Some(&b"custom"[..]));
    }

    #[test]
    fn second_duplicate_of_default_is_appended() {
        let mut p = params("https://example.com/");
        p.headers.push(Header::new(":path", "/a"));
        p.headers.push(Header::new(":path", "/b"));
        let headers = build_headers(&p).unwrap();
        let paths: Vec<_> = headers
            .iter()
            .filter(|h| h.name == b":path")
            .map(|h| h.value.clone())
            .collect();
        assert_eq!(paths, vec![b"/a".to_vec(), b"/b".to_vec()]);
        // The first copy sits in the pseudo block, the second at the end.
        assert_eq!(names(&headers)[2], b":path".to_vec());
        assert_eq!(names(&headers).last().unwrap(), &b":path".to_vec());
    }

    #[test]
    fn no_auto_headers_passes_through_verbatim() {
        let mut p = params("https://example.com/");
        p.no_auto_headers = true;
        p.headers.push(Header::new("zzz", "1"));
        p.headers.push(Header::new(":method", "GET"));
        let headers = build_headers(&p).unwrap();
        assert_eq!(names(&headers), vec![b"zzz".to_vec(), b":method".to_vec()]);
    }

    #[test]
    fn no_user_agent_drops_default() {
        let mut p = params("https://example.com/");
        p.no_user_agent = true;
        let headers = build_headers(&p).unwrap();
        assert_eq!(headers.get(b"user-agent"), None);
        assert_eq!(headers.len(), 4);
    }

    #[test]
    fn content_length_sums_chunks() {
        let mut p = params("https://example.com/");
        p.add_content_length = true;
        p.body = vec![b"abc".to_vec(), b"de".to_vec()];
        let headers = build_headers(&p).unwrap();
        assert_eq!(headers.get(b"content-length"), Some(&b"5"[..]));
    }

    #[test]
    fn scheme_dispatch() {
        assert!(matches!(
            transport_for(&Url::parse("https://a/").unwrap()),
            Ok(Transport::Http2)
        ));
        assert!(matches!(
            transport_for(&Url::parse("https+http2://a/").unwrap()),
            Ok(Transport::Http2)
        ));
        assert!(matches!(
            transport_for(&Url::parse("https+h3://a/").unwrap()),
            Ok(Transport::Http3)
        ));
        assert!(matches!(
            transport_for(&Url::parse("http://a/").unwrap()),
            Err(RequestError::InvalidScheme(_))
        ));
    }
}
