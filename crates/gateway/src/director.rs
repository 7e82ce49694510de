//! The single request-rewriting function shared by every backend proxy.
//!
//! A stock reverse proxy preserves the inbound `Host` header; the backends
//! proxied here route on the rewritten host, so the director deliberately
//! overrides it. It also strips every header outside a fixed allow-list so
//! session cookies and anti-CSRF state never reach the backend.

use axum::http::{
    header::{HOST, USER_AGENT},
    HeaderMap, HeaderValue, Request, Uri,
};
use anyhow::Context;

/// Headers that survive the rewrite. Everything else is dropped.
pub const ALLOWED_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "cache-control",
    "content-length",
    "content-type",
    "private-token",
    "user-agent",
    "x-portaineragent-target",
    "x-portainer-volumename",
    "x-registry-auth",
];

/// Where a proxy forwards to: scheme, authority, and a base path/query that
/// the incoming request path is joined onto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: Option<String>,
}

impl ProxyTarget {
    pub fn parse(url: &str) -> anyhow::Result<Self> {
        let uri: Uri = url.parse().with_context(|| format!("invalid target URL: {url}"))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| anyhow::anyhow!("target URL missing scheme: {url}"))?
            .to_string();
        let host = uri
            .authority()
            .ok_or_else(|| anyhow::anyhow!("target URL missing host: {url}"))?
            .to_string();
        Ok(Self {
            scheme,
            host,
            path: uri.path().trim_end_matches('/').to_string(),
            query: uri.query().map(|q| q.to_string()),
        })
    }

    /// Marker target for Unix-socket/named-pipe backends: the HTTP stack
    /// routes on `http://unixsocket` while the transport dials the socket.
    pub fn local_socket() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "unixsocket".to_string(),
            path: String::new(),
            query: None,
        }
    }

    /// Plain-HTTP target for a resolved tunnel address.
    pub fn for_tunnel(address: &str) -> Self {
        Self {
            scheme: "http".to_string(),
            host: address.to_string(),
            path: String::new(),
            query: None,
        }
    }
}

/// Rewrite an outbound request in place: URL, Host header, User-Agent, and
/// the header allow-list.
pub fn rewrite<B>(target: &ProxyTarget, req: &mut Request<B>) -> anyhow::Result<()> {
    let path = single_joining_slash(&target.path, req.uri().path());
    let query = merge_query(target.query.as_deref(), req.uri().query());

    let path_and_query = match &query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let uri: Uri = format!("{}://{}{}", target.scheme, target.host, path_and_query)
        .parse()
        .context("rewritten URL is invalid")?;
    *req.uri_mut() = uri;

    filter_headers(req.headers_mut());

    req.headers_mut().insert(
        HOST,
        HeaderValue::from_str(&target.host).context("target host is not a valid header value")?,
    );

    // An absent User-Agent becomes explicitly empty so the default client UA
    // never leaks through to the backend.
    if !req.headers().contains_key(USER_AGENT) {
        req.headers_mut().insert(USER_AGENT, HeaderValue::from_static(""));
    }

    Ok(())
}

/// Join two path segments with exactly one slash between them.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Merge the target's configured query string with the request's; the target
/// query is the prefix.
pub fn merge_query(target: Option<&str>, request: Option<&str>) -> Option<String> {
    match (target, request) {
        (Some(t), Some(r)) if !t.is_empty() && !r.is_empty() => Some(format!("{t}&{r}")),
        (Some(t), _) if !t.is_empty() => Some(t.to_string()),
        (_, Some(r)) if !r.is_empty() => Some(r.to_string()),
        _ => None,
    }
}

/// Drop every header not on the allow-list. `HeaderMap` normalizes names to
/// lowercase on insert, so one lowercase comparison also covers headers that
/// arrived with non-canonical casing.
pub fn filter_headers(headers: &mut HeaderMap) {
    let dropped: Vec<_> = headers
        .keys()
        .filter(|name| !ALLOWED_HEADERS.contains(&name.as_str()))
        .cloned()
        .collect();
    for name in dropped {
        headers.remove(name);
    }
}
