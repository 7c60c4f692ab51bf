use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Key used when no usable forwarded address is present.
pub(crate) const UNKNOWN_CLIENT: &str = "unknown";

/// Caller key for rate limiting: the first address of `x-forwarded-for`.
///
/// Missing, non-UTF-8, empty or unparseable values all collapse to
/// [`UNKNOWN_CLIENT`], so those requests are still gated together.
pub(crate) fn client_key_from_headers(headers: &HeaderMap) -> String {
    first_forwarded_ip(headers).unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn first_forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = raw.split(',').next()?.trim();
    parse_client_addr(first).map(|ip| ip.to_canonical().to_string())
}

/// Bare address, `addr:port`, `[v6]:port` or `[v6]`.
fn parse_client_addr(value: &str) -> Option<IpAddr> {
    if value.is_empty() {
        return None;
    }
    value
        .parse::<IpAddr>()
        .or_else(|_| value.parse::<SocketAddr>().map(|addr| addr.ip()))
        .ok()
        .or_else(|| {
            let inner = value.strip_prefix('[')?.strip_suffix(']')?;
            inner.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
        })
}
