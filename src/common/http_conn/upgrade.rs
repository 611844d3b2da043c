use super::parser::{RawHeader, RequestHead};
use http::HeaderMap;

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// `Connection: upgrade` plus an `Upgrade` header, the same test an HTTP/1.1
/// server uses to divert a request away from normal handling.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_upgrade = headers.contains_key(http::header::UPGRADE);

    let has_connection_upgrade = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| has_token(v, "upgrade"));

    has_upgrade && has_connection_upgrade
}

/// Same check as [`is_upgrade_request`], on a raw head.
pub fn is_upgrade_head(head: &RequestHead) -> bool {
    let has_upgrade = head
        .headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("upgrade"));

    let has_connection_upgrade = head
        .headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("connection"))
        .filter_map(|h| std::str::from_utf8(&h.value).ok())
        .any(|v| has_token(v, "upgrade"));

    has_upgrade && has_connection_upgrade
}

/// Rebuilds the request line and header block of an upgrade request.
///
/// Headers are emitted in arrival order with their original casing and
/// duplicates, joined by CRLF and terminated by a blank line, so the local
/// server sees exactly what the public client sent.
pub fn serialize_upgrade_head(head: &RequestHead) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.len.max(256));
    out.extend_from_slice(
        format!("{} {} HTTP/1.{}\r\n", head.method, head.path, head.version).as_bytes(),
    );
    for RawHeader { name, value } in &head.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}
