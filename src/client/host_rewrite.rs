//! Rewrites the `Host` header of the first request on a link.

use bytes::{Bytes, BytesMut};

use crate::common::http_conn::MAX_HEAD_SIZE;

const HOST_MARKERS: [&[u8]; 2] = [b"\r\nHost: ", b"\r\nhost: "];
const END_OF_HEAD: &[u8] = b"\r\n\r\n";
const MAX_METHOD_LEN: usize = 16;

/// Replaces the value of the first `Host:` header line in a byte stream and
/// then passes everything through untouched.
///
/// Bytes are held back only while the head of the first request is still
/// arriving, so a header split across reads is rewritten all the same. A
/// stream that does not start like an HTTP request, a head that ends
/// without a `Host` line, or a head larger than [`MAX_HEAD_SIZE`] switches
/// straight to passthrough.
#[derive(Debug)]
pub struct HostRewriter {
    host: Bytes,
    pending: BytesMut,
    replaced: bool,
    passthrough: bool,
}

enum Scan {
    Replace { start: usize, end: usize },
    NeedMore,
    GiveUp,
}

impl HostRewriter {
    pub fn new(host: &str) -> Self {
        Self {
            host: Bytes::copy_from_slice(host.as_bytes()),
            pending: BytesMut::new(),
            replaced: false,
            passthrough: false,
        }
    }

    /// Whether the `Host` value has been rewritten on this stream.
    pub fn replaced(&self) -> bool {
        self.replaced
    }

    /// Feeds one chunk read from the link and returns the bytes that can be
    /// written to the local side now. May be empty while a head is buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        if self.passthrough {
            return Bytes::copy_from_slice(chunk);
        }
        self.pending.extend_from_slice(chunk);

        match self.scan() {
            Scan::Replace { start, end } => {
                let mut out = BytesMut::with_capacity(self.pending.len() + self.host.len());
                out.extend_from_slice(&self.pending[..start]);
                out.extend_from_slice(&self.host);
                out.extend_from_slice(&self.pending[end..]);
                self.pending.clear();
                self.replaced = true;
                self.passthrough = true;
                out.freeze()
            }
            Scan::NeedMore => Bytes::new(),
            Scan::GiveUp => self.finish(),
        }
    }

    /// Releases anything still held back, e.g. when the link hits EOF.
    pub fn finish(&mut self) -> Bytes {
        self.passthrough = true;
        self.pending.split().freeze()
    }

    fn scan(&self) -> Scan {
        let buf = &self.pending[..];
        if !starts_like_request(buf) {
            return Scan::GiveUp;
        }

        let marker = HOST_MARKERS
            .iter()
            .filter_map(|m| find(buf, m).map(|at| (at, m.len())))
            .min_by_key(|(at, _)| *at);
        let head_end = find(buf, END_OF_HEAD);

        match (marker, head_end) {
            // The first `Host: ` seen sits in a body, not in the head.
            (Some((at, _)), Some(end)) if at > end => Scan::GiveUp,
            (Some((at, len)), _) => {
                let start = at + len;
                match buf[start..].iter().position(|b| b.is_ascii_whitespace()) {
                    Some(value_len) => Scan::Replace {
                        start,
                        end: start + value_len,
                    },
                    None if buf.len() >= MAX_HEAD_SIZE => Scan::GiveUp,
                    None => Scan::NeedMore,
                }
            }
            (None, Some(_)) => Scan::GiveUp,
            (None, None) if buf.len() >= MAX_HEAD_SIZE => Scan::GiveUp,
            (None, None) => Scan::NeedMore,
        }
    }
}

/// A request line starts with an upper-case method token and a space.
fn starts_like_request(buf: &[u8]) -> bool {
    for (i, b) in buf.iter().enumerate() {
        if *b == b' ' {
            return i > 0;
        }
        if !b.is_ascii_uppercase() || i >= MAX_METHOD_LEN {
            return false;
        }
    }
    true
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(rewriter: &mut HostRewriter, chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&rewriter.push(chunk));
        }
        out.extend_from_slice(&rewriter.finish());
        out
    }

    const REQUEST: &[u8] =
        b"POST /submit HTTP/1.1\r\nHost: abc123.example.com\r\nContent-Length: 29\r\n\r\nHost: should-stay.example.com";

    const EXPECTED: &[u8] =
        b"POST /submit HTTP/1.1\r\nHost: localhost:3000\r\nContent-Length: 29\r\n\r\nHost: should-stay.example.com";

    #[test]
    fn rewrites_only_the_header_line() {
        let mut rewriter = HostRewriter::new("localhost:3000");
        assert_eq!(String::from_utf8_lossy(&run(&mut rewriter, &[REQUEST])), String::from_utf8_lossy(EXPECTED));
        assert!(rewriter.replaced());
    }

    #[test]
    fn rewrites_regardless_of_chunk_boundaries() {
        for split in 1..REQUEST.len() {
            let mut rewriter = HostRewriter::new("localhost:3000");
            let out = run(&mut rewriter, &[&REQUEST[..split], &REQUEST[split..]]);
            assert_eq!(out, EXPECTED, "split at {}", split);
        }

        let mut rewriter = HostRewriter::new("localhost:3000");
        let bytewise: Vec<&[u8]> = REQUEST.chunks(1).collect();
        assert_eq!(run(&mut rewriter, &bytewise), EXPECTED);
    }

    #[test]
    fn later_requests_pass_through() {
        let mut rewriter = HostRewriter::new("local");
        let first = rewriter.push(b"GET / HTTP/1.1\r\nhost: a.example.com\r\n\r\n");
        assert_eq!(&first[..], b"GET / HTTP/1.1\r\nhost: local\r\n\r\n");

        let second = rewriter.push(b"GET /next HTTP/1.1\r\nHost: a.example.com\r\n\r\n");
        assert_eq!(&second[..], b"GET /next HTTP/1.1\r\nHost: a.example.com\r\n\r\n");
    }

    #[test]
    fn head_without_host_is_left_alone() {
        let mut rewriter = HostRewriter::new("local");
        let out = run(&mut rewriter, &[b"GET / HTTP/1.0\r\n\r\nHost: x\r\n"]);
        assert_eq!(out, b"GET / HTTP/1.0\r\n\r\nHost: x\r\n");
        assert!(!rewriter.replaced());
    }

    #[test]
    fn non_http_streams_are_not_buffered() {
        let mut rewriter = HostRewriter::new("local");
        assert_eq!(&rewriter.push(b"\x16\x03\x01")[..], b"\x16\x03\x01");
        assert_eq!(&rewriter.push(b"Host: x")[..], b"Host: x");
    }

    #[test]
    fn holds_back_partial_head() {
        let mut rewriter = HostRewriter::new("local");
        assert!(rewriter.push(b"GET / HTTP/1.1\r\nHo").is_empty());
        assert!(rewriter.push(b"st: exam").is_empty());
        assert_eq!(&rewriter.push(b"ple.com\r\n\r\n")[..], b"GET / HTTP/1.1\r\nHost: local\r\n\r\n");
    }
}
