use bytes::BytesMut;
use httparse;
use std::io;

/// Upper bound on a request head we are willing to buffer.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;

/// One header line exactly as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeader {
    pub name: String,
    pub value: Vec<u8>,
}

/// A parsed HTTP/1.x request head that keeps the original header order,
/// casing and duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Minor version, `0` for HTTP/1.0 and `1` for HTTP/1.1.
    pub version: u8,
    pub headers: Vec<RawHeader>,
    /// Number of bytes the head occupied, including the blank line.
    pub len: usize,
}

impl RequestHead {
    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(&h.value).ok())
    }

    /// The host this request was addressed to. A fronting proxy's
    /// `X-Forwarded-Host` wins over `Host`.
    pub fn host(&self) -> Option<&str> {
        self.header("x-forwarded-host")
            .or_else(|| self.header("host"))
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }
}

/// HTTP 요청 헤드를 점진적으로 파싱하는 구조체
#[derive(Debug, Default)]
pub struct HttpRequestParser {
    buf: BytesMut,
}

impl HttpRequestParser {
    /// 새로운 HTTP 요청 파서를 생성
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
        }
    }

    /// 버퍼에 데이터 추가
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Parses the buffered bytes.
    ///
    /// Returns `Ok(None)` while the head is still incomplete, and an
    /// `InvalidData` error once the bytes can no longer be an HTTP request.
    pub fn parse(&self) -> Result<Option<RequestHead>, io::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(&self.buf) {
            Ok(httparse::Status::Complete(len)) => {
                let headers = req
                    .headers
                    .iter()
                    .map(|h| RawHeader {
                        name: h.name.to_string(),
                        value: h.value.to_vec(),
                    })
                    .collect();

                Ok(Some(RequestHead {
                    method: req.method.unwrap_or("GET").to_string(),
                    path: req.path.unwrap_or("/").to_string(),
                    version: req.version.unwrap_or(1),
                    headers,
                    len,
                }))
            }
            Ok(httparse::Status::Partial) if self.buf.len() >= MAX_HEAD_SIZE => Err(
                io::Error::new(io::ErrorKind::InvalidData, "request head too large"),
            ),
            Ok(httparse::Status::Partial) => Ok(None),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        }
    }

    pub fn get_buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_buffer(self) -> BytesMut {
        self.buf
    }
}

/// Method and path sniffed from the start of a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
}

/// Best-effort sniff of `<word> <non-space>` at the very start of `data`.
///
/// Only used for observability; the chunk does not have to be a complete or
/// even valid request.
pub fn sniff_request_line(data: &[u8]) -> Option<RequestLine> {
    let method_len = data
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .count();
    if method_len == 0 || data.get(method_len) != Some(&b' ') {
        return None;
    }

    let rest = &data[method_len + 1..];
    let path_len = rest
        .iter()
        .take_while(|b| !b.is_ascii_whitespace())
        .count();
    if path_len == 0 {
        return None;
    }

    Some(RequestLine {
        method: String::from_utf8_lossy(&data[..method_len]).into_owned(),
        path: String::from_utf8_lossy(&rest[..path_len]).into_owned(),
    })
}
