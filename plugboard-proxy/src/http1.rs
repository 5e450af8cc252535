//! HTTP/1.x framing off raw byte streams.
//!
//! The pipeline never hands framing to an HTTP server library: requests
//! and responses are parsed with `httparse` directly off the socket so
//! the exact wire bytes of a response head can be captured for verbatim
//! re-emission (raw and chunked dispositions) and so chunk framing can
//! be tracked without re-encoding.

use monoio::io::AsyncReadRent;
use plugboard_core::ProxyError;

/// Upper bound on a request or response head.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

// ── request parsing ───────────────────────────────────────────────────

/// A parsed client request with its body fully buffered.
///
/// A chunked request body is decoded at read time and the head
/// normalized to a content-length framing, so everything downstream
/// deals in plain buffered bodies.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target: path plus optional query, as sent.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RequestHead {
    /// Path component of the target, query stripped.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    /// First value of a header, name compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Replace the first occurrence of a header, or append it.
    pub fn set_header(&mut self, name: &str, value: String) {
        for (n, v) in self.headers.iter_mut() {
            if n.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.headers.push((name.to_string(), value));
    }
}

/// Read and parse one request off the client socket.
pub async fn read_request<S: AsyncReadRent>(io: &mut S) -> Result<RequestHead, ProxyError> {
    let mut acc: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&acc) {
            Ok(httparse::Status::Complete(head_len)) => {
                let method = req
                    .method
                    .ok_or_else(|| ProxyError::ClientFraming("missing method".into()))?
                    .to_string();
                let target = req
                    .path
                    .ok_or_else(|| ProxyError::ClientFraming("missing request target".into()))?
                    .to_string();

                let mut parsed: Vec<(String, String)> = Vec::with_capacity(req.headers.len());
                let mut content_length: Option<usize> = None;
                let mut chunked = false;
                for h in req.headers.iter() {
                    if h.name.is_empty() {
                        break;
                    }
                    let value = std::str::from_utf8(h.value)
                        .map_err(|_| {
                            ProxyError::ClientFraming(format!("non-UTF-8 header: {}", h.name))
                        })?
                        .to_string();
                    if h.name.eq_ignore_ascii_case("content-length") {
                        content_length = Some(value.trim().parse().map_err(|_| {
                            ProxyError::ClientFraming(format!("bad content-length: {value}"))
                        })?);
                    } else if h.name.eq_ignore_ascii_case("transfer-encoding")
                        && transfer_encoding_has_chunked(&value)
                    {
                        chunked = true;
                    }
                    parsed.push((h.name.to_string(), value));
                }

                let leftover = acc[head_len..].to_vec();
                let mut head = RequestHead {
                    method,
                    target,
                    headers: parsed,
                    body: Vec::new(),
                };

                if chunked {
                    head.body = read_chunked_body(io, leftover)
                        .await
                        .map_err(|e| ProxyError::ClientFraming(e.to_string()))?;
                    head.remove_header("transfer-encoding");
                    head.set_header("content-length", head.body.len().to_string());
                } else if let Some(len) = content_length {
                    head.body = leftover;
                    read_exact_into(io, &mut head.body, len)
                        .await
                        .map_err(|e| ProxyError::ClientFraming(e.to_string()))?;
                    head.body.truncate(len);
                }

                return Ok(head);
            }
            Ok(httparse::Status::Partial) => {
                if acc.len() > MAX_HEAD_BYTES {
                    return Err(ProxyError::ClientFraming("request head too large".into()));
                }
            }
            Err(e) => return Err(ProxyError::ClientFraming(e.to_string())),
        }

        let (res, returned) = io.read(chunk).await;
        chunk = returned;
        match res {
            Ok(0) => {
                return Err(ProxyError::ClientFraming(
                    "EOF before complete request head".into(),
                ));
            }
            Ok(n) => acc.extend_from_slice(&chunk[..n]),
            Err(e) => return Err(ProxyError::Io(e)),
        }
    }
}

// ── response parsing ──────────────────────────────────────────────────

/// A parsed response head plus the exact wire bytes it arrived as.
///
/// `head_bytes` is the tee capture: status line, headers, and the blank
/// line, byte-for-byte as received. `leftover` is whatever payload was
/// over-read while the head was being parsed.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub code: u16,
    pub headers: Vec<(String, String)>,
    pub head_bytes: Vec<u8>,
    pub leftover: Vec<u8>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// True when the transfer-encoding list contains the token `chunked`.
    /// Token comparison is case-sensitive, per the adapter protocol's
    /// historical behavior.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
            .any(|(_, v)| transfer_encoding_has_chunked(v))
    }
}

fn transfer_encoding_has_chunked(value: &str) -> bool {
    value.split(',').any(|token| token.trim() == "chunked")
}

/// Read and parse a response head off the upstream socket, capturing its
/// exact wire bytes.
pub async fn read_response_head<S: AsyncReadRent>(io: &mut S) -> Result<ResponseHead, ProxyError> {
    let mut acc: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(&acc) {
            Ok(httparse::Status::Complete(head_len)) => {
                let code = resp
                    .code
                    .ok_or_else(|| ProxyError::UpstreamFraming("missing status code".into()))?;
                let mut parsed: Vec<(String, String)> = Vec::with_capacity(resp.headers.len());
                for h in resp.headers.iter() {
                    if h.name.is_empty() {
                        break;
                    }
                    let value = std::str::from_utf8(h.value)
                        .map_err(|_| {
                            ProxyError::UpstreamFraming(format!("non-UTF-8 header: {}", h.name))
                        })?
                        .to_string();
                    parsed.push((h.name.to_string(), value));
                }
                return Ok(ResponseHead {
                    code,
                    headers: parsed,
                    head_bytes: acc[..head_len].to_vec(),
                    leftover: acc[head_len..].to_vec(),
                });
            }
            Ok(httparse::Status::Partial) => {
                if acc.len() > MAX_HEAD_BYTES {
                    return Err(ProxyError::UpstreamFraming("response head too large".into()));
                }
            }
            Err(e) => return Err(ProxyError::UpstreamFraming(e.to_string())),
        }

        let (res, returned) = io.read(chunk).await;
        chunk = returned;
        match res {
            Ok(0) => {
                return Err(ProxyError::UpstreamFraming(
                    "EOF before complete response head".into(),
                ));
            }
            Ok(n) => acc.extend_from_slice(&chunk[..n]),
            Err(e) => return Err(ProxyError::Io(e)),
        }
    }
}

// ── body reading ──────────────────────────────────────────────────────

/// Extend `body` from the stream until it holds `len` bytes.
pub async fn read_exact_into<S: AsyncReadRent>(
    io: &mut S,
    body: &mut Vec<u8>,
    len: usize,
) -> std::io::Result<()> {
    while body.len() < len {
        let chunk = vec![0u8; (len - body.len()).min(64 * 1024)];
        let (res, chunk) = io.read(chunk).await;
        match res {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF before full body",
                ));
            }
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Extend `body` from the stream until EOF.
pub async fn read_to_eof<S: AsyncReadRent>(
    io: &mut S,
    body: &mut Vec<u8>,
) -> std::io::Result<()> {
    loop {
        let chunk = vec![0u8; 16 * 1024];
        let (res, chunk) = io.read(chunk).await;
        match res {
            Ok(0) => return Ok(()),
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(e) => return Err(e),
        }
    }
}

/// Decode a chunked request body, starting from bytes already over-read.
async fn read_chunked_body<S: AsyncReadRent>(
    io: &mut S,
    leftover: Vec<u8>,
) -> std::io::Result<Vec<u8>> {
    let mut scanner = ChunkScanner::new();
    let mut decoded = Vec::new();

    let used = scanner
        .feed_decoding(&leftover, &mut decoded)
        .map_err(bad_chunk)?;
    debug_assert!(used <= leftover.len());
    let mut chunk = vec![0u8; READ_CHUNK];
    while !scanner.is_done() {
        let (res, returned) = io.read(chunk).await;
        chunk = returned;
        match res {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF inside chunked body",
                ));
            }
            Ok(n) => {
                scanner
                    .feed_decoding(&chunk[..n], &mut decoded)
                    .map_err(bad_chunk)?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(decoded)
}

fn bad_chunk(e: ProxyError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
}

// ── chunk framing scanner ─────────────────────────────────────────────

/// Incremental scanner over HTTP/1.1 chunked framing.
///
/// Fed arbitrary byte fragments, it tracks where the message ends — the
/// terminal zero-length chunk plus trailer section — without copying or
/// re-encoding the stream. Chunk-size lines are parsed with
/// `httparse::parse_chunk_size` once a full line is buffered.
#[derive(Debug)]
pub struct ChunkScanner {
    state: ScanState,
    /// Partial size line or trailer bytes carried between feeds.
    pending: Vec<u8>,
}

#[derive(Debug, PartialEq)]
enum ScanState {
    SizeLine,
    Data { remaining: u64 },
    DataEnd { need: usize },
    Trailer,
    Done,
}

impl ChunkScanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::SizeLine,
            pending: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ScanState::Done
    }

    /// Consume `data`, returning how many of its bytes belong to the
    /// chunked message. Anything past the returned count arrived after
    /// the terminal chunk.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, ProxyError> {
        self.advance(data, None)
    }

    /// Like [`feed`](Self::feed), additionally appending the decoded
    /// chunk payload to `out`.
    pub fn feed_decoding(
        &mut self,
        data: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<usize, ProxyError> {
        self.advance(data, Some(out))
    }

    fn advance(
        &mut self,
        data: &[u8],
        mut out: Option<&mut Vec<u8>>,
    ) -> Result<usize, ProxyError> {
        let mut pos = 0usize;
        while pos < data.len() {
            match self.state {
                ScanState::SizeLine => {
                    // Buffer until the size line has its CRLF.
                    self.pending.push(data[pos]);
                    pos += 1;
                    if self.pending.ends_with(b"\r\n") {
                        match httparse::parse_chunk_size(&self.pending) {
                            Ok(httparse::Status::Complete((_, size))) => {
                                self.pending.clear();
                                self.state = if size == 0 {
                                    ScanState::Trailer
                                } else {
                                    ScanState::Data { remaining: size }
                                };
                            }
                            Ok(httparse::Status::Partial) => {}
                            Err(_) => {
                                return Err(ProxyError::UpstreamFraming(
                                    "invalid chunk size line".into(),
                                ));
                            }
                        }
                    } else if self.pending.len() > 1024 {
                        return Err(ProxyError::UpstreamFraming("chunk size line too long".into()));
                    }
                }
                ScanState::Data { remaining } => {
                    let take = (data.len() - pos).min(remaining as usize);
                    if let Some(ref mut sink) = out {
                        sink.extend_from_slice(&data[pos..pos + take]);
                    }
                    pos += take;
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ScanState::DataEnd { need: 2 }
                    } else {
                        ScanState::Data { remaining: left }
                    };
                }
                ScanState::DataEnd { need } => {
                    // The CRLF that terminates chunk data.
                    let take = (data.len() - pos).min(need);
                    pos += take;
                    let left = need - take;
                    self.state = if left == 0 {
                        ScanState::SizeLine
                    } else {
                        ScanState::DataEnd { need: left }
                    };
                }
                ScanState::Trailer => {
                    self.pending.push(data[pos]);
                    pos += 1;
                    if self.pending.ends_with(b"\r\n") {
                        if self.pending == b"\r\n" {
                            // Blank line: end of trailers, end of message.
                            self.pending.clear();
                            self.state = ScanState::Done;
                        } else {
                            // One trailer line consumed; keep going.
                            self.pending.clear();
                        }
                    } else if self.pending.len() > MAX_HEAD_BYTES {
                        return Err(ProxyError::UpstreamFraming("trailer section too large".into()));
                    }
                }
                ScanState::Done => break,
            }
        }
        Ok(pos)
    }
}

impl Default for ChunkScanner {
    fn default() -> Self {
        Self::new()
    }
}

// ── wire serialization ────────────────────────────────────────────────

/// Serialize a request (head + body) into a wire buffer.
pub fn build_request(head: &RequestHead) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + head.body.len());
    buf.extend_from_slice(head.method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(head.target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in &head.headers {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&head.body);
    buf
}

/// Standard reason phrase for a status code.
pub fn reason_phrase(code: u16) -> &'static str {
    http::StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

/// Serialize a re-framed buffered response: original headers with
/// content-type, content-length, and connection rewritten, framing
/// headers dropped, and the status line rebuilt from `code`.
pub fn build_reframed_response(
    code: u16,
    content_type: &str,
    original_headers: &[(String, String)],
    body: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + body.len());
    let mut itoa_buf = itoa::Buffer::new();

    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(itoa_buf.format(code).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(reason_phrase(code).as_bytes());
    buf.extend_from_slice(b"\r\n");

    for (name, value) in original_headers {
        if name.eq_ignore_ascii_case("content-type")
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if !content_type.is_empty() {
        buf.extend_from_slice(b"content-type: ");
        buf.extend_from_slice(content_type.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"content-length: ");
    buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
    buf.extend_from_slice(b"\r\nconnection: close\r\n\r\n");
    buf.extend_from_slice(body);
    buf
}
