use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use plugboard_core::routes::Adapter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Why one adapter call failed. Every variant means the same thing to the
/// pipeline: the adapter is skipped for this exchange.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("encode: {0}")]
    Encode(serde_json::Error),

    #[error("no addresses for {0}")]
    Resolve(String),

    #[error("connect: {0}")]
    Connect(std::io::Error),

    #[error("deadline exceeded")]
    Timeout,

    #[error("transport: {0}")]
    Transport(std::io::Error),

    #[error("adapter returned status {0}")]
    Status(u16),

    #[error("malformed adapter response: {0}")]
    Malformed(String),

    #[error("decode: {0}")]
    Decode(serde_json::Error),
}

/// One-shot HTTP client for adapter calls.
///
/// Each call opens a fresh connection, POSTs a JSON envelope, reads the
/// entire reply, and decodes it. The whole call runs under a total
/// deadline, with a separate deadline on connect.
#[derive(Debug, Clone)]
pub struct HookClient {
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl HookClient {
    pub fn new(connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            call_timeout,
        }
    }

    pub fn from_settings(settings: &plugboard_core::Settings) -> Self {
        Self::new(settings.hook_connect_timeout(), settings.hook_timeout())
    }

    /// POST `envelope` to the adapter at the given request target and
    /// decode the JSON reply.
    pub async fn call<Req, Resp>(
        &self,
        adapter: &Adapter,
        request_target: &str,
        envelope: &Req,
    ) -> Result<Resp, HookError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(envelope).map_err(HookError::Encode)?;
        match monoio::time::timeout(
            self.call_timeout,
            self.call_inner(adapter, request_target, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HookError::Timeout),
        }
    }

    async fn call_inner<Resp: DeserializeOwned>(
        &self,
        adapter: &Adapter,
        request_target: &str,
        payload: Vec<u8>,
    ) -> Result<Resp, HookError> {
        let mut stream = self.connect(adapter).await?;

        let request = build_hook_request(adapter.authority(), request_target, &payload);
        let (res, _) = stream.write_all(request).await;
        res.map_err(HookError::Transport)?;

        let (code, body) = read_hook_response(&mut stream).await?;
        if !(200..300).contains(&code) {
            return Err(HookError::Status(code));
        }
        serde_json::from_slice(&body).map_err(HookError::Decode)
    }

    async fn connect(&self, adapter: &Adapter) -> Result<TcpStream, HookError> {
        let hostport = authority_hostport(adapter);
        let candidates = resolve_addrs(&hostport);
        if candidates.is_empty() {
            return Err(HookError::Resolve(hostport));
        }

        let mut last: Option<std::io::Error> = None;
        for sa in &candidates {
            match monoio::time::timeout(self.connect_timeout, TcpStream::connect(*sa)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    tracing::debug!(adapter = %adapter.name, resolved = %sa, error = %e, "adapter candidate failed, trying next");
                    last = Some(e);
                }
                Err(_) => return Err(HookError::Timeout),
            }
        }
        Err(HookError::Connect(last.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no candidate connected")
        })))
    }
}

/// host:port for dialing; port 80 when the adapter URL has none.
fn authority_hostport(adapter: &Adapter) -> String {
    match adapter.uri.port_u16() {
        Some(_) => adapter.authority().to_string(),
        None => format!("{}:80", adapter.authority()),
    }
}

/// Resolve an `addr` string (e.g. `"weave:80"`) to a list of
/// `SocketAddr`s, IPv4 candidates first.
///
/// Resolution goes through std's blocking `ToSocketAddrs`: adapter calls
/// are already synchronous within the pipeline and the lookup is cheap
/// against container DNS. IPv4-first because most adapters listen on
/// IPv4-only and `localhost` commonly resolves to `::1` first.
fn resolve_addrs(addr: &str) -> Vec<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return vec![sa];
    }
    use std::net::ToSocketAddrs;
    let all: Vec<SocketAddr> = match addr.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => return vec![],
    };
    let mut v4: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv4()).collect();
    let v6: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv6()).collect();
    v4.extend(v6);
    v4
}

/// Build the adapter POST into a wire buffer.
fn build_hook_request(authority: &str, request_target: &str, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + payload.len());
    buf.extend_from_slice(b"POST ");
    if !request_target.starts_with('/') {
        buf.push(b'/');
    }
    buf.extend_from_slice(request_target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\nhost: ");
    buf.extend_from_slice(authority.as_bytes());
    buf.extend_from_slice(b"\r\ncontent-type: application/json\r\ncontent-length: ");
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(itoa_buf.format(payload.len()).as_bytes());
    buf.extend_from_slice(b"\r\nconnection: close\r\n\r\n");
    buf.extend_from_slice(payload);
    buf
}

/// Read the adapter's reply: status code plus the full body
/// (content-length when present, otherwise to EOF).
async fn read_hook_response(stream: &mut TcpStream) -> Result<(u16, Vec<u8>), HookError> {
    const MAX_HEAD: usize = 64 * 1024;

    let mut acc: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = vec![0u8; 4096];

    loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(&acc) {
            Ok(httparse::Status::Complete(head_len)) => {
                let code = resp
                    .code
                    .ok_or_else(|| HookError::Malformed("missing status code".into()))?;
                let mut content_length: Option<usize> = None;
                for h in resp.headers.iter() {
                    if h.name.eq_ignore_ascii_case("content-length") {
                        content_length = std::str::from_utf8(h.value)
                            .ok()
                            .and_then(|s| s.trim().parse().ok());
                    }
                }
                let mut body = acc[head_len..].to_vec();
                read_body(stream, &mut body, content_length).await?;
                return Ok((code, body));
            }
            Ok(httparse::Status::Partial) => {
                if acc.len() > MAX_HEAD {
                    return Err(HookError::Malformed("response head too large".into()));
                }
            }
            Err(e) => return Err(HookError::Malformed(e.to_string())),
        }

        let (res, returned) = stream.read(chunk).await;
        chunk = returned;
        match res {
            Ok(0) => return Err(HookError::Malformed("EOF before response head".into())),
            Ok(n) => acc.extend_from_slice(&chunk[..n]),
            Err(e) => return Err(HookError::Transport(e)),
        }
    }
}

async fn read_body(
    stream: &mut TcpStream,
    body: &mut Vec<u8>,
    content_length: Option<usize>,
) -> Result<(), HookError> {
    match content_length {
        Some(len) => {
            body.truncate(body.len().min(len));
            while body.len() < len {
                let chunk = vec![0u8; (len - body.len()).min(64 * 1024)];
                let (res, chunk) = stream.read(chunk).await;
                match res {
                    Ok(0) => {
                        return Err(HookError::Malformed("EOF before full response body".into()));
                    }
                    Ok(n) => body.extend_from_slice(&chunk[..n]),
                    Err(e) => return Err(HookError::Transport(e)),
                }
            }
        }
        None => loop {
            let chunk = vec![0u8; 16 * 1024];
            let (res, chunk) = stream.read(chunk).await;
            match res {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(HookError::Transport(e)),
            }
        },
    }
    Ok(())
}
