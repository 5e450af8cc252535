//! The per-connection exchange pipeline.
//!
//! Each accepted connection serves exactly one HTTP exchange: read the
//! request, fold the pre-hook chain, forward to the upstream, classify
//! the response, and complete it as a raw bridge, a chunked relay, or a
//! buffered body run through the post-hook chain.

use crate::http1::{
    ChunkScanner, RequestHead, ResponseHead, build_reframed_response, build_request,
    read_exact_into, read_request, read_response_head, read_to_eof,
};
use crate::splice::splice;
use crate::upstream::{self, UpstreamAddr, UpstreamStream};
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use plugboard_core::{ProxyError, RouteTable};
use plugboard_hooks::protocol::{ClientRequest, ServerResponse};
use plugboard_hooks::{HookClient, apply_post_hooks, apply_pre_hooks};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Pre-built static error responses ──────────────────────────────────

pub const RESP_400: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

pub const RESP_502: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\ncontent-type: application/json\r\ncontent-length: 39\r\nconnection: close\r\n\r\n{\"error\":\"upstream error\",\"status\":502}";

pub const RESP_503: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\ncontent-type: application/json\r\ncontent-length: 39\r\nconnection: close\r\n\r\n{\"error\":\"server is busy\",\"status\":503}";

/// Responses with this content type become a full-duplex byte tunnel.
pub const RAW_STREAM_CONTENT_TYPE: &str = "application/vnd.docker.raw-stream";

/// Immutable per-worker state shared by every connection on a thread.
pub struct ProxyShared {
    pub routes: Arc<RouteTable>,
    pub upstream: UpstreamAddr,
    pub hook_client: HookClient,
}

/// How an upstream response is completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Hijacked byte tunnel; headers verbatim, then bridge both ways.
    Raw,
    /// Streamed through with chunked framing preserved; no post-hooks.
    Chunked,
    /// Fully buffered; post-hooks run, then a re-framed response.
    Buffered,
}

/// Classify a response head. Raw takes precedence over Chunked.
pub fn classify(response: &ResponseHead) -> Disposition {
    if response.header("content-type") == Some(RAW_STREAM_CONTENT_TYPE) {
        Disposition::Raw
    } else if response.is_chunked() {
        Disposition::Chunked
    } else {
        Disposition::Buffered
    }
}

/// Short opaque id tying one exchange's log lines together.
fn exchange_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Serve one exchange on an accepted client connection, then close.
pub async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    shared: Rc<ProxyShared>,
) -> anyhow::Result<()> {
    let id = exchange_id();

    // ── Read request ──
    let mut request = match read_request(&mut client).await {
        Ok(request) => request,
        Err(e) => {
            debug!(id = %id, client = %peer, error = %e, "client framing error");
            let (res, _) = client.write_all(RESP_400.to_vec()).await;
            let _ = res;
            return Ok(());
        }
    };
    let method = request.method.clone();
    let original_target = request.target.clone();
    debug!(id = %id, client = %peer, method = %method, target = %original_target, "request read");

    // ── Route match ──
    let hooks = shared.routes.matches(&request.method, request.path());

    // Hook bodies travel as JSON strings; a body that is not valid UTF-8
    // cannot be represented in an envelope, so hooks are disabled for
    // the exchange and it proxies straight through.
    let mut hook_request: Option<ClientRequest> = if hooks.is_empty() {
        None
    } else {
        match String::from_utf8(request.body.clone()) {
            Ok(text) => Some(ClientRequest {
                method: request.method.clone(),
                request: original_target.clone(),
                body: Some(text),
            }),
            Err(_) => {
                warn!(id = %id, "request body is not valid UTF-8; hooks disabled for this exchange");
                None
            }
        }
    };

    // ── Pre-hook fold ──
    if !hooks.pre.is_empty()
        && let Some(state) = hook_request.take()
    {
        let folded =
            apply_pre_hooks(&shared.hook_client, &hooks.pre, state, &original_target).await;
        let final_body = folded.body.unwrap_or_default();
        apply_body_rewrite(&mut request, final_body.as_bytes());
        // Post-hooks must see the body the upstream saw.
        hook_request = Some(ClientRequest {
            method: request.method.clone(),
            request: original_target.clone(),
            body: Some(final_body),
        });
    }

    // ── Forward to upstream ──
    let mut upstream = match upstream::dial(&shared.upstream).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(id = %id, upstream = %shared.upstream, error = %e, "upstream dial failed");
            let (res, _) = client.write_all(RESP_502.to_vec()).await;
            let _ = res;
            return Ok(());
        }
    };
    let (res, _) = upstream.write_all(build_request(&request)).await;
    res?;

    // ── Read response head (tee captures the exact wire bytes) ──
    let response = match read_response_head(&mut upstream).await {
        Ok(response) => response,
        Err(e) => {
            warn!(id = %id, error = %e, "upstream framing error");
            return Ok(());
        }
    };

    let disposition = classify(&response);
    debug!(id = %id, code = response.code, disposition = ?disposition, "response classified");

    match disposition {
        Disposition::Raw => {
            // Headers must reach the client before any payload bytes.
            let (res, _) = client.write_all(response.head_bytes.clone()).await;
            res?;
            if !response.leftover.is_empty() {
                let (res, _) = client.write_all(response.leftover.clone()).await;
                res?;
            }
            match upstream {
                UpstreamStream::Tcp(stream) => {
                    let (up_read, up_write) = monoio::io::Splitable::into_split(stream);
                    splice(client, up_read, up_write).await?;
                }
                UpstreamStream::Unix(stream) => {
                    let (up_read, up_write) = monoio::io::Splitable::into_split(stream);
                    splice(client, up_read, up_write).await?;
                }
            }
            info!(id = %id, method = %method, target = %original_target, code = response.code, "raw stream closed");
        }

        Disposition::Chunked => {
            let (res, _) = client.write_all(response.head_bytes.clone()).await;
            res?;
            relay_chunked(&mut upstream, &mut client, &response.leftover).await?;
            // Final chunk delivered: half-close our write side.
            client.shutdown().await?;
            info!(id = %id, method = %method, target = %original_target, code = response.code, "chunked stream forwarded");
        }

        Disposition::Buffered => {
            let mut body = response.leftover.clone();
            match response.content_length() {
                Some(len) => {
                    body.truncate(len.min(body.len()));
                    read_exact_into(&mut upstream, &mut body, len)
                        .await
                        .map_err(|e| ProxyError::UpstreamFraming(e.to_string()))?;
                    body.truncate(len);
                }
                None => read_to_eof(&mut upstream, &mut body).await?,
            }

            let response_text = String::from_utf8(body.clone()).ok();
            let code = match (&hook_request, response_text) {
                (Some(view), Some(text)) if !hooks.post.is_empty() => {
                    let initial = ServerResponse {
                        content_type: response.header("content-type").unwrap_or("").to_string(),
                        body: Some(text),
                        code: response.code,
                    };
                    let folded = apply_post_hooks(
                        &shared.hook_client,
                        &hooks.post,
                        view,
                        initial,
                        &original_target,
                    )
                    .await;
                    let body_out = folded.body.unwrap_or_default().into_bytes();
                    let wire = build_reframed_response(
                        folded.code,
                        &folded.content_type,
                        &response.headers,
                        &body_out,
                    );
                    let (res, _) = client.write_all(wire).await;
                    res?;
                    folded.code
                }
                _ => {
                    if !hooks.post.is_empty() {
                        warn!(id = %id, "post-hooks configured but exchange is not hookable; passing through");
                    }
                    // Byte-identical passthrough: captured head, then body.
                    let (res, _) = client.write_all(response.head_bytes.clone()).await;
                    res?;
                    if !body.is_empty() {
                        let (res, _) = client.write_all(body).await;
                        res?;
                    }
                    response.code
                }
            };
            info!(id = %id, method = %method, target = %original_target, code = code, "exchange complete");
        }
    }

    Ok(())
}

/// Replace the request body after the pre-hook fold: content-length is
/// reconciled to the new body and any chunked framing header cleared.
fn apply_body_rewrite(request: &mut RequestHead, body: &[u8]) {
    request.body = body.to_vec();
    request.remove_header("transfer-encoding");
    request.set_header("content-length", request.body.len().to_string());
}

/// Forward a chunked response body verbatim, scanning the framing to
/// stop at the terminal zero-length chunk.
async fn relay_chunked(
    upstream: &mut UpstreamStream,
    client: &mut TcpStream,
    leftover: &[u8],
) -> Result<(), ProxyError> {
    let mut scanner = ChunkScanner::new();

    if !leftover.is_empty() {
        let used = scanner.feed(leftover)?;
        let (res, _) = client.write_all(leftover[..used].to_vec()).await;
        res?;
    }

    let mut buf = vec![0u8; 16 * 1024];
    while !scanner.is_done() {
        let (res, returned) = upstream.read(buf).await;
        buf = returned;
        match res {
            Ok(0) => {
                return Err(ProxyError::UpstreamFraming(
                    "EOF inside chunked response".into(),
                ));
            }
            Ok(n) => {
                let used = scanner.feed(&buf[..n])?;
                let (res, _) = client.write_all(buf[..used].to_vec()).await;
                res?;
            }
            Err(e) => return Err(ProxyError::Io(e)),
        }
    }
    Ok(())
}
