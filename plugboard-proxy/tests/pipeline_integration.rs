//! End-to-end pipeline tests using a real monoio runtime and real
//! sockets — live fake upstreams and fake adapters, no network mocking.
//!
//! These cover the exchange scenarios that unit tests cannot: hook
//! rewrites flowing through to the upstream, verbatim passthrough,
//! chunked relaying, and full-duplex raw bridging.

use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};
use monoio::net::{TcpListener, TcpStream};
use plugboard_core::{HookConfig, RouteTable};
use plugboard_hooks::HookClient;
use plugboard_proxy::connection::{ProxyShared, handle_connection};
use plugboard_proxy::upstream::UpstreamAddr;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
        .enable_timer()
        .build()
        .expect("monoio runtime build failed")
        .block_on(fut)
}

// ── fixtures ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl CapturedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read one full HTTP request (head + content-length body) off a stream.
async fn read_full_request<S: AsyncReadRent>(stream: &mut S) -> CapturedRequest {
    let mut acc: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        if let Ok(httparse::Status::Complete(head_len)) = req.parse(&acc) {
            let method = req.method.unwrap().to_string();
            let path = req.path.unwrap().to_string();
            let parsed: Vec<(String, String)> = req
                .headers
                .iter()
                .take_while(|h| !h.name.is_empty())
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).to_string(),
                    )
                })
                .collect();
            let content_length: usize = parsed
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse().ok())
                .unwrap_or(0);
            let mut body = acc[head_len..].to_vec();
            while body.len() < content_length {
                let buf = vec![0u8; content_length - body.len()];
                let (res, buf) = stream.read(buf).await;
                let n = res.unwrap();
                assert!(n > 0, "upstream request body truncated");
                body.extend_from_slice(&buf[..n]);
            }
            return CapturedRequest {
                method,
                path,
                headers: parsed,
                body,
            };
        }
        let (res, returned) = stream.read(chunk).await;
        chunk = returned;
        let n = res.unwrap();
        assert!(n > 0, "EOF before request head");
        acc.extend_from_slice(&chunk[..n]);
    }
}

/// Fake upstream serving one buffered exchange. Returns its port and a
/// slot holding the request it saw.
fn spawn_upstream<F>(respond: F) -> (u16, Rc<RefCell<Option<CapturedRequest>>>)
where
    F: FnOnce(&CapturedRequest) -> Vec<u8> + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let captured = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&captured);
    monoio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_full_request(&mut stream).await;
        let wire = respond(&request);
        *slot.borrow_mut() = Some(request);
        let (res, _) = stream.write_all(wire).await;
        res.unwrap();
        // Hold the socket open briefly so EOF never races the proxy's
        // content-length body read.
        monoio::time::sleep(Duration::from_millis(500)).await;
    });
    (port, captured)
}

/// Fake adapter: serves exchanges forever, counting them, replying with
/// `reply(envelope)`.
fn spawn_adapter<F>(reply: F) -> (u16, Rc<Cell<u32>>)
where
    F: Fn(serde_json::Value) -> String + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let count = Rc::new(Cell::new(0u32));
    let seen = Rc::clone(&count);
    monoio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            seen.set(seen.get() + 1);
            let request = read_full_request(&mut stream).await;
            let envelope: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            let body = reply(envelope);
            let wire = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
                body.len()
            );
            let (res, _) = stream.write_all(wire.into_bytes()).await;
            res.unwrap();
        }
    });
    (port, count)
}

/// An adapter that echoes whatever envelope state it is shown.
fn echo_pre_reply(envelope: serde_json::Value) -> String {
    serde_json::json!({"ModifiedClientRequest": envelope["ClientRequest"].clone()}).to_string()
}

fn shared_with(yaml: &str, upstream_port: u16) -> Rc<ProxyShared> {
    let config = HookConfig::from_yaml(yaml).unwrap();
    let routes = RouteTable::build(&config, false).unwrap();
    Rc::new(ProxyShared {
        routes: Arc::new(routes),
        upstream: UpstreamAddr::Tcp(format!("127.0.0.1:{upstream_port}")),
        hook_client: HookClient::new(Duration::from_millis(500), Duration::from_secs(2)),
    })
}

fn shared_no_hooks(upstream: UpstreamAddr) -> Rc<ProxyShared> {
    let config = HookConfig {
        version: 1,
        endpoints: Default::default(),
        adapters: Default::default(),
    };
    let routes = RouteTable::build(&config, false).unwrap();
    Rc::new(ProxyShared {
        routes: Arc::new(routes),
        upstream,
        hook_client: HookClient::new(Duration::from_millis(500), Duration::from_secs(2)),
    })
}

/// Serve exactly one proxied exchange.
fn spawn_proxy(shared: Rc<ProxyShared>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    monoio::spawn(async move {
        if let Ok((stream, peer)) = listener.accept().await {
            let _ = handle_connection(stream, peer, shared).await;
        }
    });
    addr
}

async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr.to_string().as_str()).await.unwrap()
}

async fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut acc = Vec::new();
    loop {
        let buf = vec![0u8; 8192];
        let (res, buf) = stream.read(buf).await;
        match res.unwrap() {
            0 => return acc,
            n => acc.extend_from_slice(&buf[..n]),
        }
    }
}

async fn read_at_least(stream: &mut TcpStream, acc: &mut Vec<u8>, len: usize) {
    while acc.len() < len {
        let buf = vec![0u8; 8192];
        let (res, buf) = stream.read(buf).await;
        let n = res.unwrap();
        assert!(n > 0, "EOF while expecting {len} bytes, have {}", acc.len());
        acc.extend_from_slice(&buf[..n]);
    }
}

// ── S1: no endpoint match → byte-identical passthrough ─────────────────

#[test]
fn unmatched_exchange_passes_through_verbatim() {
    block_on(async {
        let (adapter_port, adapter_calls) = spawn_adapter(echo_pre_reply);
        let upstream_wire =
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\nhi"
                .to_vec();
        let respond_with = upstream_wire.clone();
        let (upstream_port, captured) = spawn_upstream(move |_| respond_with);

        let shared = shared_with(
            &format!(
                r#"
endpoints:
  "POST /x/*":
    pre: [a]
adapters:
  a: http://127.0.0.1:{adapter_port}/adapter
"#
            ),
            upstream_port,
        );
        let proxy = spawn_proxy(shared);

        let mut client = connect(proxy).await;
        let (res, _) = client
            .write_all(b"GET /y/z HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello".to_vec())
            .await;
        res.unwrap();

        let response = read_to_eof(&mut client).await;
        assert_eq!(response, upstream_wire, "response must be byte-identical");

        let seen = captured.borrow_mut().take().unwrap();
        assert_eq!(seen.method, "GET");
        assert_eq!(seen.path, "/y/z");
        assert_eq!(seen.body, b"hello", "body must be byte-identical");
        assert_eq!(adapter_calls.get(), 0, "no adapter may be invoked");
    });
}

// ── S2: pre-hook body rewrite reconciles content-length ────────────────

#[test]
fn pre_hook_rewrite_reaches_upstream_with_reconciled_length() {
    block_on(async {
        let (adapter_port, adapter_calls) = spawn_adapter(|envelope| {
            let mut modified = envelope["ClientRequest"].clone();
            modified["Body"] = serde_json::json!("{\"n\":2}");
            serde_json::json!({"ModifiedClientRequest": modified}).to_string()
        });
        let (upstream_port, captured) = spawn_upstream(|_| {
            b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n".to_vec()
        });

        let shared = shared_with(
            &format!(
                r#"
endpoints:
  "POST /create":
    pre: [rewriter]
adapters:
  rewriter: http://127.0.0.1:{adapter_port}/adapter
"#
            ),
            upstream_port,
        );
        let proxy = spawn_proxy(shared);

        let mut client = connect(proxy).await;
        let (res, _) = client
            .write_all(
                b"POST /create HTTP/1.1\r\nHost: localhost\r\nContent-Length: 7\r\n\r\n{\"n\":1}"
                    .to_vec(),
            )
            .await;
        res.unwrap();

        let response = read_to_eof(&mut client).await;
        assert!(response.starts_with(b"HTTP/1.1 201"));

        let seen = captured.borrow_mut().take().unwrap();
        assert_eq!(seen.body, b"{\"n\":2}");
        assert_eq!(seen.header("content-length"), Some("7"));
        assert_eq!(adapter_calls.get(), 1);
    });
}

// ── S3: post-hook rewrites status, content-type, and body ──────────────

#[test]
fn post_hook_reframes_the_response() {
    block_on(async {
        let (adapter_port, _) = spawn_adapter(|_| {
            serde_json::json!({
                "ModifiedServerResponse": {
                    "ContentType": "text/plain",
                    "Body": "teapot",
                    "Code": 418,
                }
            })
            .to_string()
        });
        let (upstream_port, _) = spawn_upstream(|_| {
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok".to_vec()
        });

        let shared = shared_with(
            &format!(
                r#"
endpoints:
  "GET /q":
    post: [teapot]
adapters:
  teapot: http://127.0.0.1:{adapter_port}/adapter
"#
            ),
            upstream_port,
        );
        let proxy = spawn_proxy(shared);

        let mut client = connect(proxy).await;
        let (res, _) = client
            .write_all(b"GET /q HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec())
            .await;
        res.unwrap();

        let response = String::from_utf8(read_to_eof(&mut client).await).unwrap();
        assert!(
            response.starts_with("HTTP/1.1 418 I'm a teapot\r\n"),
            "got: {response}"
        );
        assert!(response.contains("content-length: 6\r\n"));
        assert!(response.contains("content-type: text/plain\r\n"));
        assert!(response.ends_with("teapot"));
    });
}

// ── S4: failing adapter is skipped, the rest of the chain applies ──────

#[test]
fn dead_adapter_is_skipped_mid_chain() {
    block_on(async {
        let (adapter_port, adapter_calls) = spawn_adapter(|envelope| {
            let mut modified = envelope["ClientRequest"].clone();
            let n: u64 = modified["Body"].as_str().unwrap().parse().unwrap();
            modified["Body"] = serde_json::json!((n + 1).to_string());
            serde_json::json!({"ModifiedClientRequest": modified}).to_string()
        });
        let dead = {
            let tmp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = tmp.local_addr().unwrap().port();
            drop(tmp);
            port
        };
        let (upstream_port, captured) =
            spawn_upstream(|_| b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec());

        let shared = shared_with(
            &format!(
                r#"
endpoints:
  "POST /c":
    pre: [incr, gone]
adapters:
  incr: http://127.0.0.1:{adapter_port}/adapter
  gone: http://127.0.0.1:{dead}/adapter
"#
            ),
            upstream_port,
        );
        let proxy = spawn_proxy(shared);

        let mut client = connect(proxy).await;
        let (res, _) = client
            .write_all(b"POST /c HTTP/1.1\r\nHost: localhost\r\nContent-Length: 1\r\n\r\n1".to_vec())
            .await;
        res.unwrap();

        let response = read_to_eof(&mut client).await;
        assert!(response.starts_with(b"HTTP/1.1 200"), "exchange must complete");

        let seen = captured.borrow_mut().take().unwrap();
        assert_eq!(seen.body, b"2", "live adapter's rewrite must survive");
        assert_eq!(adapter_calls.get(), 1);
    });
}

// ── S5: raw stream bridges both directions until EOF ───────────────────

#[test]
fn raw_stream_bridges_full_duplex() {
    block_on(async {
        // Post-hooks are configured for the path but must not run.
        let (adapter_port, adapter_calls) = spawn_adapter(echo_pre_reply);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_port = listener.local_addr().unwrap().port();
        monoio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _request = read_full_request(&mut stream).await;
            let head = b"HTTP/1.1 200 OK\r\nContent-Type: application/vnd.docker.raw-stream\r\n\r\nWELCOME";
            let (res, _) = stream.write_all(head.to_vec()).await;
            res.unwrap();

            // Echo one client payload.
            let buf = vec![0u8; 1024];
            let (res, buf) = stream.read(buf).await;
            let n = res.unwrap();
            assert_eq!(&buf[..n], b"ping");
            let (res, _) = stream.write_all(b"pong".to_vec()).await;
            res.unwrap();

            // Wait for the client's half-close, then say goodbye.
            let buf = vec![0u8; 1024];
            let (res, _) = stream.read(buf).await;
            assert_eq!(res.unwrap(), 0, "expected EOF after client half-close");
            let (res, _) = stream.write_all(b"done".to_vec()).await;
            res.unwrap();
        });

        let shared = shared_with(
            &format!(
                r#"
endpoints:
  "POST /attach":
    post: [watcher]
adapters:
  watcher: http://127.0.0.1:{adapter_port}/adapter
"#
            ),
            upstream_port,
        );
        let proxy = spawn_proxy(shared);

        let mut client = connect(proxy).await;
        let (res, _) = client
            .write_all(b"POST /attach HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec())
            .await;
        res.unwrap();

        // Head (with blank line) and initial payload arrive first.
        let expected_head =
            b"HTTP/1.1 200 OK\r\nContent-Type: application/vnd.docker.raw-stream\r\n\r\nWELCOME";
        let mut acc = Vec::new();
        read_at_least(&mut client, &mut acc, expected_head.len()).await;
        assert_eq!(&acc[..expected_head.len()], expected_head);
        acc.drain(..expected_head.len());

        // Client → upstream direction.
        let (res, _) = client.write_all(b"ping".to_vec()).await;
        res.unwrap();
        read_at_least(&mut client, &mut acc, 4).await;
        assert_eq!(&acc[..4], b"pong");
        acc.drain(..4);

        // Half-close our write side; the upstream's farewell must still
        // flow back before the bridge tears down.
        client.shutdown().await.unwrap();
        let rest = read_to_eof(&mut client).await;
        let mut tail = acc;
        tail.extend_from_slice(&rest);
        assert_eq!(tail, b"done");

        assert_eq!(adapter_calls.get(), 0, "post-hooks must not run on raw streams");
    });
}

// ── S6: chunked stream is relayed verbatim, no post-hooks ──────────────

#[test]
fn chunked_stream_forwards_framing_verbatim() {
    block_on(async {
        let (adapter_port, adapter_calls) = spawn_adapter(echo_pre_reply);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_port = listener.local_addr().unwrap().port();
        monoio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _request = read_full_request(&mut stream).await;
            let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
            let (res, _) = stream.write_all(head.to_vec()).await;
            res.unwrap();
            // Dribble the chunks out in fragments.
            for part in [&b"5\r\nhel"[..], &b"lo\r\n"[..], &b"6\r\n world\r\n"[..], &b"0\r\n\r\n"[..]] {
                let (res, _) = stream.write_all(part.to_vec()).await;
                res.unwrap();
                monoio::time::sleep(Duration::from_millis(10)).await;
            }
            // Keep the upstream socket open: the proxy must terminate on
            // the final chunk, not on upstream EOF.
            monoio::time::sleep(Duration::from_secs(5)).await;
        });

        let shared = shared_with(
            &format!(
                r#"
endpoints:
  "GET /events":
    post: [watcher]
adapters:
  watcher: http://127.0.0.1:{adapter_port}/adapter
"#
            ),
            upstream_port,
        );
        let proxy = spawn_proxy(shared);

        let mut client = connect(proxy).await;
        let (res, _) = client
            .write_all(b"GET /events HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec())
            .await;
        res.unwrap();

        let response = read_to_eof(&mut client).await;
        assert_eq!(
            response,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
                .to_vec()
        );
        assert_eq!(adapter_calls.get(), 0, "post-hooks must not run on chunked streams");
    });
}

// ── framing and dial failures ──────────────────────────────────────────

#[test]
fn malformed_client_request_gets_400() {
    block_on(async {
        let shared = shared_no_hooks(UpstreamAddr::Tcp("127.0.0.1:1".into()));
        let proxy = spawn_proxy(shared);

        let mut client = connect(proxy).await;
        let (res, _) = client.write_all(b"NOT HTTP AT ALL\r\n\r\n".to_vec()).await;
        res.unwrap();

        let response = String::from_utf8(read_to_eof(&mut client).await).unwrap();
        assert!(response.starts_with("HTTP/1.1 400"), "got: {response}");
    });
}

#[test]
fn unreachable_upstream_gets_502() {
    block_on(async {
        let dead = {
            let tmp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = tmp.local_addr().unwrap().port();
            drop(tmp);
            port
        };
        let shared = shared_no_hooks(UpstreamAddr::Tcp(format!("127.0.0.1:{dead}")));
        let proxy = spawn_proxy(shared);

        let mut client = connect(proxy).await;
        let (res, _) = client
            .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec())
            .await;
        res.unwrap();

        let response = String::from_utf8(read_to_eof(&mut client).await).unwrap();
        assert!(response.starts_with("HTTP/1.1 502"), "got: {response}");
    });
}

// ── chunked request bodies are normalized before forwarding ────────────

#[test]
fn chunked_request_body_is_decoded_for_hooks() {
    block_on(async {
        let (adapter_port, _) = spawn_adapter(echo_pre_reply);
        let (upstream_port, captured) =
            spawn_upstream(|_| b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec());

        let shared = shared_with(
            &format!(
                r#"
endpoints:
  "POST /create":
    pre: [echo]
adapters:
  echo: http://127.0.0.1:{adapter_port}/adapter
"#
            ),
            upstream_port,
        );
        let proxy = spawn_proxy(shared);

        let mut client = connect(proxy).await;
        let (res, _) = client
            .write_all(
                b"POST /create HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n7\r\n{\"n\":1}\r\n0\r\n\r\n"
                    .to_vec(),
            )
            .await;
        res.unwrap();

        let response = read_to_eof(&mut client).await;
        assert!(response.starts_with(b"HTTP/1.1 200"));

        let seen = captured.borrow_mut().take().unwrap();
        assert_eq!(seen.body, b"{\"n\":1}");
        assert_eq!(seen.header("content-length"), Some("7"));
        assert_eq!(seen.header("transfer-encoding"), None, "chunked framing must be cleared");
    });
}

// ── unix-domain upstream ───────────────────────────────────────────────

#[test]
fn proxies_over_a_unix_socket_upstream() {
    block_on(async {
        let sock_path = std::env::temp_dir().join(format!(
            "plugboard-test-{}-{}.sock",
            std::process::id(),
            line!()
        ));
        let _ = std::fs::remove_file(&sock_path);
        let listener = monoio::net::UnixListener::bind(&sock_path).unwrap();
        monoio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_full_request(&mut stream).await;
            assert_eq!(request.path, "/version");
            let wire = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 17\r\n\r\n{\"Version\":\"1.5\"}";
            let (res, _) = stream.write_all(wire.to_vec()).await;
            res.unwrap();
            monoio::time::sleep(Duration::from_millis(500)).await;
        });

        let shared = shared_no_hooks(UpstreamAddr::Unix(sock_path.clone()));
        let proxy = spawn_proxy(shared);

        let mut client = connect(proxy).await;
        let (res, _) = client
            .write_all(b"GET /version HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec())
            .await;
        res.unwrap();

        let response = String::from_utf8(read_to_eof(&mut client).await).unwrap();
        assert!(response.ends_with("{\"Version\":\"1.5\"}"), "got: {response}");

        let _ = std::fs::remove_file(&sock_path);
    });
}
