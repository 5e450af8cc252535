//! Worker threads and the accept loop.
//!
//! Each worker thread runs its own monoio runtime and listener (bound
//! with SO_REUSEPORT via monoio's listener defaults) and spawns one
//! independent task per accepted connection. Worker failures stay inside
//! their connection task; only a listener error is fatal.

use crate::connection::{ProxyShared, RESP_503, handle_connection};
use crate::upstream::UpstreamAddr;
use monoio::io::AsyncWriteRentExt;
use monoio::net::TcpListener;
use plugboard_core::{ProxyError, RouteTable, Settings};
use plugboard_hooks::HookClient;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Process-wide shutdown flag, set from the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

/// Immutable state shared across all worker threads.
pub struct SharedState {
    pub routes: Arc<RouteTable>,
    pub settings: Arc<Settings>,
    pub upstream: UpstreamAddr,
}

impl SharedState {
    pub fn new(routes: RouteTable, settings: Settings, upstream: UpstreamAddr) -> Arc<Self> {
        Arc::new(Self {
            routes: Arc::new(routes),
            settings: Arc::new(settings),
            upstream,
        })
    }
}

/// Spawn the worker threads, each with an independent monoio runtime.
pub fn spawn_workers(shared: Arc<SharedState>) -> Vec<std::thread::JoinHandle<()>> {
    let num_workers = shared.settings.workers.max(1);
    let listen_addr = shared.settings.listen_addr();
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("plugboard-worker-{worker_id}"))
            .spawn(move || {
                let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_all()
                    .build()
                    .expect("Failed to build monoio runtime");
                rt.block_on(worker_loop(worker_id, shared));
            })
            .expect("Failed to spawn worker thread");
        handles.push(handle);
    }

    info!(workers = num_workers, addr = %listen_addr, "Workers spawned");
    handles
}

/// Accept loop for one worker thread.
async fn worker_loop(worker_id: usize, shared: Arc<SharedState>) {
    let addr = shared.settings.listen_addr();
    let listener = match TcpListener::bind(addr.as_str()) {
        Ok(listener) => listener,
        Err(e) => {
            let err = ProxyError::Bind(e);
            error!(worker = worker_id, addr = %addr, error = %err, "listen bind failed");
            std::process::exit(1);
        }
    };
    info!(worker = worker_id, addr = %addr, "Worker listening");

    let proxy = Rc::new(ProxyShared {
        routes: Arc::clone(&shared.routes),
        upstream: shared.upstream.clone(),
        hook_client: HookClient::from_settings(&shared.settings),
    });
    let active = Rc::new(Cell::new(0usize));
    let max_connections = shared.settings.max_connections;

    loop {
        if shutdown_requested() {
            break;
        }
        // Timed accept so the shutdown flag is observed promptly.
        match monoio::time::timeout(Duration::from_millis(250), listener.accept()).await {
            Err(_) => continue,
            Ok(Ok((stream, peer))) => {
                let _ = stream.set_nodelay(true);

                if active.get() >= max_connections {
                    warn!(worker = worker_id, inflight = active.get(), client = %peer, "connection cap reached, rejecting");
                    monoio::spawn(async move {
                        let mut stream = stream;
                        let (res, _) = stream.write_all(RESP_503.to_vec()).await;
                        let _ = res;
                    });
                    continue;
                }

                active.set(active.get() + 1);
                let proxy = Rc::clone(&proxy);
                let active = Rc::clone(&active);
                monoio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, proxy).await {
                        debug!(error = %e, "Connection closed");
                    }
                    active.set(active.get() - 1);
                });
            }
            Ok(Err(e)) => {
                // The listener itself failing is the one fatal runtime error.
                error!(worker = worker_id, error = %e, "Accept error");
                std::process::exit(1);
            }
        }
    }

    // Shutdown: stop accepting, give in-flight exchanges the grace period.
    let deadline =
        std::time::Instant::now() + Duration::from_millis(shared.settings.shutdown_grace_ms);
    while active.get() > 0 && std::time::Instant::now() < deadline {
        monoio::time::sleep(Duration::from_millis(50)).await;
    }
    info!(worker = worker_id, "Worker stopped");
}
