// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Plugboard — adapter-hook proxy for the Docker API
//
//  Architecture: monoio thread-per-core data plane
//  Hooks:        sequential pre/post adapter chains over JSON
//  Config:       adapters YAML + PORT / CONFIG / DOCKER_HOST env
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use plugboard_core::settings::{self, Settings};
use plugboard_core::{HookConfig, RouteTable};
use plugboard_proxy::acceptor::{self, SharedState};
use plugboard_proxy::upstream::UpstreamAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "plugboard", version, about = "Adapter-hook proxy for the Docker API")]
struct Cli {
    /// Path to the adapters configuration file
    #[arg(long, env = "CONFIG", default_value = "/etc/powerstrip/adapters.yml")]
    config: PathBuf,

    /// Listen port (binds all interfaces)
    #[arg(long, env = "PORT", default_value_t = settings::default_port())]
    port: u16,

    /// Upstream URL (unix:///path or tcp://host:port)
    #[arg(long, env = "DOCKER_HOST", default_value_t = settings::default_upstream())]
    docker_host: String,

    /// Number of worker threads
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// In-flight connection cap per worker
    #[arg(long, default_value_t = settings::default_max_connections())]
    max_connections: usize,

    /// Require method equality on endpoint match
    #[arg(long, default_value_t = false)]
    strict_methods: bool,

    /// Adapter connect deadline (milliseconds)
    #[arg(long, default_value_t = settings::default_hook_connect_timeout())]
    hook_connect_timeout_ms: u64,

    /// Total per-adapter-call deadline (milliseconds)
    #[arg(long, default_value_t = settings::default_hook_timeout())]
    hook_timeout_ms: u64,

    /// Grace period for in-flight exchanges on shutdown (milliseconds)
    #[arg(long, default_value_t = settings::default_shutdown_grace())]
    shutdown_grace_ms: u64,
}

impl Cli {
    fn into_settings(self) -> Settings {
        Settings {
            port: self.port,
            upstream: self.docker_host,
            config_path: self.config,
            workers: self.workers,
            max_connections: self.max_connections,
            strict_methods: self.strict_methods,
            hook_connect_timeout_ms: self.hook_connect_timeout_ms,
            hook_timeout_ms: self.hook_timeout_ms,
            shutdown_grace_ms: self.shutdown_grace_ms,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing (DEBUG: any non-empty value enables debug logging) ──
    let default_level = match std::env::var("DEBUG") {
        Ok(v) if !v.is_empty() => "debug",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let settings = cli.into_settings();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = settings.port,
        upstream = %settings.upstream,
        "Plugboard starting"
    );

    // ── Config: endpoints + adapters ──
    info!(path = %settings.config_path.display(), "Loading adapters file");
    let config = HookConfig::load(&settings.config_path)?;
    let routes = RouteTable::build(&config, settings.strict_methods)?;
    info!(
        endpoints = routes.entry_count(),
        adapters = config.adapters.len(),
        "Routing table built"
    );

    // ── Upstream ──
    let upstream = UpstreamAddr::parse(&settings.upstream)?;

    // ── Workers ──
    let shared = SharedState::new(routes, settings, upstream);
    let handles = acceptor::spawn_workers(shared);

    // ── Graceful shutdown: wait for SIGTERM/SIGINT ──
    setup_signal_handler();
    while !acceptor::shutdown_requested() {
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("Shutdown signal received, draining");

    // Workers stop accepting and drain within the grace period.
    for handle in handles {
        let _ = handle.join();
    }

    info!("Plugboard stopped");
    Ok(())
}

fn setup_signal_handler() {
    // SIGTERM (docker stop) + SIGINT (Ctrl+C)
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    acceptor::request_shutdown();
}
