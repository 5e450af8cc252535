use std::path::PathBuf;

/// Process-level options for the proxy.
///
/// Populated by the binary from CLI flags with environment fallbacks
/// (`PORT`, `CONFIG`, `DOCKER_HOST`); everything here is resolved before
/// any worker starts and is immutable afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Listen port; binds on all interfaces.
    pub port: u16,

    /// Upstream URL. Scheme is the dial network: `unix` uses the path as
    /// a socket path, `tcp` uses the authority as host:port.
    pub upstream: String,

    /// Path to the adapters YAML file.
    pub config_path: PathBuf,

    /// Number of acceptor threads (each owning a SO_REUSEPORT listener).
    pub workers: usize,

    /// In-flight connection cap per worker; excess connections get a 503.
    pub max_connections: usize,

    /// Require method equality on endpoint match, instead of the
    /// path-only matching the adapter protocol historically used.
    pub strict_methods: bool,

    /// Adapter connect deadline (milliseconds).
    pub hook_connect_timeout_ms: u64,

    /// Total per-adapter-call deadline (milliseconds).
    pub hook_timeout_ms: u64,

    /// How long in-flight exchanges may run after a shutdown signal.
    pub shutdown_grace_ms: u64,
}

impl Settings {
    /// Address the workers listen on.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn hook_connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.hook_connect_timeout_ms)
    }

    pub fn hook_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.hook_timeout_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: default_port(),
            upstream: default_upstream(),
            config_path: default_config_path(),
            workers: 1,
            max_connections: default_max_connections(),
            strict_methods: false,
            hook_connect_timeout_ms: default_hook_connect_timeout(),
            hook_timeout_ms: default_hook_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

// Defaults

pub fn default_port() -> u16 {
    2375
}

pub fn default_upstream() -> String {
    "unix:///var/run/docker.sock".to_string()
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/powerstrip/adapters.yml")
}

pub fn default_max_connections() -> usize {
    1024
}

pub fn default_hook_connect_timeout() -> u64 {
    5_000
}

pub fn default_hook_timeout() -> u64 {
    30_000
}

pub fn default_shutdown_grace() -> u64 {
    5_000
}
