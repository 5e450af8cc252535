use crate::config::{HookConfig, split_endpoint_key};
use crate::error::ProxyError;
use glob::{MatchOptions, Pattern};
use std::sync::Arc;

/// A configured adapter service: a name and a validated base URL.
///
/// Only the scheme and authority of the base URL are used when building a
/// per-exchange target; the adapter's own path segment is dropped and the
/// request's path (plus query) is substituted instead.
#[derive(Debug, Clone)]
pub struct Adapter {
    pub name: String,
    pub uri: http::Uri,
}

impl Adapter {
    /// host:port the adapter is reached at.
    pub fn authority(&self) -> &str {
        // Validated at load time: the URL carries an authority.
        self.uri.authority().map(|a| a.as_str()).unwrap_or("")
    }

    /// Absolute target URL for one exchange: adapter scheme + authority
    /// with the request target (path and query) appended.
    pub fn target(&self, request_target: &str) -> String {
        let scheme = self.uri.scheme_str().unwrap_or("http");
        if request_target.starts_with('/') {
            format!("{}://{}{}", scheme, self.authority(), request_target)
        } else {
            format!("{}://{}/{}", scheme, self.authority(), request_target)
        }
    }
}

/// One compiled endpoint entry.
#[derive(Debug)]
struct RouteEntry {
    method: String,
    pattern: Pattern,
    pre: Vec<Arc<Adapter>>,
    post: Vec<Arc<Adapter>>,
}

/// Hooks selected for one exchange, in deterministic entry order.
#[derive(Debug, Default)]
pub struct RouteHooks {
    pub pre: Vec<Arc<Adapter>>,
    pub post: Vec<Arc<Adapter>>,
}

impl RouteHooks {
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }
}

/// Immutable endpoint routing table, built once from a validated
/// [`HookConfig`] and shared read-only by every connection.
///
/// Entries are sorted lexicographically by `(method, pattern)` so that
/// when several endpoints match one path, their hook lists concatenate in
/// a stable order regardless of config-map iteration order.
#[derive(Debug)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    strict_methods: bool,
}

/// `*` matches within a single path segment, never across `/`.
const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl RouteTable {
    pub fn build(config: &HookConfig, strict_methods: bool) -> Result<Self, ProxyError> {
        let mut adapters: std::collections::HashMap<&str, Arc<Adapter>> =
            std::collections::HashMap::with_capacity(config.adapters.len());
        for (name, url) in &config.adapters {
            let uri: http::Uri = url
                .parse()
                .map_err(|_| ProxyError::Config(format!("invalid url for adapter: {name}")))?;
            adapters.insert(
                name.as_str(),
                Arc::new(Adapter {
                    name: name.clone(),
                    uri,
                }),
            );
        }

        let resolve = |names: &[String], key: &str| -> Result<Vec<Arc<Adapter>>, ProxyError> {
            names
                .iter()
                .map(|name| {
                    adapters.get(name.as_str()).cloned().ok_or_else(|| {
                        ProxyError::Config(format!(
                            "adapter: {name} for endpoint: {key} not found"
                        ))
                    })
                })
                .collect()
        };

        let mut entries = Vec::with_capacity(config.endpoints.len());
        for (key, endpoint) in &config.endpoints {
            let (method, pattern) = split_endpoint_key(key).ok_or_else(|| {
                ProxyError::Config(format!("endpoint key must be \"METHOD PATTERN\": {key}"))
            })?;
            let pattern = Pattern::new(pattern).map_err(|e| {
                ProxyError::Config(format!("invalid pattern for endpoint: {key}: {e}"))
            })?;
            entries.push(RouteEntry {
                method: method.to_string(),
                pattern,
                pre: resolve(&endpoint.pre, key)?,
                post: resolve(&endpoint.post, key)?,
            });
        }

        entries.sort_by(|a, b| {
            (a.method.as_str(), a.pattern.as_str()).cmp(&(b.method.as_str(), b.pattern.as_str()))
        });

        Ok(Self {
            entries,
            strict_methods,
        })
    }

    /// Select hooks for a request. `path` is the request path without the
    /// query string. Multiple matching entries concatenate their lists in
    /// table order.
    pub fn matches(&self, method: &str, path: &str) -> RouteHooks {
        let mut hooks = RouteHooks::default();
        for entry in &self.entries {
            if self.strict_methods && entry.method != method {
                continue;
            }
            if entry.pattern.matches_with(path, GLOB_OPTIONS) {
                hooks.pre.extend(entry.pre.iter().cloned());
                hooks.post.extend(entry.post.iter().cloned());
            }
        }
        hooks
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}
