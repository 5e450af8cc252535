use crate::error::ProxyError;
use figment::Figment;
use figment::providers::{Format, Yaml};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// The adapters configuration file.
///
/// ```yaml
/// version: 1
/// endpoints:
///   "POST /*/containers/create":
///     pre: [flocker, weave]
///   "POST /*/containers/*/start":
///     post: [weave]
/// adapters:
///   weave: http://weave/extension
///   flocker: http://flocker/flocker-adapter
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    #[serde(default)]
    pub version: u32,

    /// `"METHOD PATTERN"` → hook lists.
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointHooks>,

    /// Adapter name → absolute base URL.
    #[serde(default)]
    pub adapters: HashMap<String, String>,
}

/// Hook lists for one endpoint. At least one of `pre`/`post` must be
/// non-empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointHooks {
    #[serde(default)]
    pub pre: Vec<String>,

    #[serde(default)]
    pub post: Vec<String>,
}

impl HookConfig {
    /// Read and validate the adapters file. Any failure here is fatal.
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let config: HookConfig = Figment::new()
            .merge(Yaml::file_exact(path))
            .extract()
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate from an inline YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ProxyError> {
        let config: HookConfig = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole document, collecting every problem before
    /// reporting, so a bad file is fixed in one round.
    fn validate(&self) -> Result<(), ProxyError> {
        let mut problems: Vec<String> = Vec::new();

        if self.endpoints.is_empty() {
            problems.push("endpoints are required".to_string());
        }
        if self.adapters.is_empty() {
            problems.push("adapters are required".to_string());
        }

        for (name, url) in &self.adapters {
            if url.is_empty() {
                problems.push(format!("url required for adapter: {name}"));
                continue;
            }
            match url.parse::<http::Uri>() {
                Ok(uri) if uri.authority().is_some() => {}
                Ok(_) => problems.push(format!("invalid url for adapter: {name} (no authority)")),
                Err(_) => problems.push(format!("invalid url for adapter: {name}")),
            }
        }

        for (key, endpoint) in &self.endpoints {
            if endpoint.pre.is_empty() && endpoint.post.is_empty() {
                problems.push(format!("pre or post adapters required for endpoint: {key}"));
            }

            match split_endpoint_key(key) {
                Some((_, pattern)) => {
                    if let Err(e) = glob::Pattern::new(pattern) {
                        problems.push(format!("invalid pattern for endpoint: {key}: {e}"));
                    }
                }
                None => problems.push(format!(
                    "endpoint key must be \"METHOD PATTERN\": {key}"
                )),
            }

            for name in endpoint.pre.iter() {
                if !self.adapters.contains_key(name) {
                    problems.push(format!(
                        "pre hook adapter: {name} for endpoint: {key} not found"
                    ));
                }
            }
            for name in endpoint.post.iter() {
                if !self.adapters.contains_key(name) {
                    problems.push(format!(
                        "post hook adapter: {name} for endpoint: {key} not found"
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::Config(problems.join("; ")))
        }
    }
}

/// Split an endpoint key into `(method, pattern)` on the first space.
pub fn split_endpoint_key(key: &str) -> Option<(&str, &str)> {
    let (method, pattern) = key.split_once(' ')?;
    if method.is_empty() || pattern.is_empty() {
        return None;
    }
    Some((method, pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
version: 1
endpoints:
  "POST /*/containers/*":
    pre: [slowreq]
    post: [slowreq]
adapters:
  slowreq: http://slowreq/slowreq-adapter
"#;

    #[test]
    fn valid_config_parses() {
        let cfg = HookConfig::from_yaml(VALID).unwrap();
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.endpoints.len(), 1);
        let ep = &cfg.endpoints["POST /*/containers/*"];
        assert_eq!(ep.pre, vec!["slowreq"]);
        assert_eq!(ep.post, vec!["slowreq"]);
        assert_eq!(cfg.adapters["slowreq"], "http://slowreq/slowreq-adapter");
    }

    #[test]
    fn missing_endpoints_rejected() {
        let err = HookConfig::from_yaml(
            r#"
version: 1
adapters:
  flocker: http://flocker/flocker-adapter
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("endpoints are required"));
    }

    #[test]
    fn missing_adapters_rejected() {
        let err = HookConfig::from_yaml(
            r#"
version: 1
endpoints:
  "POST /x":
    pre: [a]
"#,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("adapters are required"));
        // Dangling reference is reported in the same pass.
        assert!(msg.contains("pre hook adapter: a"));
    }

    #[test]
    fn empty_adapter_url_rejected() {
        let err = HookConfig::from_yaml(
            r#"
endpoints:
  "POST /*/containers/create":
    pre: [flocker]
adapters:
  weave: ""
  flocker: http://flocker/flocker-adapter
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("url required for adapter: weave"));
    }

    #[test]
    fn endpoint_without_hooks_rejected() {
        let err = HookConfig::from_yaml(
            r#"
endpoints:
  "POST /*/containers/create": {}
adapters:
  weave: http://weave/extension
"#,
        )
        .unwrap_err();
        assert!(
            err.to_string()
                .contains("pre or post adapters required for endpoint")
        );
    }

    #[test]
    fn unknown_post_adapter_rejected() {
        let err = HookConfig::from_yaml(
            r#"
endpoints:
  "POST /c":
    post: [ghost]
adapters:
  weave: http://weave/extension
"#,
        )
        .unwrap_err();
        assert!(
            err.to_string()
                .contains("post hook adapter: ghost for endpoint: POST /c not found")
        );
    }

    #[test]
    fn endpoint_key_without_space_rejected() {
        let err = HookConfig::from_yaml(
            r#"
endpoints:
  "/no-method":
    pre: [weave]
adapters:
  weave: http://weave/extension
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("METHOD PATTERN"));
    }

    #[test]
    fn empty_document_rejected() {
        assert!(HookConfig::from_yaml("").is_err());
    }

    #[test]
    fn split_endpoint_key_splits_on_first_space() {
        assert_eq!(
            split_endpoint_key("POST /*/containers/create"),
            Some(("POST", "/*/containers/create"))
        );
        assert_eq!(split_endpoint_key("GET /"), Some(("GET", "/")));
        assert_eq!(split_endpoint_key("nospace"), None);
        assert_eq!(split_endpoint_key(" /leading"), None);
        assert_eq!(split_endpoint_key("POST "), None);
    }

    #[test]
    fn https_adapter_url_parses() {
        let cfg = HookConfig::from_yaml(
            r#"
endpoints:
  "GET /info":
    pre: [audit]
adapters:
  audit: https://audit.internal:8443/hook
"#,
        );
        assert!(cfg.is_ok());
    }
}
