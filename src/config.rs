//! Gateway configuration.
//!
//! A TOML file holds an `[app]` table plus one table per service named in
//! `app.services`. The file is read once at start-up into an immutable
//! [`Config`] snapshot; nothing mutates it afterwards.

use crate::error::{Error, IcapResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn default_port() -> u16 {
    1344
}

fn default_max_filesize() -> usize {
    10 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_preview_bytes() -> String {
    "1024".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// `[app]` table: process-wide settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Cap on a dechunked encapsulated body, in bytes.
    #[serde(default = "default_max_filesize")]
    pub max_filesize: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Preview size advertised by OPTIONS, as a decimal string.
    #[serde(default = "default_preview_bytes")]
    pub preview_bytes: String,
    /// When true, backend error detail is logged at error level;
    /// the client always sees a bare 500 either way.
    #[serde(default)]
    pub propagate_error: bool,
    /// Names of the service tables to expose.
    #[serde(default)]
    pub services: Vec<String>,
    /// Per-transaction deadline in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Optional cap on concurrent connections.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

/// One `[<service>]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub vendor: String,
    pub service_tag: String,
    pub service_caption: String,
    #[serde(default)]
    pub req_mode: bool,
    #[serde(default)]
    pub resp_mode: bool,
    #[serde(default)]
    pub shadow_service: bool,
    /// Per-service preview override; falls back to `app.preview_bytes`.
    #[serde(default)]
    pub preview_bytes: Option<u32>,
    /// Backend-specific keys, opaque to the core.
    #[serde(flatten)]
    pub settings: HashMap<String, toml::Value>,
}

/// Immutable configuration snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    #[serde(flatten)]
    pub services: HashMap<String, ServiceConfig>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> IcapResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::configuration(format!(
                "cannot read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml(content: &str) -> IcapResult<Self> {
        let cfg: Config = toml::from_str(content)
            .map_err(|e| Error::configuration(format!("config parse: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Declared preview size, parsed from the `app` table.
    pub fn app_preview_bytes(&self) -> IcapResult<Option<u32>> {
        let s = self.app.preview_bytes.trim();
        if s.is_empty() {
            return Ok(None);
        }
        s.parse::<u32>()
            .map(Some)
            .map_err(|_| Error::configuration(format!("app.preview_bytes '{s}' is not a non-negative integer")))
    }

    /// Per-transaction deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.app.request_timeout_secs)
    }

    fn validate(&self) -> IcapResult<()> {
        self.app_preview_bytes()?;
        for name in &self.app.services {
            let svc = self.services.get(name).ok_or_else(|| {
                Error::configuration(format!("service '{name}' listed in app.services has no [{name}] table"))
            })?;
            if svc.service_tag.is_empty() || svc.service_tag.len() > crate::response::MAX_ISTAG_BYTES
            {
                return Err(Error::configuration(format!(
                    "service '{name}': service_tag must be 1..={} bytes",
                    crate::response::MAX_ISTAG_BYTES
                )));
            }
            if svc.vendor.is_empty() {
                return Err(Error::configuration(format!(
                    "service '{name}': vendor must not be empty"
                )));
            }
            if !svc.req_mode && !svc.resp_mode {
                return Err(Error::configuration(format!(
                    "service '{name}' enables neither req_mode nor resp_mode"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [app]
        port = 1344
        max_filesize = 1048576
        log_level = "debug"
        preview_bytes = "2048"
        propagate_error = true
        services = ["echo", "scan"]

        [echo]
        vendor = "echo"
        service_tag = "ECHO-1.0"
        service_caption = "echo service"
        req_mode = true
        resp_mode = true

        [scan]
        vendor = "clamd"
        service_tag = "SCAN-2.3"
        service_caption = "virus scan"
        resp_mode = true
        shadow_service = true
        preview_bytes = 4096
        socket_path = "/run/clamd.sock"
    "#;

    #[test]
    fn loads_app_and_service_tables() {
        let cfg = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.app.port, 1344);
        assert_eq!(cfg.app.max_filesize, 1048576);
        assert!(cfg.app.propagate_error);
        assert_eq!(cfg.app_preview_bytes().unwrap(), Some(2048));

        let scan = &cfg.services["scan"];
        assert_eq!(scan.vendor, "clamd");
        assert!(scan.shadow_service);
        assert!(!scan.req_mode);
        assert_eq!(scan.preview_bytes, Some(4096));
        // Backend-specific keys stay opaque but reachable.
        assert_eq!(
            scan.settings["socket_path"].as_str(),
            Some("/run/clamd.sock")
        );
    }

    #[test]
    fn missing_service_table_is_rejected() {
        let bad = r#"
            [app]
            services = ["ghost"]
        "#;
        let err = Config::from_toml(bad).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn unparseable_preview_bytes_is_rejected() {
        let bad = r#"
            [app]
            preview_bytes = "lots"
            services = ["echo"]

            [echo]
            vendor = "echo"
            service_tag = "E1"
            service_caption = "echo"
            req_mode = true
        "#;
        assert!(Config::from_toml(bad).is_err());
    }

    #[test]
    fn service_without_modes_is_rejected() {
        let bad = r#"
            [app]
            services = ["dead"]

            [dead]
            vendor = "echo"
            service_tag = "D1"
            service_caption = "dead"
        "#;
        assert!(Config::from_toml(bad).is_err());
    }

    #[test]
    fn overlong_istag_is_rejected() {
        let bad = format!(
            r#"
            [app]
            services = ["echo"]

            [echo]
            vendor = "echo"
            service_tag = "{}"
            service_caption = "echo"
            req_mode = true
        "#,
            "A".repeat(33)
        );
        assert!(Config::from_toml(&bad).is_err());
    }
}
