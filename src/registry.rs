//! Service registry.
//!
//! A read-only name→descriptor lookup built from the configuration
//! snapshot at start-up and shared across transactions.

use crate::config::Config;
use crate::error::IcapResult;
use crate::request::Method;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable description of one configured service.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub vendor: String,
    /// ISTag value stamped on every response of this service.
    pub istag: String,
    /// Human-readable caption, sent as the `Service` header.
    pub caption: String,
    /// Preview size advertised by OPTIONS, if configured.
    pub preview_bytes: Option<u32>,
    pub req_mode: bool,
    pub resp_mode: bool,
    /// Shadow services answer the client immediately and run their
    /// backend for side effects only.
    pub shadow: bool,
    /// Backend-specific settings, opaque to the core.
    pub settings: HashMap<String, toml::Value>,
}

impl ServiceDescriptor {
    /// `OPTIONS` is always enabled; modification methods are gated by
    /// their configuration flags.
    pub fn is_method_enabled(&self, method: Method) -> bool {
        match method {
            Method::Options => true,
            Method::ReqMod => self.req_mode,
            Method::RespMod => self.resp_mode,
        }
    }

    /// Enabled modification methods in canonical order (RESPMOD first).
    pub fn enabled_methods(&self) -> SmallVec<[Method; 2]> {
        let mut methods = SmallVec::new();
        if self.resp_mode {
            methods.push(Method::RespMod);
        }
        if self.req_mode {
            methods.push(Method::ReqMod);
        }
        methods
    }

    /// Comma-separated value for the `Methods` OPTIONS header.
    pub fn enabled_methods_string(&self) -> String {
        self.enabled_methods()
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Name→descriptor lookup over the configuration snapshot.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceDescriptor>>,
}

impl ServiceRegistry {
    /// Build the registry from a validated configuration snapshot.
    pub fn from_config(cfg: &Config) -> IcapResult<Self> {
        let app_preview = cfg.app_preview_bytes()?;
        let mut services = HashMap::with_capacity(cfg.app.services.len());
        for name in &cfg.app.services {
            // validate() guarantees the table exists
            let svc = &cfg.services[name];
            services.insert(
                name.clone(),
                Arc::new(ServiceDescriptor {
                    name: name.clone(),
                    vendor: svc.vendor.clone(),
                    istag: svc.service_tag.clone(),
                    caption: svc.service_caption.clone(),
                    preview_bytes: svc.preview_bytes.or(app_preview),
                    req_mode: svc.req_mode,
                    resp_mode: svc.resp_mode,
                    shadow: svc.shadow_service,
                    settings: svc.settings.clone(),
                }),
            );
        }
        Ok(Self { services })
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn registry() -> ServiceRegistry {
        let cfg = Config::from_toml(
            r#"
            [app]
            preview_bytes = "1024"
            services = ["both", "resp_only"]

            [both]
            vendor = "echo"
            service_tag = "B1"
            service_caption = "both modes"
            req_mode = true
            resp_mode = true

            [resp_only]
            vendor = "echo"
            service_tag = "R1"
            service_caption = "resp only"
            resp_mode = true
            preview_bytes = 64
        "#,
        )
        .unwrap();
        ServiceRegistry::from_config(&cfg).unwrap()
    }

    #[test]
    fn lookup_finds_configured_services_only() {
        let reg = registry();
        assert!(reg.lookup("both").is_some());
        assert!(reg.lookup("nope").is_none());
    }

    #[test]
    fn options_is_always_enabled() {
        let reg = registry();
        let svc = reg.lookup("resp_only").unwrap();
        assert!(svc.is_method_enabled(Method::Options));
        assert!(svc.is_method_enabled(Method::RespMod));
        assert!(!svc.is_method_enabled(Method::ReqMod));
    }

    #[test]
    fn methods_string_uses_canonical_order() {
        let reg = registry();
        assert_eq!(
            reg.lookup("both").unwrap().enabled_methods_string(),
            "RESPMOD, REQMOD"
        );
        assert_eq!(
            reg.lookup("resp_only").unwrap().enabled_methods_string(),
            "RESPMOD"
        );
    }

    #[test]
    fn preview_falls_back_to_app_setting() {
        let reg = registry();
        assert_eq!(reg.lookup("both").unwrap().preview_bytes, Some(1024));
        assert_eq!(reg.lookup("resp_only").unwrap().preview_bytes, Some(64));
    }
}
