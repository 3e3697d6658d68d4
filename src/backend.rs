//! Adaptation backend contract.
//!
//! A backend performs the actual inspection or transformation of the
//! encapsulated HTTP message. Backends are selected by
//! `(vendor, service, method)` from a registry populated at start-up;
//! the transaction controller is agnostic to concrete implementations.

use crate::error::IcapResult;
use crate::registry::ServiceDescriptor;
use crate::request::{EmbeddedHttp, Method};
use crate::response::StatusCode;
use async_trait::async_trait;
use http::{HeaderMap, Request as HttpRequest, Response as HttpResponse};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Replayable view of the encapsulated HTTP message(s) handed to a
/// backend. Bodies are fully buffered, so a backend may consume them
/// freely; the controller keeps its own copy for echoing.
#[derive(Debug)]
pub struct AdaptationInput {
    pub http_request: Option<HttpRequest<Vec<u8>>>,
    pub http_response: Option<HttpResponse<Vec<u8>>>,
    /// Correlation token for logging.
    pub txn: u64,
    /// Time remaining before the transaction is aborted.
    pub deadline: Duration,
}

/// Outcome of a backend call: an ICAP status intent, an optional
/// replacement message, and headers to append to the ICAP response.
#[derive(Debug)]
pub struct Verdict {
    pub status: StatusCode,
    pub replacement: Option<EmbeddedHttp>,
    pub headers: HeaderMap,
}

impl Verdict {
    /// The message needs no modification.
    pub fn no_modification() -> Self {
        Self {
            status: StatusCode::NoContent204,
            replacement: None,
            headers: HeaderMap::new(),
        }
    }

    /// Replace the encapsulated message.
    pub fn replace(message: EmbeddedHttp) -> Self {
        Self {
            status: StatusCode::Ok200,
            replacement: Some(message),
            headers: HeaderMap::new(),
        }
    }

    /// Refuse the message, optionally substituting a block page.
    pub fn block(message: Option<EmbeddedHttp>) -> Self {
        Self {
            status: StatusCode::Forbidden403,
            replacement: message,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (
            http::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            self.headers.append(n, v);
        }
        self
    }
}

/// An adaptation backend. One instance serves one transaction at a time
/// but instances are shared, so implementations must be `Send + Sync`.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn process(&self, input: AdaptationInput) -> IcapResult<Verdict>;
}

/// Creates backend instances for the services of one vendor.
pub trait BackendFactory: Send + Sync {
    fn create(
        &self,
        service: &ServiceDescriptor,
        method: Method,
    ) -> IcapResult<Arc<dyn Backend>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BackendKey {
    vendor: String,
    service: String,
    method: Method,
}

/// `(vendor, service, method)` → backend lookup, immutable after start-up.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKey, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend for one service/method pair.
    pub fn register(
        &mut self,
        vendor: &str,
        service: &str,
        method: Method,
        backend: Arc<dyn Backend>,
    ) {
        self.backends.insert(
            BackendKey {
                vendor: vendor.to_string(),
                service: service.to_string(),
                method,
            },
            backend,
        );
    }

    pub fn get(&self, vendor: &str, service: &str, method: Method) -> Option<Arc<dyn Backend>> {
        self.backends
            .get(&BackendKey {
                vendor: vendor.to_string(),
                service: service.to_string(),
                method,
            })
            .cloned()
    }
}

type BoxedVerdictFuture = Pin<Box<dyn Future<Output = IcapResult<Verdict>> + Send>>;

/// Adapter turning a plain async function into a [`Backend`].
pub struct FnBackend {
    inner: Box<dyn Fn(AdaptationInput) -> BoxedVerdictFuture + Send + Sync>,
}

impl FnBackend {
    pub fn new<F, Fut>(f: F) -> Arc<dyn Backend>
    where
        F: Fn(AdaptationInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IcapResult<Verdict>> + Send + 'static,
    {
        Arc::new(Self {
            inner: Box::new(move |input| Box::pin(f(input))),
        })
    }
}

#[async_trait]
impl Backend for FnBackend {
    async fn process(&self, input: AdaptationInput) -> IcapResult<Verdict> {
        (self.inner)(input).await
    }
}

/// Built-in pass-through vendor: every message is reported unmodified.
pub struct EchoBackend;

#[async_trait]
impl Backend for EchoBackend {
    async fn process(&self, _input: AdaptationInput) -> IcapResult<Verdict> {
        Ok(Verdict::no_modification())
    }
}

/// Factory for the built-in `echo` vendor.
pub struct EchoFactory;

impl BackendFactory for EchoFactory {
    fn create(
        &self,
        _service: &ServiceDescriptor,
        _method: Method,
    ) -> IcapResult<Arc<dyn Backend>> {
        Ok(Arc::new(EchoBackend))
    }
}
