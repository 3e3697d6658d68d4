#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

pub mod backend;
pub mod config;
pub mod error;
pub mod handler;
pub mod parser;
pub mod registry;
pub mod request;
pub mod response;
pub mod server;
pub mod writer;

pub use backend::{
    AdaptationInput, Backend, BackendFactory, BackendRegistry, EchoBackend, EchoFactory,
    FnBackend, Verdict,
};
pub use config::Config;
pub use error::{Error, IcapResult};
pub use registry::{ServiceDescriptor, ServiceRegistry};
pub use request::{EmbeddedHttp, Method, Request};
pub use response::{Response, StatusCode};
pub use server::{Server, ServerBuilder};
pub use writer::ResponseWriter;

///Lib version
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");
///Max header size
pub const MAX_HDR_BYTES: usize = 64 * 1024;
/// Supported ICAP protocol version.
pub const ICAP_VERSION: &str = "ICAP/1.0";
/// Software token stamped into the default `Service` header.
pub const SERVER_SOFTWARE: &str = concat!("icap-gateway/", env!("CARGO_PKG_VERSION"));
/// ISTag used on replies emitted before a service is resolved.
pub const DEFAULT_ISTAG: &str = "icap-gateway-default";
