//! ICAP request model.
//!
//! An inbound ICAP message is parsed once at ingress into [`Request`]:
//! a [`Method`] tag, the raw URI, the ICAP header block, and the
//! materialized encapsulated HTTP message(s) with dechunked bodies.

use crate::error::{Error, IcapResult};
use http::{HeaderMap, Request as HttpRequest, Response as HttpResponse};
use std::fmt;
use std::str::FromStr;

/// ICAP method, parsed once from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    ReqMod,
    RespMod,
}

impl Method {
    /// Configuration key gating this method per service.
    ///
    /// `OPTIONS` is always enabled and has no key.
    pub fn config_key(&self) -> Option<&'static str> {
        match self {
            Method::Options => None,
            Method::ReqMod => Some("req_mode"),
            Method::RespMod => Some("resp_mode"),
        }
    }

    /// Wire form of the method (uppercase ASCII).
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::ReqMod => "REQMOD",
            Method::RespMod => "RESPMOD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPTIONS" => Ok(Method::Options),
            "REQMOD" => Ok(Method::ReqMod),
            "RESPMOD" => Ok(Method::RespMod),
            other => Err(Error::InvalidMethod(other.to_string())),
        }
    }
}

/// An encapsulated HTTP message carried in an ICAP body.
///
/// Bodies are the dechunked concatenation of the wire chunks.
#[derive(Debug)]
pub enum EmbeddedHttp {
    Req(HttpRequest<Vec<u8>>),
    Resp(HttpResponse<Vec<u8>>),
}

impl EmbeddedHttp {
    /// Body bytes of the embedded message.
    pub fn body(&self) -> &[u8] {
        match self {
            EmbeddedHttp::Req(r) => r.body(),
            EmbeddedHttp::Resp(r) => r.body(),
        }
    }
}

impl Clone for EmbeddedHttp {
    fn clone(&self) -> Self {
        match self {
            EmbeddedHttp::Req(r) => EmbeddedHttp::Req(crate::parser::clone_http_request(r)),
            EmbeddedHttp::Resp(r) => EmbeddedHttp::Resp(crate::parser::clone_http_response(r)),
        }
    }
}

/// A parsed ICAP request. Lives for exactly one transaction.
#[derive(Debug)]
pub struct Request {
    /// ICAP method tag.
    pub method: Method,
    /// Request URI as received (absolute or absolute-path form).
    pub uri: String,
    /// ICAP header block, case-insensitive keys, insertion order kept.
    pub icap_headers: HeaderMap,
    /// Encapsulated HTTP request (`req-hdr`, optionally `req-body`).
    pub http_request: Option<HttpRequest<Vec<u8>>>,
    /// Encapsulated HTTP response (`res-hdr`, optionally `res-body`).
    pub http_response: Option<HttpResponse<Vec<u8>>>,
    /// Declared `Preview: N` size, if any.
    pub preview_size: Option<usize>,
    /// True while only the preview chunk of the body has been read.
    pub is_preview: bool,
    /// True when the preview terminator was `0; ieof` (stream complete).
    pub preview_ieof: bool,
    /// Client advertised `Allow: 204`.
    pub allow_204: bool,
}

impl Request {
    /// Final path segment of the URI, naming the service.
    pub fn service_name(&self) -> IcapResult<&str> {
        let path = match self.uri.find("://") {
            Some(scheme_end) => {
                let rest = &self.uri[scheme_end + 3..];
                match rest.find('/') {
                    Some(slash) => &rest[slash..],
                    None => "",
                }
            }
            None => self.uri.as_str(),
        };
        let name = path
            .trim_start_matches('/')
            .split('/')
            .next_back()
            .unwrap_or("");
        let name = match name.find('?') {
            Some(q) => &name[..q],
            None => name,
        };
        if name.is_empty() {
            Err(Error::InvalidUri(format!(
                "no service in ICAP URI '{}'",
                self.uri
            )))
        } else {
            Ok(name)
        }
    }

    /// Whether a `204 No Modifications` may be sent to this client:
    /// either `Allow: 204` was advertised or we are still inside preview.
    pub fn can_return_204(&self) -> bool {
        self.allow_204 || self.is_preview
    }

    /// The encapsulated HTTP request method is `CONNECT`.
    pub fn is_connect(&self) -> bool {
        self.http_request
            .as_ref()
            .map(|r| r.method() == http::Method::CONNECT)
            .unwrap_or(false)
    }

    /// Move the encapsulated message out for echoing or dispatch.
    ///
    /// `RESPMOD` prefers the response part; `REQMOD` the request part.
    pub fn take_primary_message(&mut self) -> Option<EmbeddedHttp> {
        match self.method {
            Method::RespMod => self
                .http_response
                .take()
                .map(EmbeddedHttp::Resp)
                .or_else(|| self.http_request.take().map(EmbeddedHttp::Req)),
            _ => self
                .http_request
                .take()
                .map(EmbeddedHttp::Req)
                .or_else(|| self.http_response.take().map(EmbeddedHttp::Resp)),
        }
    }
}
