//! ICAP response model.
//!
//! [`Response`] is the parse-side and convenience representation of an ICAP
//! response. The server's emit path streams through
//! [`ResponseWriter`](crate::writer::ResponseWriter); `Response` backs the
//! client-facing helpers, the round-trip tests, and simple header-only
//! replies.

use crate::error::{Error, IcapResult};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::fmt;
use std::str::FromStr;

/// Maximum ISTag length in bytes per RFC 3507.
pub const MAX_ISTAG_BYTES: usize = 32;

/// ICAP status codes used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Continue100,
    Ok200,
    NoContent204,
    BadRequest400,
    Forbidden403,
    NotFound404,
    MethodNotAllowed405,
    RequestEntityTooLarge413,
    InternalServerError500,
    ServiceUnavailable503,
    GatewayTimeout504,
}

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Continue100 => 100,
            StatusCode::Ok200 => 200,
            StatusCode::NoContent204 => 204,
            StatusCode::BadRequest400 => 400,
            StatusCode::Forbidden403 => 403,
            StatusCode::NotFound404 => 404,
            StatusCode::MethodNotAllowed405 => 405,
            StatusCode::RequestEntityTooLarge413 => 413,
            StatusCode::InternalServerError500 => 500,
            StatusCode::ServiceUnavailable503 => 503,
            StatusCode::GatewayTimeout504 => 504,
        }
    }

    pub fn from_u16(code: u16) -> IcapResult<Self> {
        match code {
            100 => Ok(StatusCode::Continue100),
            200 => Ok(StatusCode::Ok200),
            204 => Ok(StatusCode::NoContent204),
            400 => Ok(StatusCode::BadRequest400),
            403 => Ok(StatusCode::Forbidden403),
            404 => Ok(StatusCode::NotFound404),
            405 => Ok(StatusCode::MethodNotAllowed405),
            413 => Ok(StatusCode::RequestEntityTooLarge413),
            500 => Ok(StatusCode::InternalServerError500),
            503 => Ok(StatusCode::ServiceUnavailable503),
            504 => Ok(StatusCode::GatewayTimeout504),
            other => Err(Error::InvalidStatusCode(other.to_string())),
        }
    }

    /// Canonical reason phrase.
    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Continue100 => "Continue",
            StatusCode::Ok200 => "OK",
            StatusCode::NoContent204 => "No Modifications",
            StatusCode::BadRequest400 => "Bad Request",
            StatusCode::Forbidden403 => "Forbidden",
            StatusCode::NotFound404 => "ICAP Service Not Found",
            StatusCode::MethodNotAllowed405 => "Method Not Allowed",
            StatusCode::RequestEntityTooLarge413 => "Request Entity Too Large",
            StatusCode::InternalServerError500 => "Internal Server Error",
            StatusCode::ServiceUnavailable503 => "Service Unavailable",
            StatusCode::GatewayTimeout504 => "Gateway Timeout",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

impl FromStr for StatusCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s
            .parse::<u16>()
            .map_err(|_| Error::InvalidStatusCode(s.to_string()))?;
        StatusCode::from_u16(code)
    }
}

/// ICAP response: status line, header block, raw encapsulated bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub version: String,
    pub status_code: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    /// Raw encapsulated block (HTTP head + chunked body on the wire).
    pub body: Vec<u8>,
}

impl Response {
    /// Create a new ICAP response with the canonical reason phrase.
    pub fn new(status_code: StatusCode, status_text: &str) -> Self {
        Self {
            version: crate::ICAP_VERSION.to_string(),
            status_code,
            status_text: status_text.to_string(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// `204 No Modifications` response skeleton.
    pub fn no_content() -> Self {
        Self::new(StatusCode::NoContent204, StatusCode::NoContent204.reason())
    }

    /// Add a header, replacing any previous value under the same name.
    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(n, v);
        }
        self
    }

    /// Set the `ISTag` header, enforcing the RFC length cap.
    pub fn try_set_istag(mut self, istag: &str) -> IcapResult<Self> {
        if istag.is_empty() || istag.len() > MAX_ISTAG_BYTES {
            return Err(Error::InvalidISTag(istag.to_string()));
        }
        self.headers
            .insert("istag", HeaderValue::from_str(istag)?);
        Ok(self)
    }

    /// Get header value.
    pub fn get_header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// Check if response has a specific header.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// Serialize to wire bytes.
    pub fn to_raw(&self) -> IcapResult<Vec<u8>> {
        crate::parser::serialize_icap_response(self)
    }

    /// Parse ICAP response from wire bytes.
    pub fn from_raw(raw: &[u8]) -> IcapResult<Self> {
        crate::parser::parse_icap_response(raw)
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status_code,
            StatusCode::Ok200 | StatusCode::NoContent204
        )
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.version, self.status_code, self.status_text
        )?;
        for (name, value) in &self.headers {
            write!(f, "\n{}: {}", name, value.to_str().unwrap_or_default())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn istag_length_is_enforced() {
        let long = "A".repeat(MAX_ISTAG_BYTES + 1);
        assert!(Response::no_content().try_set_istag(&long).is_err());
        let ok = "A".repeat(MAX_ISTAG_BYTES);
        let resp = Response::no_content().try_set_istag(&ok).unwrap();
        assert_eq!(
            resp.get_header("ISTag").unwrap(),
            &HeaderValue::from_str(&ok).unwrap()
        );
    }

    #[test]
    fn status_code_round_trip() {
        for code in [100u16, 200, 204, 400, 403, 404, 405, 413, 500, 503, 504] {
            let sc = StatusCode::from_u16(code).unwrap();
            assert_eq!(sc.as_u16(), code);
            assert_eq!(sc.to_string().parse::<StatusCode>().unwrap(), sc);
        }
        assert!(StatusCode::from_u16(418).is_err());
    }
}
