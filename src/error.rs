//! Error handling
//!
//! This module defines:
//! - [`Error`]: the main error type for the gateway.
//! - [`IcapResult<T>`]: a convenient alias for `Result<T, Error>`.
//!
//! It covers network errors, parsing/serialization, configuration issues,
//! backend failures, and protocol-state violations.
use http::header::{InvalidHeaderName, InvalidHeaderValue};
use std::error::Error as StdError;
use std::str::Utf8Error;
use std::time::Duration;
use thiserror::Error;

/// Gateway-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Network-level error (TCP connection, timeout, etc.).
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Peer closed before a full ICAP header block arrived.
    #[error("Peer closed before ICAP headers")]
    EarlyCloseWithoutHeaders,

    /// Failed to parse an ICAP message.
    #[error("ICAP parsing error: {0}")]
    Parse(String),

    /// Failed to parse an embedded HTTP message.
    #[error("HTTP parsing error: {0}")]
    HttpParse(String),

    /// Invalid ICAP status code.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(String),

    /// Invalid ICAP method.
    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    /// Invalid ICAP URI.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Invalid ICAP protocol version.
    #[error("Invalid protocol version: {0}")]
    InvalidVersion(String),

    /// Invalid ISTag header (length/charset).
    #[error("Invalid ISTag: {0}")]
    InvalidISTag(String),

    /// Invalid or malformed header.
    #[error("Header error: {0}")]
    Header(String),

    /// Error while handling the message body.
    #[error("Body error: {0}")]
    Body(String),

    /// Encapsulated body exceeds the configured size cap.
    #[error("Encapsulated body exceeds {max} bytes")]
    BodyTooLarge { max: usize },

    /// Response writer used out of order.
    #[error("Response writer state error: {0}")]
    WriterState(&'static str),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Adaptation backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Transaction deadline fired before the backend returned.
    #[error("Transaction deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// Unexpected/unclassified error.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Create a parsing error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    /// Create an HTTP parsing error.
    pub fn http_parse(message: impl Into<String>) -> Self {
        Self::HttpParse(message.into())
    }

    /// Create a header error.
    pub fn header(message: impl Into<String>) -> Self {
        Self::Header(message.into())
    }

    /// Create a body error.
    pub fn body(message: impl Into<String>) -> Self {
        Self::Body(message.into())
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// True when the failure should be answered with `400 Bad Request`.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            Error::Parse(_)
                | Error::HttpParse(_)
                | Error::InvalidMethod(_)
                | Error::InvalidUri(_)
                | Error::InvalidVersion(_)
                | Error::Header(_)
                | Error::Body(_)
                | Error::BodyTooLarge { .. }
        )
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::Unexpected(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl From<Box<dyn StdError + Send + Sync>> for Error {
    fn from(err: Box<dyn StdError + Send + Sync>) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl From<Utf8Error> for Error {
    fn from(e: Utf8Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<InvalidHeaderName> for Error {
    fn from(e: InvalidHeaderName) -> Self {
        Error::HttpParse(e.to_string())
    }
}

impl From<InvalidHeaderValue> for Error {
    fn from(e: InvalidHeaderValue) -> Self {
        Error::HttpParse(e.to_string())
    }
}

/// Convenient alias for results in the gateway.
pub type IcapResult<T> = Result<T, Error>;
