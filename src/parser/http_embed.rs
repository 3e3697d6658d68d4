//! Parsing and serialization of HTTP messages embedded in ICAP bodies.

use crate::error::{Error, IcapResult};
use http::{
    HeaderMap, HeaderName, HeaderValue, Request as HttpRequest, Response as HttpResponse,
    StatusCode as HttpStatus, Version,
};
use std::fmt::Write as _;

pub(crate) fn http_version_str(v: Version) -> &'static str {
    match v {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn parse_http_version(s: &str) -> Version {
    match s {
        "HTTP/0.9" => Version::HTTP_09,
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/2.0" | "HTTP/2" => Version::HTTP_2,
        "HTTP/3.0" | "HTTP/3" => Version::HTTP_3,
        _ => Version::HTTP_11,
    }
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> IcapResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let colon = line
            .find(':')
            .ok_or_else(|| Error::http_parse(format!("malformed header line '{line}'")))?;
        let name = HeaderName::from_bytes(line[..colon].trim().as_bytes())?;
        let value = HeaderValue::from_str(line[colon + 1..].trim())?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Parse an embedded HTTP request head and attach `body`.
pub fn parse_http_request(head: &[u8], body: Vec<u8>) -> IcapResult<HttpRequest<Vec<u8>>> {
    let head_str = std::str::from_utf8(head).map_err(|e| Error::http_parse(e.to_string()))?;
    let mut lines = head_str.split("\r\n");
    let start = lines
        .next()
        .ok_or_else(|| Error::http_parse("empty HTTP request head"))?;
    let mut parts = start.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::http_parse("missing HTTP method"))?;
    let uri = parts
        .next()
        .ok_or_else(|| Error::http_parse("missing HTTP request URI"))?;
    let version = parts.next().unwrap_or("HTTP/1.1");

    let headers = parse_header_lines(lines)?;
    let mut builder = HttpRequest::builder()
        .method(method)
        .uri(uri)
        .version(parse_http_version(version));
    if let Some(h) = builder.headers_mut() {
        h.extend(headers);
    }
    builder
        .body(body)
        .map_err(|e| Error::http_parse(format!("build http::Request: {e}")))
}

/// Parse an embedded HTTP response head and attach `body`.
pub fn parse_http_response(head: &[u8], body: Vec<u8>) -> IcapResult<HttpResponse<Vec<u8>>> {
    let head_str = std::str::from_utf8(head).map_err(|e| Error::http_parse(e.to_string()))?;
    let mut lines = head_str.split("\r\n");
    let start = lines
        .next()
        .ok_or_else(|| Error::http_parse("empty HTTP response head"))?;
    let mut parts = start.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| Error::http_parse("missing HTTP version"))?;
    let code = parts
        .next()
        .ok_or_else(|| Error::http_parse("missing HTTP status code"))?
        .parse::<u16>()
        .map_err(|_| Error::http_parse("invalid HTTP status code"))?;

    let headers = parse_header_lines(lines)?;
    let mut builder = HttpResponse::builder()
        .status(HttpStatus::from_u16(code).map_err(|e| Error::http_parse(e.to_string()))?)
        .version(parse_http_version(version));
    if let Some(h) = builder.headers_mut() {
        h.extend(headers);
    }
    builder
        .body(body)
        .map_err(|e| Error::http_parse(format!("build http::Response: {e}")))
}

/// Serialize an HTTP request head (start line + headers + CRLFCRLF).
pub fn serialize_http_request_head(req: &HttpRequest<Vec<u8>>) -> Vec<u8> {
    let mut out = String::new();
    write!(
        &mut out,
        "{} {} {}\r\n",
        req.method(),
        req.uri(),
        http_version_str(req.version())
    )
    .unwrap();
    for (name, value) in req.headers().iter() {
        write!(
            &mut out,
            "{}: {}\r\n",
            name.as_str(),
            value.to_str().unwrap_or_default()
        )
        .unwrap();
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Serialize an HTTP response head (status line + headers + CRLFCRLF).
pub fn serialize_http_response_head(resp: &HttpResponse<Vec<u8>>) -> Vec<u8> {
    let mut out = String::new();
    let code: HttpStatus = resp.status();
    write!(
        &mut out,
        "{} {} {}\r\n",
        http_version_str(resp.version()),
        code.as_u16(),
        code.canonical_reason().unwrap_or("")
    )
    .unwrap();
    for (name, value) in resp.headers().iter() {
        write!(
            &mut out,
            "{}: {}\r\n",
            name.as_str(),
            value.to_str().unwrap_or_default()
        )
        .unwrap();
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Rebuild a clone of an `http::Request` (the type itself is not `Clone`).
pub fn clone_http_request(req: &HttpRequest<Vec<u8>>) -> HttpRequest<Vec<u8>> {
    let mut builder = HttpRequest::builder()
        .method(req.method().clone())
        .uri(req.uri().clone())
        .version(req.version());
    if let Some(h) = builder.headers_mut() {
        *h = req.headers().clone();
    }
    builder
        .body(req.body().clone())
        .expect("rebuilding a parsed request cannot fail")
}

/// Rebuild a clone of an `http::Response`.
pub fn clone_http_response(resp: &HttpResponse<Vec<u8>>) -> HttpResponse<Vec<u8>> {
    let mut builder = HttpResponse::builder()
        .status(resp.status())
        .version(resp.version());
    if let Some(h) = builder.headers_mut() {
        *h = resp.headers().clone();
    }
    builder
        .body(resp.body().clone())
        .expect("rebuilding a parsed response cannot fail")
}
