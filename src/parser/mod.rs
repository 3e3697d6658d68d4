//! ICAP wire codec.
//!
//! Converts bytes to [`Request`]/[`Response`] and back per RFC 3507:
//! request/status line, header block, `Encapsulated` offsets, and the
//! chunk-encoded encapsulated body.

pub mod http_embed;
pub mod wire;

pub use http_embed::{
    clone_http_request, clone_http_response, parse_http_request, parse_http_response,
    serialize_http_request_head, serialize_http_response_head,
};
pub use wire::{ChunkInfo, dechunk, parse_one_chunk, read_chunked_to_end, write_chunk_into};

use crate::ICAP_VERSION;
use crate::error::{Error, IcapResult};
use crate::request::{Method, Request};
use crate::response::{MAX_ISTAG_BYTES, Response, StatusCode};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::borrow::Cow;
use std::fmt::Write as _;
use tracing::{debug, trace};

/// Find end of an ICAP header block (position after CRLFCRLF).
#[inline]
pub fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// The single body part an `Encapsulated` list may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    ReqBody,
    ResBody,
    OptBody,
    NullBody,
}

impl BodyKind {
    /// Whether chunked body bytes follow on the wire.
    pub fn has_payload(&self) -> bool {
        !matches!(self, BodyKind::NullBody)
    }
}

/// Offsets parsed from the `Encapsulated` header.
///
/// Offsets are relative to the start of the encapsulated area
/// (immediately after the ICAP headers CRLFCRLF).
#[derive(Debug, Clone, Copy, Default)]
pub struct Encapsulated {
    pub req_hdr: Option<usize>,
    pub res_hdr: Option<usize>,
    pub body: Option<(BodyKind, usize)>,
}

/// Parse an `Encapsulated` header value into validated offsets.
///
/// Enforces: known part names, parseable offsets, non-decreasing order,
/// at most one of each header part, exactly one body part listed last.
pub fn parse_encapsulated(value: &str) -> IcapResult<Encapsulated> {
    let mut enc = Encapsulated::default();
    let mut last_offset = 0usize;
    let mut seen_any = false;
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(Error::header("empty Encapsulated part"));
        }
        let (key, off_str) = part
            .split_once('=')
            .ok_or_else(|| Error::header(format!("invalid Encapsulated part '{part}'")))?;
        let off = off_str.trim().parse::<usize>().map_err(|_| {
            Error::header(format!("invalid Encapsulated offset '{}'", off_str.trim()))
        })?;
        if seen_any && off < last_offset {
            return Err(Error::header(format!(
                "Encapsulated offsets must be non-decreasing (offset {off} after {last_offset})"
            )));
        }
        seen_any = true;
        last_offset = off;
        if enc.body.is_some() {
            return Err(Error::header(
                "Encapsulated body part must be the final entry",
            ));
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "req-hdr" => {
                if enc.req_hdr.replace(off).is_some() {
                    return Err(Error::header("duplicate req-hdr in Encapsulated"));
                }
            }
            "res-hdr" => {
                if enc.res_hdr.replace(off).is_some() {
                    return Err(Error::header("duplicate res-hdr in Encapsulated"));
                }
            }
            "req-body" => enc.body = Some((BodyKind::ReqBody, off)),
            "res-body" => enc.body = Some((BodyKind::ResBody, off)),
            "opt-body" => enc.body = Some((BodyKind::OptBody, off)),
            "null-body" => enc.body = Some((BodyKind::NullBody, off)),
            other => {
                return Err(Error::header(format!(
                    "invalid Encapsulated part '{other}'"
                )));
            }
        }
    }
    if !seen_any {
        return Err(Error::header("empty Encapsulated header"));
    }
    Ok(enc)
}

/// Pre-parse the `Encapsulated` header out of a raw header block, before
/// the full message is materialized. Used by the connection read loop to
/// decide whether chunked body bytes follow.
///
/// Duplicate `Encapsulated` lines are a protocol error.
pub fn parse_encapsulated_header(headers_text: &str) -> IcapResult<Option<Encapsulated>> {
    let mut found: Option<Encapsulated> = None;
    for line in headers_text.lines() {
        let Some((name, val)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("Encapsulated") {
            continue;
        }
        if found.is_some() {
            return Err(Error::header("duplicate Encapsulated header"));
        }
        found = Some(parse_encapsulated(val)?);
    }
    Ok(found)
}

fn parse_icap_header_block<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> IcapResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let colon = line
            .find(':')
            .ok_or_else(|| Error::parse(format!("malformed ICAP header line '{line}'")))?;
        let name = HeaderName::from_bytes(line[..colon].trim().as_bytes())?;
        let value = HeaderValue::from_str(line[colon + 1..].trim())?;
        headers.append(name, value);
    }
    if headers.get_all("encapsulated").iter().count() > 1 {
        return Err(Error::header("duplicate Encapsulated header"));
    }
    Ok(headers)
}

fn allow_header_contains(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all("allow")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|s| s.split(',').any(|p| p.trim() == token))
}

/// Parse a complete ICAP request (head plus fully-read encapsulated area).
///
/// `max_body` caps the dechunked body size; breaching it yields
/// [`Error::BodyTooLarge`].
pub fn parse_icap_request(data: &[u8], max_body: Option<usize>) -> IcapResult<Request> {
    trace!(len = data.len(), "parse_icap_request");
    let hdr_end =
        find_double_crlf(data).ok_or_else(|| Error::parse("ICAP request headers not complete"))?;
    let head_str = std::str::from_utf8(&data[..hdr_end])?;

    let mut lines = head_str.split("\r\n");
    let request_line = lines.next().ok_or_else(|| Error::parse("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method_tok = parts
        .next()
        .ok_or_else(|| Error::parse("invalid ICAP request line"))?;
    let uri = parts
        .next()
        .ok_or_else(|| Error::parse("invalid ICAP request line"))?
        .to_string();
    let version = parts
        .next()
        .ok_or_else(|| Error::parse("invalid ICAP request line"))?;
    if parts.next().is_some() {
        return Err(Error::parse("invalid ICAP request line"));
    }
    if version != ICAP_VERSION {
        return Err(Error::InvalidVersion(version.to_string()));
    }
    let method: Method = method_tok.parse()?;
    debug!(%method, %uri, "parse_icap_request");

    let icap_headers = parse_icap_header_block(lines)?;

    let allow_204 = allow_header_contains(&icap_headers, "204");
    let preview_size = match icap_headers.get("preview") {
        Some(v) => Some(
            v.to_str()
                .map_err(|_| Error::header("invalid Preview header"))?
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::header("invalid Preview header"))?,
        ),
        None => None,
    };

    let enc = match icap_headers.get("encapsulated") {
        Some(v) => Some(parse_encapsulated(
            v.to_str().map_err(|_| Error::header("invalid Encapsulated header"))?,
        )?),
        None => None,
    };
    if enc.is_none() && method != Method::Options {
        return Err(Error::header("missing Encapsulated header"));
    }

    let area = &data[hdr_end..];
    let mut http_request = None;
    let mut http_response = None;
    let mut preview_ieof = false;
    let mut has_payload = false;

    if let Some(enc) = &enc {
        for off in [
            enc.req_hdr,
            enc.res_hdr,
            enc.body.map(|(_, o)| o),
        ]
        .into_iter()
        .flatten()
        {
            if off > area.len() {
                return Err(Error::header(format!(
                    "Encapsulated offset {off} beyond encapsulated block ({} bytes)",
                    area.len()
                )));
            }
        }

        // Part extents: each head runs to the next declared offset.
        let body_off = enc.body.map(|(_, o)| o);
        let req_hdr_end = enc.res_hdr.or(body_off).unwrap_or(area.len());
        let res_hdr_end = body_off.unwrap_or(area.len());

        let mut body_data = Vec::new();
        let mut body_kind = None;
        if let Some((kind, off)) = enc.body {
            if kind.has_payload() {
                let raw = &area[off..];
                if raw.is_empty() {
                    return Err(Error::body("missing encapsulated body chunks"));
                }
                let dechunked = wire::dechunk(raw, max_body)?;
                preview_ieof = dechunked.ieof;
                body_data = dechunked.data;
                body_kind = Some(kind);
                has_payload = true;
            }
        }

        if let Some(off) = enc.req_hdr {
            let head = &area[off..req_hdr_end];
            let body = if body_kind == Some(BodyKind::ReqBody) {
                std::mem::take(&mut body_data)
            } else {
                Vec::new()
            };
            http_request = Some(parse_http_request(head, body)?);
        }
        if let Some(off) = enc.res_hdr {
            let head = &area[off..res_hdr_end];
            let body = if body_kind == Some(BodyKind::ResBody) {
                std::mem::take(&mut body_data)
            } else {
                Vec::new()
            };
            http_response = Some(parse_http_response(head, body)?);
        }
        match body_kind {
            Some(BodyKind::ReqBody) if http_request.is_none() => {
                return Err(Error::header("req-body without req-hdr"));
            }
            Some(BodyKind::ResBody) if http_response.is_none() => {
                return Err(Error::header("res-body without res-hdr"));
            }
            Some(BodyKind::OptBody) => {
                return Err(Error::header("opt-body is not valid in a request"));
            }
            _ => {}
        }
    } else if !area.is_empty() {
        return Err(Error::header("missing Encapsulated header"));
    }

    let is_preview = preview_size.is_some() && has_payload;

    Ok(Request {
        method,
        uri,
        icap_headers,
        http_request,
        http_response,
        preview_size,
        is_preview,
        preview_ieof,
        allow_204,
    })
}

/// Parse an ICAP response from wire bytes, enforcing RFC invariants
/// (version, ISTag, `Encapsulated` shape, 204 body rules).
pub fn parse_icap_response(raw: &[u8]) -> IcapResult<Response> {
    trace!(len = raw.len(), "parse_icap_response");
    if raw.is_empty() {
        return Err(Error::parse("empty response"));
    }

    let hdr_end =
        find_double_crlf(raw).ok_or_else(|| Error::parse("ICAP response headers not complete"))?;
    let head_str = std::str::from_utf8(&raw[..hdr_end])?;
    let mut lines = head_str.split("\r\n");

    let status_line = lines.next().ok_or_else(|| Error::parse("empty response"))?;
    let parts: Vec<&str> = status_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(Error::parse("invalid status line format"));
    }
    if parts[0] != ICAP_VERSION {
        return Err(Error::InvalidVersion(parts[0].to_string()));
    }
    let status_code: StatusCode = parts[1].parse()?;
    let status_text = parts[2..].join(" ");
    debug!(%status_code, %status_text, "parse_icap_response");

    let headers = parse_icap_header_block(lines)?;

    if status_code != StatusCode::Continue100 {
        match headers.get("istag") {
            None => return Err(Error::InvalidISTag("missing ISTag header".to_string())),
            Some(v) if v.as_bytes().len() > MAX_ISTAG_BYTES => {
                return Err(Error::InvalidISTag(format!(
                    "ISTag exceeds {MAX_ISTAG_BYTES} bytes"
                )));
            }
            Some(_) => {}
        }
    }

    let enc = match headers.get("encapsulated") {
        Some(v) => Some(parse_encapsulated(
            v.to_str().map_err(|_| Error::header("invalid Encapsulated header"))?,
        )?),
        None if status_code != StatusCode::Continue100 => {
            return Err(Error::header("missing Encapsulated header"));
        }
        None => None,
    };

    let body = raw[hdr_end..].to_vec();

    if let Some(enc) = &enc {
        for off in [enc.req_hdr, enc.res_hdr].into_iter().flatten() {
            if off > body.len() {
                return Err(Error::header(format!(
                    "Encapsulated offset {off} beyond encapsulated block ({} bytes)",
                    body.len()
                )));
            }
        }
    }

    if status_code == StatusCode::NoContent204 {
        let null_body = enc
            .as_ref()
            .and_then(|e| e.body)
            .map(|(kind, _)| kind == BodyKind::NullBody)
            .unwrap_or(false);
        if !null_body {
            return Err(Error::header(
                "204 requires Encapsulated: null-body",
            ));
        }
        if !body.is_empty() {
            return Err(Error::body(
                "204 response must not carry body bytes (null-body only)",
            ));
        }
    }

    Ok(Response {
        version: parts[0].to_string(),
        status_code,
        status_text,
        headers,
        body,
    })
}

/// Serialize an ICAP response: status line, canonically-cased headers,
/// then the raw encapsulated block verbatim.
pub fn serialize_icap_response(resp: &Response) -> IcapResult<Vec<u8>> {
    let mut head = String::new();
    write!(
        &mut head,
        "{} {} {}\r\n",
        resp.version, resp.status_code, resp.status_text
    )
    .unwrap();

    for (name, value) in resp.headers.iter() {
        let canon = canon_icap_header(name.as_str());
        write!(
            &mut head,
            "{}: {}\r\n",
            canon,
            value.to_str().unwrap_or_default()
        )
        .unwrap();
    }
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(&resp.body);
    Ok(out)
}

/// Return canonical ICAP header name (title-cased, with special-cases).
/// Input should be lowercased (`http::HeaderName::as_str()` already is).
pub fn canon_icap_header(name: &str) -> Cow<'_, str> {
    match name {
        "methods" => Cow::Borrowed("Methods"),
        "istag" => Cow::Borrowed("ISTag"),
        "encapsulated" => Cow::Borrowed("Encapsulated"),
        "service" => Cow::Borrowed("Service"),
        "max-connections" => Cow::Borrowed("Max-Connections"),
        "options-ttl" => Cow::Borrowed("Options-TTL"),
        "preview" => Cow::Borrowed("Preview"),
        "allow" => Cow::Borrowed("Allow"),
        "service-id" => Cow::Borrowed("Service-ID"),
        "opt-body-type" => Cow::Borrowed("Opt-body-type"),
        "transfer-preview" => Cow::Borrowed("Transfer-Preview"),
        "transfer-ignore" => Cow::Borrowed("Transfer-Ignore"),
        "transfer-complete" => Cow::Borrowed("Transfer-Complete"),
        "date" => Cow::Borrowed("Date"),
        "server" => Cow::Borrowed("Server"),
        "connection" => Cow::Borrowed("Connection"),
        "content-length" => Cow::Borrowed("Content-Length"),
        "content-type" => Cow::Borrowed("Content-Type"),
        // Fallback: Title-Case each hyphen-separated token.
        _ => {
            let mut out = String::with_capacity(name.len());
            for (i, seg) in name.split('-').enumerate() {
                if i > 0 {
                    out.push('-');
                }
                let mut chars = seg.chars();
                if let Some(c0) = chars.next() {
                    out.extend(c0.to_uppercase());
                    for c in chars {
                        out.extend(c.to_lowercase());
                    }
                }
            }
            Cow::Owned(out)
        }
    }
}
