//! Single-shot ICAP response writer.
//!
//! The writer walks `Fresh -> HeadersCommitted -> Done`. The status line,
//! header block, and `Encapsulated` offsets are committed together in one
//! [`write_status`](ResponseWriter::write_status) call; body bytes are
//! chunk-encoded transparently afterwards. Out-of-order calls surface as
//! [`Error::WriterState`] instead of producing a malformed wire message.

use crate::ICAP_VERSION;
use crate::error::{Error, IcapResult};
use crate::parser::{canon_icap_header, serialize_http_request_head, serialize_http_response_head};
use crate::request::EmbeddedHttp;
use crate::response::StatusCode;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::fmt::Write as _;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Fresh,
    HeadersCommitted { streaming: bool },
    Done,
}

/// Buffered writer for exactly one ICAP response.
pub struct ResponseWriter<W> {
    stream: W,
    headers: HeaderMap,
    state: WriterState,
}

impl<W> ResponseWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(stream: W) -> Self {
        Self {
            stream,
            headers: HeaderMap::new(),
            state: WriterState::Fresh,
        }
    }

    /// Set a header on the pending response, replacing any previous value.
    /// Valid only before the status is committed.
    pub fn set_header(&mut self, name: &str, value: &str) -> IcapResult<()> {
        if self.state != WriterState::Fresh {
            return Err(Error::WriterState("header set after status commit"));
        }
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Append a header, keeping existing values under the same name.
    pub fn append_header(&mut self, name: &str, value: &str) -> IcapResult<()> {
        if self.state != WriterState::Fresh {
            return Err(Error::WriterState("header set after status commit"));
        }
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Merge backend-supplied headers into the pending block. Backend
    /// values override existing ones, except the response identity
    /// headers `ISTag` and `Service`, which are never touched.
    pub fn merge_backend_headers(&mut self, extra: &HeaderMap) -> IcapResult<()> {
        if self.state != WriterState::Fresh {
            return Err(Error::WriterState("header set after status commit"));
        }
        let mut replaced: std::collections::HashSet<HeaderName> = std::collections::HashSet::new();
        for (name, value) in extra.iter() {
            if name == "istag" || name == "service" {
                continue;
            }
            if replaced.insert(name.clone()) {
                self.headers.insert(name.clone(), value.clone());
            } else {
                self.headers.append(name.clone(), value.clone());
            }
        }
        Ok(())
    }

    /// Current pending header value, if set.
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// True once the status line has been committed.
    pub fn committed(&self) -> bool {
        self.state != WriterState::Fresh
    }

    /// Emit a provisional `100 Continue` to request the rest of a preview.
    /// Does not commit the final status.
    pub async fn write_continue(&mut self) -> IcapResult<()> {
        if self.state != WriterState::Fresh {
            return Err(Error::WriterState("100 Continue after status commit"));
        }
        self.stream
            .write_all(format!("{ICAP_VERSION} 100 Continue\r\n\r\n").as_bytes())
            .await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Commit the status line, header block, and `Encapsulated` offsets.
    ///
    /// `encapsulated` supplies the HTTP message head to embed; `has_body`
    /// declares whether chunked body bytes will follow via
    /// [`write_body`](Self::write_body). Must be called exactly once.
    pub async fn write_status(
        &mut self,
        status: StatusCode,
        encapsulated: Option<&EmbeddedHttp>,
        has_body: bool,
    ) -> IcapResult<()> {
        if self.state != WriterState::Fresh {
            return Err(Error::WriterState("status line already committed"));
        }

        let embedded_head = encapsulated.map(|e| match e {
            EmbeddedHttp::Req(r) => serialize_http_request_head(r),
            EmbeddedHttp::Resp(r) => serialize_http_response_head(r),
        });

        let enc_value = match (encapsulated, &embedded_head, has_body) {
            (None, _, false) => "null-body=0".to_string(),
            (None, _, true) => "opt-body=0".to_string(),
            (Some(EmbeddedHttp::Req(_)), Some(head), false) => {
                format!("req-hdr=0, null-body={}", head.len())
            }
            (Some(EmbeddedHttp::Req(_)), Some(head), true) => {
                format!("req-hdr=0, req-body={}", head.len())
            }
            (Some(EmbeddedHttp::Resp(_)), Some(head), false) => {
                format!("res-hdr=0, null-body={}", head.len())
            }
            (Some(EmbeddedHttp::Resp(_)), Some(head), true) => {
                format!("res-hdr=0, res-body={}", head.len())
            }
            (Some(_), None, _) => unreachable!("embedded head serialized above"),
        };
        self.headers
            .insert("encapsulated", HeaderValue::from_str(&enc_value)?);

        let mut head = String::new();
        write!(
            &mut head,
            "{ICAP_VERSION} {} {}\r\n",
            status,
            status.reason()
        )
        .unwrap();
        for (name, value) in self.headers.iter() {
            write!(
                &mut head,
                "{}: {}\r\n",
                canon_icap_header(name.as_str()),
                value.to_str().unwrap_or_default()
            )
            .unwrap();
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        if let Some(embedded_head) = embedded_head {
            out.extend_from_slice(&embedded_head);
        }
        self.stream.write_all(&out).await?;

        self.state = WriterState::HeadersCommitted {
            streaming: has_body,
        };
        Ok(())
    }

    /// Stream body bytes as one chunk. Valid only after a `has_body=true`
    /// commit and before [`close`](Self::close).
    pub async fn write_body(&mut self, data: &[u8]) -> IcapResult<()> {
        match self.state {
            WriterState::HeadersCommitted { streaming: true } => {
                if !data.is_empty() {
                    crate::parser::wire::write_chunk(&mut self.stream, data).await?;
                }
                Ok(())
            }
            WriterState::Fresh => Err(Error::WriterState("body before status commit")),
            WriterState::HeadersCommitted { streaming: false } => {
                Err(Error::WriterState("body on a bodyless response"))
            }
            WriterState::Done => Err(Error::WriterState("body after close")),
        }
    }

    /// Flush the terminator chunk (when streaming) and finish. Idempotent.
    pub async fn close(&mut self) -> IcapResult<()> {
        match self.state {
            WriterState::Fresh => Err(Error::WriterState("close before status commit")),
            WriterState::HeadersCommitted { streaming } => {
                if streaming {
                    self.stream.write_all(b"0\r\n\r\n").await?;
                }
                self.stream.flush().await?;
                self.state = WriterState::Done;
                Ok(())
            }
            WriterState::Done => Ok(()),
        }
    }
}
