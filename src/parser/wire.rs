//! ICAP chunked-transfer primitives.
//!
//! Encapsulated bodies are chunk-encoded on the wire (RFC 3507 reuses the
//! HTTP/1.1 chunk syntax, plus the `ieof` extension on the zero chunk that
//! ends a preview). This module parses single chunks out of a buffer,
//! dechunks complete in-memory bodies, reads a chunked stream off a socket
//! to its terminator, and emits chunks.

use crate::error::{Error, IcapResult};
use std::io::Write;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a chunk size line (hex digits + extension).
const MAX_CHUNK_LINE: usize = 1024;

/// One parsed chunk framing record.
#[derive(Debug, Clone, Copy)]
pub struct ChunkInfo {
    /// Position just past this chunk (for the zero chunk: past the size-line
    /// CRLF; the trailing CRLF is still outstanding).
    pub next: usize,
    /// Payload size in bytes.
    pub size: usize,
    /// This is the terminating zero chunk.
    pub last: bool,
    /// The zero chunk carried the `ieof` extension.
    pub ieof: bool,
}

/// Parse a single chunk starting at `from`. Returns `None` when the buffer
/// does not yet hold the complete chunk.
pub fn parse_one_chunk(buf: &[u8], from: usize) -> Option<ChunkInfo> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            let size_line = &buf[from..i];
            let mut parts = size_line.splitn(2, |&b| b == b';');
            let size_hex = parts.next().unwrap_or(size_line);
            let ext = parts.next().unwrap_or(b"");
            let size_str = std::str::from_utf8(size_hex).ok()?.trim();
            let size = usize::from_str_radix(size_str, 16).ok()?;
            let after_size = i + 2;
            if size == 0 {
                let ieof = std::str::from_utf8(ext)
                    .map(|e| e.trim().eq_ignore_ascii_case("ieof"))
                    .unwrap_or(false);
                return Some(ChunkInfo {
                    next: after_size,
                    size: 0,
                    last: true,
                    ieof,
                });
            }
            let need = after_size + size + 2;
            if buf.len() < need {
                return None;
            }
            return Some(ChunkInfo {
                next: need,
                size,
                last: false,
                ieof: false,
            });
        }
        i += 1;
    }
    None
}

/// A fully dechunked body.
#[derive(Debug)]
pub struct DechunkedBody {
    /// Concatenated payload bytes.
    pub data: Vec<u8>,
    /// Terminator was `0; ieof` (stream ended within the preview).
    pub ieof: bool,
    /// Bytes of `raw` consumed through the final CRLF.
    pub consumed: usize,
}

/// Dechunk a complete in-memory chunked stream.
///
/// `max` caps the dechunked payload size.
pub fn dechunk(raw: &[u8], max: Option<usize>) -> IcapResult<DechunkedBody> {
    let mut data = Vec::new();
    let mut pos = 0usize;
    loop {
        let chunk = parse_one_chunk(raw, pos)
            .ok_or_else(|| Error::body("incomplete ICAP chunked body"))?;
        if chunk.last {
            if raw.len() < chunk.next + 2 {
                return Err(Error::body("missing chunked terminator"));
            }
            if &raw[chunk.next..chunk.next + 2] != b"\r\n" {
                return Err(Error::body("invalid chunked terminator"));
            }
            return Ok(DechunkedBody {
                data,
                ieof: chunk.ieof,
                consumed: chunk.next + 2,
            });
        }
        let payload_start = chunk.next - chunk.size - 2;
        data.extend_from_slice(&raw[payload_start..payload_start + chunk.size]);
        if let Some(max) = max {
            if data.len() > max {
                return Err(Error::BodyTooLarge { max });
            }
        }
        pos = chunk.next;
    }
}

/// Peek at the declared size of the chunk starting at `from`, if its size
/// line is already buffered.
fn peek_chunk_size(buf: &[u8], from: usize) -> Option<usize> {
    let line_end = buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)?;
    let size_line = &buf[from..line_end];
    let size_hex = size_line.split(|&b| b == b';').next().unwrap_or(size_line);
    let size_str = std::str::from_utf8(size_hex).ok()?.trim();
    usize::from_str_radix(size_str, 16).ok()
}

/// Read a chunked body from `stream` (already partially buffered in `buf`
/// starting at `pos`) until the terminating zero chunk.
///
/// Returns the position just past the final CRLF. When `cap` is exceeded
/// the remainder of the stream is drained without being retained and
/// [`Error::BodyTooLarge`] is returned; `buf` contents past `pos` are
/// unspecified in that case.
pub async fn read_chunked_to_end<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    mut pos: usize,
    cap: Option<usize>,
) -> IcapResult<usize>
where
    S: AsyncRead + Unpin,
{
    let mut dechunked = 0usize;
    loop {
        match parse_one_chunk(buf, pos) {
            Some(chunk) if chunk.last => {
                while buf.len() < chunk.next + 2 {
                    let mut tmp = [0u8; 4096];
                    let n = stream.read(&mut tmp).await?;
                    if n == 0 {
                        return Err(Error::body("unexpected EOF after zero chunk"));
                    }
                    buf.extend_from_slice(&tmp[..n]);
                }
                if &buf[chunk.next..chunk.next + 2] != b"\r\n" {
                    return Err(Error::body("invalid chunked terminator"));
                }
                return Ok(chunk.next + 2);
            }
            Some(chunk) => {
                dechunked += chunk.size;
                if let Some(max) = cap {
                    if dechunked > max {
                        let carry = buf.split_off(chunk.next);
                        drain_chunked(stream, carry).await?;
                        return Err(Error::BodyTooLarge { max });
                    }
                }
                pos = chunk.next;
            }
            None => {
                // Refuse to buffer a single chunk that would already
                // breach the cap; skip its payload instead.
                if let (Some(max), Some(size)) = (cap, peek_chunk_size(buf, pos)) {
                    if dechunked + size > max {
                        let carry = buf.split_off(pos);
                        drain_chunked(stream, carry).await?;
                        return Err(Error::BodyTooLarge { max });
                    }
                }
                let mut tmp = [0u8; 4096];
                let n = stream.read(&mut tmp).await?;
                if n == 0 {
                    return Err(Error::body("unexpected EOF while reading ICAP chunked body"));
                }
                buf.extend_from_slice(&tmp[..n]);
            }
        }
    }
}

/// Consume a chunked stream through its terminator without retaining
/// payload bytes. `carry` must start at a chunk size line.
async fn drain_chunked<S>(stream: &mut S, mut carry: Vec<u8>) -> IcapResult<()>
where
    S: AsyncRead + Unpin,
{
    let mut tmp = [0u8; 8192];
    loop {
        let line_end = loop {
            if let Some(i) = carry.windows(2).position(|w| w == b"\r\n") {
                break i;
            }
            if carry.len() > MAX_CHUNK_LINE {
                return Err(Error::body("chunk size line too long"));
            }
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                return Err(Error::body("unexpected EOF while draining chunked body"));
            }
            carry.extend_from_slice(&tmp[..n]);
        };
        let size = {
            let size_line = &carry[..line_end];
            let size_hex = size_line.split(|&b| b == b';').next().unwrap_or(size_line);
            let size_str = std::str::from_utf8(size_hex)
                .map_err(|_| Error::body("invalid chunk size line"))?;
            usize::from_str_radix(size_str.trim(), 16)
                .map_err(|_| Error::body("invalid chunk size"))?
        };
        carry.drain(..line_end + 2);
        if size == 0 {
            while carry.len() < 2 {
                let n = stream.read(&mut tmp).await?;
                if n == 0 {
                    return Err(Error::body("unexpected EOF before chunked terminator"));
                }
                carry.extend_from_slice(&tmp[..n]);
            }
            if &carry[..2] != b"\r\n" {
                return Err(Error::body("invalid chunked terminator"));
            }
            return Ok(());
        }
        let mut remaining = size + 2;
        while remaining > 0 {
            if carry.is_empty() {
                let n = stream.read(&mut tmp).await?;
                if n == 0 {
                    return Err(Error::body("unexpected EOF while draining chunk payload"));
                }
                carry.extend_from_slice(&tmp[..n]);
            }
            let take = carry.len().min(remaining);
            carry.drain(..take);
            remaining -= take;
        }
    }
}

/// Write one chunk to a socket.
pub async fn write_chunk<S>(stream: &mut S, data: &[u8]) -> IcapResult<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(16 + data.len() + 2);
    write!(&mut buf, "{:X}\r\n", data.len())?;
    if !data.is_empty() {
        buf.extend_from_slice(data);
    }
    buf.extend_from_slice(b"\r\n");
    stream.write_all(&buf).await?;
    Ok(())
}

/// Write one chunk into an already-assembled buffer.
pub fn write_chunk_into(out: &mut Vec<u8>, data: &[u8]) {
    write!(out, "{:X}\r\n", data.len()).unwrap();
    if !data.is_empty() {
        out.extend_from_slice(data);
    }
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_and_zero_chunks() {
        let raw = b"4\r\nwiki\r\n0\r\n\r\n";
        let c = parse_one_chunk(raw, 0).unwrap();
        assert!(!c.last);
        assert_eq!(c.size, 4);
        let z = parse_one_chunk(raw, c.next).unwrap();
        assert!(z.last);
        assert!(!z.ieof);
    }

    #[test]
    fn zero_chunk_ieof_extension() {
        let raw = b"0; ieof\r\n\r\n";
        let z = parse_one_chunk(raw, 0).unwrap();
        assert!(z.last);
        assert!(z.ieof);
    }

    #[test]
    fn dechunk_concatenates_payloads() {
        let raw = b"4\r\nabcd\r\n2\r\nef\r\n0\r\n\r\n";
        let body = dechunk(raw, None).unwrap();
        assert_eq!(body.data, b"abcdef");
        assert!(!body.ieof);
        assert_eq!(body.consumed, raw.len());
    }

    #[test]
    fn dechunk_enforces_cap() {
        let raw = b"6\r\nabcdef\r\n0\r\n\r\n";
        let err = dechunk(raw, Some(4)).unwrap_err();
        assert!(matches!(err, Error::BodyTooLarge { max: 4 }));
    }

    #[test]
    fn dechunk_rejects_missing_terminator() {
        let raw = b"4\r\nabcd\r\n0\r\n";
        assert!(dechunk(raw, None).is_err());
    }

    #[test]
    fn chunk_writer_emits_hex_framing() {
        let mut out = Vec::new();
        write_chunk_into(&mut out, b"abcdef");
        write_chunk_into(&mut out, b"");
        assert_eq!(out, b"6\r\nabcdef\r\n0\r\n\r\n");
    }
}
