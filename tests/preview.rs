//! Preview negotiation: `0; ieof` fast answers, `100 Continue`
//! continuation, and the body size cap.

use icap_gateway::parser::{find_double_crlf, wire};
use icap_gateway::{Config, FnBackend, Method, Server, Verdict};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CFG: &str = r#"
    [app]
    preview_bytes = "2048"
    max_filesize = 64
    services = ["scan"]

    [scan]
    vendor = "test"
    service_tag = "it-scan-1.0"
    service_caption = "preview scan"
    req_mode = true
"#;

async fn start_gateway() -> SocketAddr {
    let config = Config::from_toml(CFG).expect("test config");
    let server = Server::builder()
        .config(config)
        .bind("127.0.0.1:0")
        .backend(
            "test",
            "scan",
            Method::ReqMod,
            FnBackend::new(|_input| async { Ok(Verdict::no_modification()) }),
        )
        .build()
        .await
        .expect("build server");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    addr
}

fn icap_status(buf: &[u8]) -> Option<u16> {
    let line_end = buf.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&buf[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("ICAP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

async fn read_until_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if find_double_crlf(&buf).is_some() {
                break;
            }
            let n = stream.read(&mut tmp).await.expect("read");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&tmp[..n]);
        }
    })
    .await
    .expect("timed out waiting for ICAP head");
    buf
}

async fn read_until_terminator(stream: &mut TcpStream, buf: &mut Vec<u8>) {
    let mut tmp = [0u8; 8192];
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let h_end = match find_double_crlf(buf) {
                Some(end) => end,
                None => 0,
            };
            if h_end > 0 && buf[h_end..].windows(5).any(|w| w == b"0\r\n\r\n") {
                break;
            }
            let n = stream.read(&mut tmp).await.expect("read");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&tmp[..n]);
        }
    })
    .await
    .expect("timed out waiting for full response");
}

fn preview_request(addr: SocketAddr, preview_len: usize, http_head: &str) -> Vec<u8> {
    format!(
        "REQMOD icap://{addr}/scan ICAP/1.0\r\n\
         Host: {addr}\r\n\
         Encapsulated: req-hdr=0, req-body={}\r\n\
         Preview: {preview_len}\r\n\
         \r\n",
        http_head.len()
    )
    .into_bytes()
}

fn chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:X}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

#[tokio::test]
async fn preview_ieof_is_answered_without_continuation() {
    let addr = start_gateway().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let body = b"ping";
    let http_head = format!(
        "POST /upload HTTP/1.1\r\nhost: example.com\r\ncontent-length: {}\r\n\r\n",
        body.len()
    );

    let mut wire_bytes = preview_request(addr, body.len(), &http_head);
    wire_bytes.extend_from_slice(http_head.as_bytes());
    wire_bytes.extend_from_slice(&chunk(body));
    wire_bytes.extend_from_slice(b"0; ieof\r\n\r\n");
    stream.write_all(&wire_bytes).await.expect("write");

    let resp = read_until_head(&mut stream).await;
    // Inside preview, 204 is legal even without Allow: 204.
    assert_eq!(icap_status(&resp), Some(204));
}

#[tokio::test]
async fn non_ieof_preview_triggers_100_continue_then_full_echo() {
    let addr = start_gateway().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let preview = b"abcd";
    let tail = b"efghij";
    let total: Vec<u8> = [preview.as_ref(), tail.as_ref()].concat();
    let http_head = format!(
        "POST /upload HTTP/1.1\r\nhost: example.com\r\ncontent-length: {}\r\n\r\n",
        total.len()
    );

    let mut wire_bytes = preview_request(addr, preview.len(), &http_head);
    wire_bytes.extend_from_slice(http_head.as_bytes());
    wire_bytes.extend_from_slice(&chunk(preview));
    wire_bytes.extend_from_slice(b"0\r\n\r\n");
    stream.write_all(&wire_bytes).await.expect("write preview");

    let first = read_until_head(&mut stream).await;
    assert_eq!(
        icap_status(&first),
        Some(100),
        "server must ask for the remainder after a non-ieof preview"
    );

    let mut tail_wire = chunk(tail);
    tail_wire.extend_from_slice(b"0\r\n\r\n");
    stream.write_all(&tail_wire).await.expect("write tail");

    // Without Allow: 204 the reply echoes the whole message back.
    let mut resp = Vec::new();
    read_until_terminator(&mut stream, &mut resp).await;
    assert_eq!(icap_status(&resp), Some(200));

    let icap_end = find_double_crlf(&resp).expect("icap head");
    let rest = &resp[icap_end..];
    let http_end = find_double_crlf(rest).expect("embedded head");
    let echoed = wire::dechunk(&rest[http_end..], None).expect("chunked body");
    assert_eq!(echoed.data, total, "echoed HTTP body mismatch");
}

#[tokio::test]
async fn oversize_body_gets_400_and_connection_survives() {
    let addr = start_gateway().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    // max_filesize is 64 bytes; send 100.
    let body = vec![b'x'; 100];
    let http_head = format!(
        "POST /upload HTTP/1.1\r\nhost: example.com\r\ncontent-length: {}\r\n\r\n",
        body.len()
    );
    let mut wire_bytes = format!(
        "REQMOD icap://{addr}/scan ICAP/1.0\r\nHost: {addr}\r\nEncapsulated: req-hdr=0, req-body={}\r\n\r\n",
        http_head.len()
    )
    .into_bytes();
    wire_bytes.extend_from_slice(http_head.as_bytes());
    wire_bytes.extend_from_slice(&chunk(&body));
    wire_bytes.extend_from_slice(b"0\r\n\r\n");
    stream.write_all(&wire_bytes).await.expect("write");

    let resp = read_until_head(&mut stream).await;
    assert_eq!(icap_status(&resp), Some(400));

    // The oversize stream was drained; the connection still serves.
    stream
        .write_all(format!("OPTIONS icap://{addr}/scan ICAP/1.0\r\nHost: {addr}\r\n\r\n").as_bytes())
        .await
        .expect("write options");
    let next = read_until_head(&mut stream).await;
    assert_eq!(icap_status(&next), Some(200));
}
