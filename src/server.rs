//! ICAP gateway server.
//!
//! Accepts connections, reads complete ICAP messages (headers plus any
//! chunked encapsulated body, honoring preview terminators), and hands
//! each parsed request to the transaction controller. Connections are
//! persistent: multiple ICAP messages may arrive over the same TCP
//! connection.
//!
//! Message boundary rules:
//!  - ICAP headers end at CRLFCRLF;
//!  - If `Encapsulated` names a body part, the chunked body that follows
//!    is read to its terminating zero chunk (`0[;ext]\r\n\r\n`);
//!  - If there is no body, the message ends at the ICAP headers CRLFCRLF.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, trace, warn};

use crate::backend::{Backend, BackendFactory, BackendRegistry};
use crate::config::Config;
use crate::error::{Error, IcapResult};
use crate::handler::handle_transaction;
use crate::parser::{self, find_double_crlf, read_chunked_to_end, wire};
use crate::registry::ServiceRegistry;
use crate::request::{Method, Request};
use crate::response::StatusCode;
use crate::writer::ResponseWriter;
use crate::{DEFAULT_ISTAG, MAX_HDR_BYTES, SERVER_SOFTWARE};

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);
static NEXT_TXN: AtomicU64 = AtomicU64::new(1);

/// Immutable per-process state shared by every transaction.
pub struct GatewayState {
    pub config: Config,
    pub services: ServiceRegistry,
    pub backends: BackendRegistry,
}

/// Read side of one client connection.
pub struct Connection<R> {
    stream: R,
    buf: Vec<u8>,
    max_body: usize,
}

impl<R> Connection<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(stream: R, max_body: usize) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(16 * 1024),
            max_body,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Read one complete ICAP message into the buffer. Returns the
    /// message end offset, or `None` on a clean close between messages.
    pub async fn read_message(&mut self) -> IcapResult<Option<usize>> {
        let h_end = loop {
            if let Some(end) = find_double_crlf(&self.buf) {
                break end;
            }
            if self.buf.len() > MAX_HDR_BYTES {
                return Err(Error::header("ICAP header block too large"));
            }
            let mut tmp = [0u8; 8192];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(Error::EarlyCloseWithoutHeaders)
                };
            }
            self.buf.extend_from_slice(&tmp[..n]);
        };

        let hdr_text = std::str::from_utf8(&self.buf[..h_end])
            .map_err(|_| Error::parse("ICAP headers are not valid UTF-8"))?;
        let enc = parser::parse_encapsulated_header(hdr_text)?;

        // The encapsulated area runs up to the body offset (HTTP heads),
        // then a chunked body follows unless the marker is null-body.
        let mut msg_end = h_end;
        if let Some((kind, body_rel)) = enc.as_ref().and_then(|e| e.body) {
            let body_abs = h_end + body_rel;
            while self.buf.len() < body_abs {
                let mut tmp = [0u8; 8192];
                let n = self.stream.read(&mut tmp).await?;
                if n == 0 {
                    return Err(Error::body("unexpected EOF before start of ICAP body"));
                }
                self.buf.extend_from_slice(&tmp[..n]);
            }
            msg_end = if kind.has_payload() {
                read_chunked_to_end(&mut self.stream, &mut self.buf, body_abs, Some(self.max_body))
                    .await?
            } else {
                body_abs
            };
        }
        Ok(Some(msg_end))
    }

    /// Read the continuation chunks sent after a `100 Continue` and
    /// append the dechunked payload to the encapsulated body.
    pub async fn read_remainder(&mut self, req: &mut Request) -> IcapResult<()> {
        let existing = req.http_request.as_ref().map(|r| r.body().len()).unwrap_or(0)
            + req.http_response.as_ref().map(|r| r.body().len()).unwrap_or(0);
        let cap = self.max_body.saturating_sub(existing);
        let end = read_chunked_to_end(&mut self.stream, &mut self.buf, 0, Some(cap)).await?;
        let tail = wire::dechunk(&self.buf[..end], Some(cap))?;
        self.buf.drain(..end);

        let target = match (
            req.method,
            req.http_request.as_mut(),
            req.http_response.as_mut(),
        ) {
            (Method::RespMod, _, Some(r)) => r.body_mut(),
            (_, Some(r), _) => r.body_mut(),
            (_, None, Some(r)) => r.body_mut(),
            _ => return Err(Error::body("preview continuation without encapsulated message")),
        };
        target.extend_from_slice(&tail.data);

        // The full body is in hand; 204 now requires Allow: 204.
        req.is_preview = false;
        req.preview_ieof = false;
        Ok(())
    }
}

/// ICAP gateway server.
pub struct Server {
    listener: TcpListener,
    state: Arc<GatewayState>,
    conn_limit: Option<Arc<Semaphore>>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Address the listener is bound to (useful with an ephemeral port).
    pub fn local_addr(&self) -> IcapResult<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Main accept loop.
    pub async fn run(self) -> IcapResult<()> {
        let local_addr = self.listener.local_addr()?;
        debug!(%local_addr, services = self.state.services.len(), "icap gateway started");

        loop {
            let (socket, addr) = self.listener.accept().await?;
            trace!(%addr, "new connection");

            let maybe_permit = if let Some(sem) = &self.conn_limit {
                match sem.clone().try_acquire_owned() {
                    Ok(p) => Some(p),
                    Err(_) => {
                        warn!(%addr, "refusing connection: too many concurrent connections");
                        let mut socket = socket;
                        let mut writer = ResponseWriter::new(&mut socket);
                        let _ = writer.set_header("ISTag", DEFAULT_ISTAG);
                        let _ = writer.set_header("Service", SERVER_SOFTWARE);
                        if writer
                            .write_status(StatusCode::ServiceUnavailable503, None, false)
                            .await
                            .is_ok()
                        {
                            let _ = writer.close().await;
                        }
                        continue;
                    }
                }
            } else {
                None
            };

            let state = Arc::clone(&self.state);
            let conn_id = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                let _permit = maybe_permit;
                if let Err(e) = handle_connection(socket, state, conn_id).await {
                    debug!(conn = conn_id, %addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Serve one client connection until it closes or a fatal error occurs.
async fn handle_connection(
    socket: TcpStream,
    state: Arc<GatewayState>,
    conn_id: u64,
) -> IcapResult<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut conn = Connection::new(read_half, state.config.app.max_filesize);

    loop {
        let msg_end = match conn.read_message().await {
            Ok(Some(end)) => end,
            Ok(None) => {
                trace!(conn = conn_id, "connection closed by peer");
                return Ok(());
            }
            Err(e @ Error::BodyTooLarge { .. }) => {
                // The oversize stream was drained; answer 400 and keep
                // the connection for the next message.
                warn!(conn = conn_id, error = %e, "encapsulated body too large");
                conn.clear();
                write_plain_status(&mut write_half, StatusCode::BadRequest400).await?;
                continue;
            }
            Err(Error::EarlyCloseWithoutHeaders) | Err(Error::Network(_)) => {
                // Unexpected EOF: no reply possible.
                return Ok(());
            }
            Err(e) => {
                warn!(conn = conn_id, error = %e, "malformed ICAP message");
                let _ = write_plain_status(&mut write_half, StatusCode::BadRequest400).await;
                return Err(e);
            }
        };

        let txn = NEXT_TXN.fetch_add(1, Ordering::Relaxed);
        let req = match parser::parse_icap_request(
            &conn.bytes()[..msg_end],
            Some(state.config.app.max_filesize),
        ) {
            Ok(req) => req,
            Err(e) => {
                warn!(conn = conn_id, txn, error = %e, "rejecting unparseable request");
                let status = if e.is_client_fault() {
                    StatusCode::BadRequest400
                } else {
                    StatusCode::InternalServerError500
                };
                let _ = write_plain_status(&mut write_half, status).await;
                return Err(e);
            }
        };
        conn.consume(msg_end);

        let mut writer = ResponseWriter::new(&mut write_half);
        writer.set_header("ISTag", DEFAULT_ISTAG)?;
        writer.set_header("Service", SERVER_SOFTWARE)?;

        match handle_transaction(req, &mut conn, &mut writer, &state, txn).await {
            Ok(()) => {
                trace!(conn = conn_id, txn, "response sent");
            }
            Err(e) => {
                error!(conn = conn_id, txn, error = %e, "transaction failed");
                if !writer.committed() {
                    let status = if e.is_client_fault() {
                        StatusCode::BadRequest400
                    } else {
                        StatusCode::InternalServerError500
                    };
                    let _ = writer.write_status(status, None, false).await;
                    let _ = writer.close().await;
                }
                return Err(e);
            }
        }
    }
}

/// Emit a bare, header-only reply outside a transaction (read errors).
async fn write_plain_status<W>(stream: &mut W, status: StatusCode) -> IcapResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = ResponseWriter::new(stream);
    writer.set_header("ISTag", DEFAULT_ISTAG)?;
    writer.set_header("Service", SERVER_SOFTWARE)?;
    writer.write_status(status, None, false).await?;
    writer.close().await
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    bind_addr: Option<String>,
    config: Option<Config>,
    factories: HashMap<String, Box<dyn BackendFactory>>,
    direct: Vec<(String, String, Method, Arc<dyn Backend>)>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            bind_addr: None,
            config: None,
            factories: HashMap::new(),
            direct: Vec::new(),
        }
    }

    /// Override the bind address (defaults to `0.0.0.0:<app.port>`).
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = Some(addr.to_string());
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Register a backend factory for a vendor.
    pub fn factory(mut self, vendor: &str, factory: Box<dyn BackendFactory>) -> Self {
        self.factories.insert(vendor.to_string(), factory);
        self
    }

    /// Register a concrete backend for one `(vendor, service, method)`
    /// triple, bypassing the vendor factory.
    pub fn backend(
        mut self,
        vendor: &str,
        service: &str,
        method: Method,
        backend: Arc<dyn Backend>,
    ) -> Self {
        self.direct
            .push((vendor.to_string(), service.to_string(), method, backend));
        self
    }

    pub async fn build(self) -> IcapResult<Server> {
        let config = self
            .config
            .ok_or_else(|| Error::configuration("no configuration provided"))?;
        let services = ServiceRegistry::from_config(&config)?;

        let mut backends = BackendRegistry::new();
        for (vendor, service, method, backend) in self.direct {
            backends.register(&vendor, &service, method, backend);
        }
        for name in services.names() {
            let svc = services.lookup(name).expect("name iterated from registry");
            for method in svc.enabled_methods() {
                if backends.get(&svc.vendor, &svc.name, method).is_none() {
                    let factory = self.factories.get(&svc.vendor).ok_or_else(|| {
                        Error::configuration(format!(
                            "service '{}': no backend for vendor '{}' method {}",
                            svc.name, svc.vendor, method
                        ))
                    })?;
                    backends.register(&svc.vendor, &svc.name, method, factory.create(&svc, method)?);
                }
            }
        }

        let bind_addr = self
            .bind_addr
            .unwrap_or_else(|| format!("0.0.0.0:{}", config.app.port));
        let listener = TcpListener::bind(&bind_addr).await?;
        let conn_limit = config
            .app
            .max_connections
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        Ok(Server {
            listener,
            state: Arc::new(GatewayState {
                config,
                services,
                backends,
            }),
            conn_limit,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
