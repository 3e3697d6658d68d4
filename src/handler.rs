//! Per-request transaction controller.
//!
//! Executes one ICAP transaction against the registry snapshot:
//! route by service name, gate the method, stamp response identity,
//! then answer OPTIONS directly or dispatch REQMOD/RESPMOD to the
//! adaptation backend and translate its verdict into the wire reply.
//! Shadow services commit the reply first and run their backend as a
//! post-reply hook whose result is only logged.

use crate::backend::AdaptationInput;
use crate::error::IcapResult;
use crate::parser::{clone_http_request, clone_http_response};
use crate::request::{EmbeddedHttp, Method, Request};
use crate::response::StatusCode;
use crate::server::{Connection, GatewayState};
use crate::writer::ResponseWriter;
use http::{Request as HttpRequest, Version};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, trace, warn};

/// Drive one parsed ICAP request to a committed reply.
pub async fn handle_transaction<R, W>(
    mut req: Request,
    conn: &mut Connection<R>,
    writer: &mut ResponseWriter<W>,
    state: &Arc<GatewayState>,
    txn: u64,
) -> IcapResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    debug!(txn, method = %req.method, uri = %req.uri, "request received on icap");

    let service = match req.service_name().ok().and_then(|n| state.services.lookup(n)) {
        Some(service) => service,
        None => {
            warn!(txn, uri = %req.uri, "service not found");
            writer
                .write_status(StatusCode::NotFound404, None, false)
                .await?;
            return writer.close().await;
        }
    };

    if !service.is_method_enabled(req.method) {
        debug!(txn, method = %req.method, service = %service.name, "method not enabled");
        writer
            .write_status(StatusCode::MethodNotAllowed405, None, false)
            .await?;
        return writer.close().await;
    }

    writer.set_header("ISTag", &service.istag)?;
    writer.set_header("Service", &service.caption)?;

    if req.method == Method::Options {
        return options_mode(&service, writer).await;
    }

    // A CONNECT tunnel carries nothing to adapt.
    if req.method == Method::ReqMod && req.is_connect() {
        trace!(txn, "CONNECT request, nothing to adapt");
        writer
            .write_status(StatusCode::NoContent204, None, false)
            .await?;
        return writer.close().await;
    }

    // A non-ieof preview holds the remainder of the body at the client.
    // Ask for it unless this transaction can be answered from the
    // preview alone (shadow + 204).
    if req.is_preview && !req.preview_ieof && !(service.shadow && req.can_return_204()) {
        trace!(txn, "requesting preview continuation");
        writer.write_continue().await?;
        conn.read_remainder(&mut req).await?;
    }

    let deadline = state.config.request_timeout();

    if service.shadow {
        return shadow_mode(req, writer, state, service, txn, deadline).await;
    }

    let Some(backend) = state
        .backends
        .get(&service.vendor, &service.name, req.method)
    else {
        error!(txn, service = %service.name, vendor = %service.vendor, "no backend registered");
        writer
            .write_status(StatusCode::InternalServerError500, None, false)
            .await?;
        return writer.close().await;
    };

    let input = adaptation_input(&req, txn, deadline);
    let verdict = match tokio::time::timeout(deadline, backend.process(input)).await {
        Err(_) => {
            let aborted = crate::error::Error::DeadlineExceeded(deadline);
            warn!(txn, service = %service.name, error = %aborted, "backend aborted");
            writer
                .write_status(StatusCode::InternalServerError500, None, false)
                .await?;
            return writer.close().await;
        }
        Ok(Err(e)) => {
            if state.config.app.propagate_error {
                error!(txn, service = %service.name, error = %e, "backend failed");
            } else {
                debug!(txn, service = %service.name, error = %e, "backend failed");
            }
            writer
                .write_status(StatusCode::InternalServerError500, None, false)
                .await?;
            return writer.close().await;
        }
        Ok(Ok(verdict)) => verdict,
    };

    // Backend headers may override anything except response identity.
    writer.merge_backend_headers(&verdict.headers)?;

    match verdict.status {
        StatusCode::InternalServerError500 => {
            writer
                .write_status(StatusCode::InternalServerError500, None, false)
                .await?;
            writer.close().await
        }
        StatusCode::NoContent204 => {
            if req.can_return_204() {
                writer
                    .write_status(StatusCode::NoContent204, None, false)
                    .await?;
                writer.close().await
            } else {
                // RFC 3507 §4.6: without Allow: 204 the unmodified
                // message is returned in full.
                let msg = take_echo_message(&mut req);
                write_with_message(writer, StatusCode::Ok200, &msg).await
            }
        }
        StatusCode::Ok200 => {
            let msg = match verdict.replacement {
                Some(replacement) => replacement,
                None => take_echo_message(&mut req),
            };
            write_with_message(writer, StatusCode::Ok200, &msg).await
        }
        other => match verdict.replacement {
            Some(replacement) => write_with_message(writer, other, &replacement).await,
            None => {
                writer.write_status(other, None, false).await?;
                writer.close().await
            }
        },
    }
}

/// Build the OPTIONS reply for a service.
async fn options_mode<W>(
    service: &crate::registry::ServiceDescriptor,
    writer: &mut ResponseWriter<W>,
) -> IcapResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.set_header("Methods", &service.enabled_methods_string())?;
    writer.set_header("Allow", "204")?;
    if let Some(preview) = service.preview_bytes {
        writer.set_header("Preview", &preview.to_string())?;
        writer.set_header("Transfer-Preview", "*")?;
    }
    writer.write_status(StatusCode::Ok200, None, false).await?;
    writer.close().await
}

/// Shadow mode: the client gets its answer immediately; the backend runs
/// afterwards for side effects only and its verdict is discarded.
async fn shadow_mode<W>(
    mut req: Request,
    writer: &mut ResponseWriter<W>,
    state: &Arc<GatewayState>,
    service: Arc<crate::registry::ServiceDescriptor>,
    txn: u64,
    deadline: Duration,
) -> IcapResult<()>
where
    W: AsyncWrite + Unpin,
{
    debug!(txn, service = %service.name, "shadow service enabled, processing not required for this reply");
    let input = adaptation_input(&req, txn, deadline);

    if req.can_return_204() {
        writer
            .write_status(StatusCode::NoContent204, None, false)
            .await?;
        writer.close().await?;
    } else {
        let msg = take_echo_message(&mut req);
        write_with_message(writer, StatusCode::Ok200, &msg).await?;
    }

    if let Some(backend) = state
        .backends
        .get(&service.vendor, &service.name, req.method)
    {
        let service_name = service.name.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, backend.process(input)).await {
                Ok(Ok(verdict)) => {
                    debug!(txn, service = %service_name, status = %verdict.status, "shadow backend completed")
                }
                Ok(Err(e)) => {
                    warn!(txn, service = %service_name, error = %e, "shadow backend failed")
                }
                Err(_) => {
                    warn!(txn, service = %service_name, "shadow backend deadline exceeded")
                }
            }
        });
    }
    Ok(())
}

/// Owned, replayable backend view. When the transaction carries no
/// encapsulated message at all, an empty request keeps the contract total.
fn adaptation_input(req: &Request, txn: u64, deadline: Duration) -> AdaptationInput {
    let mut http_request = req.http_request.as_ref().map(clone_http_request);
    let http_response = req.http_response.as_ref().map(clone_http_response);
    if http_request.is_none() && http_response.is_none() {
        http_request = Some(empty_http_request());
    }
    AdaptationInput {
        http_request,
        http_response,
        txn,
        deadline,
    }
}

fn empty_http_request() -> HttpRequest<Vec<u8>> {
    HttpRequest::builder()
        .method(http::Method::GET)
        .uri("/")
        .version(Version::HTTP_11)
        .body(Vec::new())
        .expect("static request parts")
}

fn take_echo_message(req: &mut Request) -> EmbeddedHttp {
    req.take_primary_message()
        .unwrap_or_else(|| EmbeddedHttp::Req(empty_http_request()))
}

async fn write_with_message<W>(
    writer: &mut ResponseWriter<W>,
    status: StatusCode,
    msg: &EmbeddedHttp,
) -> IcapResult<()>
where
    W: AsyncWrite + Unpin,
{
    let body = msg.body();
    let has_body = !body.is_empty();
    writer.write_status(status, Some(msg), has_body).await?;
    if has_body {
        writer.write_body(body).await?;
    }
    writer.close().await
}
