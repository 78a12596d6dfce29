/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of ArcX Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use hyper::Request;
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::prelude::{HttpPeer, ProxyHttp, Result as PingoraResult, Session};
use tokio::sync::mpsc;
use tracing::warn;

use crate::errors::ResolveError;
use crate::host;
use crate::pool::{ConnectionPool, PoolError};
use crate::resolver::{Destination, DestinationResolver};
use crate::templates;

/// Per-request context. `destination` is filled in by `request_filter` once
/// the Destination Resolver succeeds. For ordinary requests it's only kept
/// around for bookkeeping, since `proxy_once` already drove the whole
/// upstream call itself; for an upgrade request (see `is_upgrade_request`)
/// it's filled in *before* `request_filter` returns, because `upstream_peer`
/// and `upstream_request_filter` read it to hand the connection to pingora's
/// own duplex-capable proxying instead.
pub struct RouterCtx {
    pub destination: Option<Destination>,
}

/// Reverse Proxy Handler (§4.7). Resolves a sandbox target for every
/// request and, for ordinary requests, drives the whole upstream call
/// itself through the Connection Pool rather than handing off to pingora's
/// own `upstream_peer` machinery -- the same short-circuit-in-`request_filter`
/// idiom the default route and the auth middleware use, just carried all
/// the way through to a real upstream response instead of a canned one.
/// This is deliberate: the pool's per-`connection_key` isolation and forced
/// reset on close (§4.6) have no equivalent in pingora's built-in peer
/// pooling. WebSocket/HTTP-upgrade requests are the one case that skips the
/// pool: those connections are single-use and duplex for their whole
/// lifetime, which the pool never tries to reuse, so they're deferred to
/// pingora's native `upstream_peer` path, which already copies bytes in
/// both directions once a 101 response comes back.
pub struct ProxyRouter {
    resolver: Arc<DestinationResolver>,
    pool: Arc<ConnectionPool>,
}

impl ProxyRouter {
    pub fn new(resolver: Arc<DestinationResolver>, pool: Arc<ConnectionPool>) -> Self {
        ProxyRouter { resolver, pool }
    }

    async fn render_error(
        &self,
        session: &mut Session,
        sandbox_id: Option<&str>,
        err: &ResolveError,
        user_agent: Option<&str>,
    ) -> PingoraResult<bool> {
        let rendered = templates::render(sandbox_id, err, user_agent);
        let mut header = ResponseHeader::build(rendered.status, None)?;
        header.insert_header("Content-Type", rendered.content_type)?;
        session.set_keepalive(None);
        session.write_response_header(Box::new(header), false).await?;
        session
            .write_response_body(Some(Bytes::from(rendered.body)), true)
            .await?;
        Ok(true)
    }

    /// Streams the downstream body to `destination` through the pool, and
    /// streams the upstream response straight back to the downstream
    /// session. Both directions move frame by frame rather than buffering a
    /// full body in memory, so chunked uploads and long-lived SSE responses
    /// are serviceable.
    async fn proxy_once(
        &self,
        session: &mut Session,
        destination: &Destination,
    ) -> Result<(), ProxyAttemptError> {
        let req_header = session.req_header();
        let mut builder = Request::builder()
            .method(req_header.method.clone())
            .uri(req_header.uri.clone());
        for (name, value) in req_header.headers.iter() {
            if name == http::header::HOST {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder = builder.header(http::header::HOST, resolve_host_value(destination, req_header));

        let (tx, rx) = mpsc::channel(16);
        let outbound = builder
            .body(ChannelBody { rx }.boxed())
            .expect("request parts copied from an already-valid downstream request");

        let send_fut = self.pool.get(&destination.connection_key).send(destination, outbound);
        let pump_fut = pump_request_body(session, tx);
        let (send_result, downstream_err) = tokio::join!(send_fut, pump_fut);

        if let Some(e) = downstream_err {
            return Err(ProxyAttemptError::Downstream(e));
        }
        let response = send_result.map_err(ProxyAttemptError::Pool)?;

        let (parts, mut incoming) = response.into_parts();
        let mut resp_header = ResponseHeader::build(parts.status, Some(parts.headers.len()))
            .map_err(ProxyAttemptError::Downstream)?;
        for (name, value) in parts.headers.iter() {
            resp_header
                .insert_header(name.clone(), value.clone())
                .map_err(ProxyAttemptError::Downstream)?;
        }
        session
            .write_response_header(Box::new(resp_header), false)
            .await
            .map_err(ProxyAttemptError::Downstream)?;

        loop {
            match incoming.frame().await {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        session
                            .write_response_body(Some(data.clone()), false)
                            .await
                            .map_err(ProxyAttemptError::Downstream)?;
                    }
                }
                Some(Err(e)) => return Err(ProxyAttemptError::Pool(PoolError::Request(e))),
                None => break,
            }
        }
        session
            .write_response_body(None, true)
            .await
            .map_err(ProxyAttemptError::Downstream)?;

        Ok(())
    }
}

enum ProxyAttemptError {
    Pool(PoolError),
    Downstream(Box<pingora::Error>),
}

/// Drains `session`'s request body into `tx` frame by frame, so the pool
/// send running alongside it in `proxy_once` can start writing to the
/// upstream before the downstream body has finished arriving. Dropping `tx`
/// on return closes the channel, which is how `ChannelBody` signals
/// end-of-body to its reader.
async fn pump_request_body(
    session: &mut Session,
    tx: mpsc::Sender<Result<Frame<Bytes>, hyper::Error>>,
) -> Option<Box<pingora::Error>> {
    loop {
        match session.read_request_body().await {
            Ok(Some(chunk)) => {
                if tx.send(Ok(Frame::data(chunk))).await.is_err() {
                    return None;
                }
            }
            Ok(None) => return None,
            Err(e) => return Some(e),
        }
    }
}

/// A `hyper` request body backed by an mpsc channel instead of a fully
/// buffered `Bytes`. Lets `proxy_once` start sending to the upstream while
/// the downstream body is still streaming in.
struct ChannelBody {
    rx: mpsc::Receiver<Result<Frame<Bytes>, hyper::Error>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Whether `req_header` is asking to switch protocols (WebSocket being the
/// common case). These requests are handed to pingora's native peer-driven
/// proxying instead of the pool (see `ProxyRouter`'s doc comment).
fn is_upgrade_request(req_header: &RequestHeader) -> bool {
    let has_upgrade_header = req_header.headers.contains_key(http::header::UPGRADE);
    let connection_requests_upgrade = req_header
        .headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    has_upgrade_header && connection_requests_upgrade
}

/// `Host` forwarded to the upstream (§4.6: "copies `Host` verbatim unless
/// `mask_request_host` is set, in which case `${PORT}` is substituted with
/// the sandbox port and the request's `Host` is replaced"). The
/// orchestrator-proxy re-parses this header to locate the sandbox, so the
/// verbatim case matters for real routing, not just cosmetics.
fn resolve_host_value(destination: &Destination, req_header: &RequestHeader) -> String {
    match &destination.mask_request_host {
        Some(template) => template.replace("${PORT}", &destination.sandbox_port.to_string()),
        None => req_header
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}:{}", destination.url_host, destination.url_port)),
    }
}

/// Best-effort `sandbox_id` recovered from the `Host` header, used only to
/// populate the error body's `sandboxId` field when a request fails before
/// (or outside of) a successful `Resolve`.
fn host_from_header(session: &Session) -> Option<String> {
    let value = session
        .req_header()
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())?;
    host::parse_host_label(value).ok().map(|t| t.sandbox_id)
}

#[async_trait]
impl ProxyHttp for ProxyRouter {
    type CTX = RouterCtx;

    fn new_ctx(&self) -> Self::CTX {
        RouterCtx { destination: None }
    }

    /// Only reached for upgrade requests deferred by `request_filter`; every
    /// other request is proxied directly through the pool and short-circuits
    /// before this phase runs.
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<Box<HttpPeer>> {
        let destination = ctx.destination.as_ref().ok_or_else(|| {
            pingora::Error::new_str("upstream_peer reached without a resolved destination")
        })?;
        Ok(Box::new(HttpPeer::new(
            format!("{}:{}", destination.url_host, destination.url_port),
            false,
            String::new(),
        )))
    }

    /// Only runs for the deferred upgrade path (see `upstream_peer`); applies
    /// the same `mask_request_host` substitution `proxy_once` applies for the
    /// pool path. When `mask_request_host` is `None` there's nothing to do
    /// here -- pingora already forwards the original request, `Host` header
    /// included, to the peer built in `upstream_peer`.
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<()>
    where
        Self::CTX: Send + Sync,
    {
        if let Some(destination) = &ctx.destination {
            if let Some(template) = &destination.mask_request_host {
                let host_value = template.replace("${PORT}", &destination.sandbox_port.to_string());
                upstream_request.insert_header(http::header::HOST, host_value)?;
            }
        }
        Ok(())
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> PingoraResult<bool>
    where
        Self::CTX: Send + Sync,
    {
        let user_agent = session
            .req_header()
            .headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let destination = match self.resolver.resolve(session.req_header()).await {
            Ok(destination) => destination,
            Err(e) => {
                let sandbox_id = host_from_header(session);
                return self
                    .render_error(session, sandbox_id.as_deref(), &e, user_agent.as_deref())
                    .await;
            }
        };

        if is_upgrade_request(session.req_header()) {
            ctx.destination = Some(destination);
            return Ok(false);
        }

        match self.proxy_once(session, &destination).await {
            Ok(()) => {
                ctx.destination = Some(destination);
                Ok(true)
            }
            Err(ProxyAttemptError::Downstream(e)) => Err(e),
            Err(ProxyAttemptError::Pool(pool_err)) => {
                warn!(
                    sandbox_id = %destination.sandbox_id,
                    error = %pool_err,
                    "upstream proxy attempt failed"
                );
                let err = if destination.default_to_port_error {
                    ResolveError::PortClosed {
                        sandbox_id: destination.sandbox_id.clone(),
                        sandbox_port: destination.sandbox_port,
                    }
                } else {
                    ResolveError::Internal(pool_err.to_string())
                };
                self.render_error(session, Some(&destination.sandbox_id), &err, user_agent.as_deref())
                    .await
            }
        }
    }
}
