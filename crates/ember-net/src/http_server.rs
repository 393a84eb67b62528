//! HTTP/1.1 server driver.
//!
//! Each request body is aggregated into one application message and
//! dispatched to the connection's session. Whatever the session writes
//! while handling it is streamed back as the chunked `200 OK` body, one
//! chunk per write. Bodies past the size limit are drained and answered
//! with `413` without dispatch, keeping the connection usable.

use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use futures_util::stream;
use http::header::{CONNECTION, CONTENT_TYPE, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::connection::{ConnectionContext, ConnectionId, Outbound, OutboundQueue};
use crate::tcp_server::shutdown_requested;

/// Response body type produced by the driver.
pub type ResponseBody = BoxBody<Bytes, Infallible>;

/// How far past the limit an oversized body is drained before the
/// connection is given up instead.
const DRAIN_FACTOR: usize = 16;

struct HttpState {
    ctx: ConnectionContext,
    outbound: OutboundQueue,
}

fn lock(state: &Mutex<HttpState>) -> MutexGuard<'_, HttpState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serve HTTP/1.1 on `stream` until the peer leaves, the session closes,
/// the server shuts down or the outbound queue overflows. Queued writes wait
/// for the next response, so an idle peer that stops polling is cut off once
/// its queue fills.
pub(crate) async fn serve<S>(
    stream: S,
    ctx: ConnectionContext,
    outbound: OutboundQueue,
    max_body_size: usize,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = ctx.connection().id();
    let abort = ctx.connection().abort_token();
    let state = Arc::new(Mutex::new(HttpState { ctx, outbound }));

    let service_state = Arc::clone(&state);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&service_state);
        async move { Ok::<_, Infallible>(handle_request(req, &state, id, max_body_size).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::warn!("Connection {id} HTTP error: {e}");
                }
                break;
            }
            changed = shutdown.changed(), if !draining => {
                if shutdown_requested(changed, &shutdown) {
                    draining = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
            _ = abort.cancelled() => break,
        }
    }

    lock(&state).ctx.teardown();
}

async fn handle_request(
    req: Request<Incoming>,
    state: &Mutex<HttpState>,
    id: ConnectionId,
    max_body_size: usize,
) -> Response<ResponseBody> {
    tracing::debug!("Connection {id} {} {}", req.method(), req.uri().path());

    let body = match aggregate(req.into_body(), max_body_size).await {
        Ok(Aggregated::Complete(body)) => body,
        Ok(Aggregated::TooLarge { size, drained }) => {
            tracing::warn!("Connection {id} request body of {size}+ bytes exceeds {max_body_size}");
            return status_response(StatusCode::PAYLOAD_TOO_LARGE, !drained);
        }
        Err(e) => {
            tracing::warn!("Connection {id} failed reading request body: {e}");
            return status_response(StatusCode::BAD_REQUEST, true);
        }
    };

    let Ok(message) = std::str::from_utf8(&body) else {
        tracing::warn!("Connection {id} request body is not UTF-8");
        return status_response(StatusCode::BAD_REQUEST, false);
    };

    let (chunks, close) = {
        let mut guard = lock(state);
        let HttpState { ctx, outbound } = &mut *guard;
        if message.is_empty() {
            ctx.session_or_create();
        } else {
            ctx.on_message(message);
        }

        let mut close = ctx.is_closed();
        let mut chunks: Vec<Result<Frame<Bytes>, Infallible>> = Vec::new();
        while let Some(item) = outbound.try_recv() {
            match item {
                Outbound::Text(text) => chunks.push(Ok(Frame::data(Bytes::from(text)))),
                Outbound::Close => close = true,
            }
        }
        (chunks, close)
    };

    let body = StreamBody::new(stream::iter(chunks)).boxed();
    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    if close {
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

enum Aggregated {
    Complete(Bytes),
    TooLarge { size: usize, drained: bool },
}

async fn aggregate(mut body: Incoming, max_size: usize) -> Result<Aggregated, hyper::Error> {
    let mut buf = BytesMut::new();
    let mut size = 0usize;
    let drain_limit = max_size.saturating_mul(DRAIN_FACTOR);

    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        size += data.len();
        if size <= max_size {
            buf.extend_from_slice(&data);
        } else if size > drain_limit {
            return Ok(Aggregated::TooLarge {
                size,
                drained: false,
            });
        }
    }

    if size > max_size {
        Ok(Aggregated::TooLarge {
            size,
            drained: true,
        })
    } else {
        Ok(Aggregated::Complete(buf.freeze()))
    }
}

fn status_response(status: StatusCode, close: bool) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::new()).boxed());
    *response.status_mut() = status;
    if close {
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    response
}
