//! WebSocket server driver and the frame writer shared with the client.
//!
//! The upgrade is only accepted on the configured path. After it, every
//! text frame is one application message; close frames end the
//! connection and binary frames are dropped.

use futures_util::{Sink, SinkExt, StreamExt};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::connection::{ConnectionContext, ConnectionId, Outbound, OutboundQueue};
use crate::tcp_server::shutdown_requested;

/// Frame-level configuration for a message size limit.
pub(crate) fn frame_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

/// Upgrade `stream` on `path` and serve WebSocket frames until either side closes.
pub(crate) async fn serve<S>(
    stream: S,
    mut ctx: ConnectionContext,
    outbound: OutboundQueue,
    path: &'static str,
    max_message_size: usize,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = ctx.connection().id();
    let abort = ctx.connection().abort_token();
    let check_path = move |request: &Request, response: Response| {
        let requested = request.uri().path();
        if requested == path {
            return Ok(response);
        }
        tracing::warn!("Connection {id} upgrade requested at {requested}, expected {path}");
        let mut error = ErrorResponse::new(Some(format!("no websocket endpoint at {requested}")));
        *error.status_mut() = StatusCode::NOT_FOUND;
        Err(error)
    };

    let ws = match tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        check_path,
        Some(frame_config(max_message_size)),
    )
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!("Connection {id} WebSocket upgrade failed: {e}");
            ctx.teardown();
            return;
        }
    };
    tracing::debug!("Connection {id} upgraded to WebSocket on {path}");

    let (sink, mut frames) = ws.split();
    let writer_task = tokio::spawn(write_frames(sink, outbound, id));

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    ctx.on_message(text.as_str());
                    if ctx.is_closed() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::warn!("Connection {id} dropping {} byte binary frame", data.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!("Connection {id} received close frame {frame:?}");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!("Connection {id} WebSocket error: {e}");
                    break;
                }
                None => break,
            },
            changed = shutdown.changed() => {
                if shutdown_requested(changed, &shutdown) {
                    break;
                }
            }
            _ = abort.cancelled() => break,
        }
    }

    ctx.teardown();
    let _ = writer_task.await;
}

/// Writer task for WebSocket transports: one text frame per queued write.
/// An abort drops the sink without a close frame.
pub(crate) async fn write_frames<K>(
    mut sink: K,
    mut outbound: OutboundQueue,
    id: ConnectionId,
) where
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Text(text) => {
                tracing::trace!("Connection {id} sending {} byte text frame", text.len());
                let result = tokio::select! {
                    result = sink.send(Message::text(text)) => result,
                    _ = outbound.aborted() => return,
                };
                if let Err(e) = result {
                    tracing::error!("Connection {id} write error: {e}");
                    break;
                }
            }
            Outbound::Close => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    tracing::debug!("Connection {id} close frame not sent: {e}");
                }
                break;
            }
        }
    }
    tokio::select! {
        _ = sink.close() => {}
        _ = outbound.aborted() => {}
    }
}

#[cfg(test)]
mod tests {
    use crate::pipeline::TransportProfile;
    use crate::session::MessageHandler;
    use crate::tcp_server::{GameServer, ServerConfig};
    use crate::testing::Recorder;
    use futures_util::{SinkExt, Stream, StreamExt};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::{Error, Message};

    async fn start_ws_server(handler: Arc<dyn MessageHandler>) -> (SocketAddr, Arc<GameServer>) {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            profile: TransportProfile::WebSocket,
            ..Default::default()
        };
        let server = Arc::new(GameServer::new(config, handler));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::clone(&server);
        tokio::spawn(async move { srv.run_with_listener(listener).await });
        (addr, server)
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: Stream<Item = Result<Message, Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = frame {
                return text.as_str().to_owned();
            }
        }
    }

    #[tokio::test]
    async fn test_text_frame_is_one_message() {
        let recorder = Recorder::echoing();
        let (addr, _server) = start_ws_server(recorder.clone()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/websocket"))
            .await
            .unwrap();

        ws.send(Message::text("a$b")).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "#echo:a$b$");
        assert_eq!(recorder.messages(), vec!["a$b"]);
    }

    #[tokio::test]
    async fn test_wrong_path_is_not_found() {
        let (addr, _server) = start_ws_server(Recorder::new()).await;
        let result = tokio_tungstenite::connect_async(format!("ws://{addr}/other")).await;
        match result {
            Err(Error::Http(response)) => assert_eq!(response.status(), 404),
            other => panic!("expected 404, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_binary_frames_are_dropped() {
        let recorder = Recorder::echoing();
        let (addr, _server) = start_ws_server(recorder.clone()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/websocket"))
            .await
            .unwrap();

        ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
        ws.send(Message::text("after")).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "#echo:after$");
        assert_eq!(recorder.messages(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_close_frame_tears_down_session() {
        let recorder = Recorder::new();
        let (addr, server) = start_ws_server(recorder.clone()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/websocket"))
            .await
            .unwrap();

        ws.send(Message::text("hi")).await.unwrap();
        recorder.wait_for(1).await;
        ws.close(None).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), recorder.wait_closed(1))
            .await
            .unwrap();
        for _ in 0..100 {
            if server.connections().is_empty().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection was not removed");
    }

    #[tokio::test]
    async fn test_broadcast_arrives_as_text_frame() {
        let (addr, server) = start_ws_server(Recorder::new()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/websocket"))
            .await
            .unwrap();
        while server.connections().is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(server.connections().broadcast("world").await, 1);
        assert_eq!(next_text(&mut ws).await, "#world$");
    }

    #[tokio::test]
    async fn test_oversized_message_closes_connection() {
        let recorder = Recorder::new();
        let (addr, _server) = start_ws_server(recorder.clone()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/websocket"))
            .await
            .unwrap();

        let _ = ws.send(Message::text("z".repeat(70_000))).await;
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert!(recorder.messages().is_empty());
    }
}
