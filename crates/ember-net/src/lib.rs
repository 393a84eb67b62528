//! Game transport layer: marker framing, sessions, and plain-text, HTTP and
//! WebSocket connections for both the server and the client side.

pub mod codec;
pub mod connection;
pub mod framing;
pub mod handshake;
mod http_server;
pub mod pipeline;
pub mod rewind;
pub mod session;
pub mod socket;
pub mod tcp_client;
pub mod tcp_server;
mod websocket;

#[cfg(test)]
mod testing;

pub use codec::TextCodec;
pub use connection::{
    Connection, ConnectionContext, ConnectionId, IdGenerator, Outbound, OutboundQueue,
};
pub use framing::{FrameAssembler, FrameConfig, FrameError, MESSAGE_BEGIN, MESSAGE_END};
pub use handshake::{ClientHandshake, HandshakeError, HandshakeProgress, HandshakeState};
pub use pipeline::{
    ClientPipeline, PipelineError, PipelineLimits, Role, ServerPipeline, TransportProfile,
};
pub use session::{Identity, MessageHandler, PlayerId, Session, SessionError, SessionState};
pub use socket::SocketConfig;
pub use tcp_client::{
    ClientConfig, ClientError, ClientEvent, ConnectionState, ConnectionStateWatch, GameClient,
};
pub use tcp_server::{
    ConnectionLimitReached, ConnectionMap, GameServer, ServerConfig, ServerError,
};
