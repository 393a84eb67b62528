//! TCP socket options for listeners and accepted or dialed streams.
//!
//! Every stream gets `TCP_NODELAY` and `SO_KEEPALIVE`. Listeners are built
//! through `socket2` so address reuse and the backlog can be set before
//! binding.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Socket options applied by the server and the client.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive: bool,
    /// Idle time before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Set `SO_REUSEADDR` on listeners. Default: true except on Windows.
    pub reuse_addr: bool,
    /// Listen backlog. Default: 128.
    pub backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive: true,
            keepalive_idle: Duration::from_secs(60),
            reuse_addr: !cfg!(target_os = "windows"),
            backlog: 128,
        }
    }
}

/// Apply stream options to a connected [`TcpStream`].
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive {
        let keepalive = TcpKeepalive::new().with_time(config.keepalive_idle);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Create, configure and bind a [`TcpListener`].
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_options_applied() {
        let config = SocketConfig::default();
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        configure_stream(&client, &config).unwrap();

        assert!(client.nodelay().unwrap(), "TCP_NODELAY should be enabled");
        assert!(SockRef::from(&client).keepalive().unwrap(), "SO_KEEPALIVE should be enabled");
    }

    #[tokio::test]
    async fn test_options_can_be_disabled() {
        let config = SocketConfig {
            tcp_nodelay: false,
            keepalive: false,
            ..Default::default()
        };
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        configure_stream(&client, &config).unwrap();

        assert!(!client.nodelay().unwrap());
        assert!(!SockRef::from(&client).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_second_bind_on_same_port_fails() {
        let config = SocketConfig {
            reuse_addr: false,
            ..Default::default()
        };
        let first = create_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let addr = first.local_addr().unwrap();

        let second = create_listener(addr, &config);
        assert!(second.is_err(), "Port {} should already be in use", addr.port());
    }
}
