// ABOUTME: TCP transport producing bytestream sockets
// ABOUTME: Thin layer over tokio's TcpStream/TcpListener with deadline-driven connect/accept

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::socket::Listener;
use crate::stream::StreamSocket;
use async_trait::async_trait;
use std::io;
use tokio::net::{TcpStream, ToSocketAddrs};

/// A connected TCP bytestream.
pub type TcpSocket = StreamSocket<TcpStream>;

/// Connect to a remote TCP endpoint.
///
/// `addr` is anything resolvable ("host:port", `SocketAddr`, ...). Name
/// resolution counts against the deadline.
pub async fn connect<A: ToSocketAddrs>(addr: A, deadline: Deadline) -> Result<TcpSocket> {
    let stream = deadline
        .cap(async { Ok(TcpStream::connect(addr).await?) })
        .await?;
    Ok(StreamSocket::new(stream))
}

/// A listening TCP socket.
pub struct TcpListener {
    inner: tokio::net::TcpListener,
}

/// Start listening on a local TCP endpoint. Address reuse is enabled by
/// tokio's listener defaults.
pub async fn listen<A: ToSocketAddrs>(addr: A) -> Result<TcpListener> {
    let inner = tokio::net::TcpListener::bind(addr).await?;
    Ok(TcpListener { inner })
}

impl TcpListener {
    /// The bound local address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[async_trait]
impl Listener for TcpListener {
    type Conn = TcpSocket;

    async fn accept(&self, deadline: Deadline) -> Result<TcpSocket> {
        let stream = deadline
            .cap(async {
                loop {
                    match self.inner.accept().await {
                        Ok((stream, _peer)) => return Ok(stream),
                        // A connection that is reset between arrival and
                        // accept is the peer's problem, not ours.
                        Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                        Err(e) => return Err(Error::from(e)),
                    }
                }
            })
            .await?;
        Ok(StreamSocket::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Bytestream;

    #[tokio::test]
    async fn test_connect_accept_roundtrip() {
        let listener = listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let s = connect(addr, Deadline::NEVER).await.unwrap();
            s.send(b"ping", Deadline::NEVER).await.unwrap();
            let mut buf = [0u8; 4];
            s.recv(&mut buf, Deadline::NEVER).await.unwrap();
            assert_eq!(&buf, b"pong");
        });

        let server = listener.accept(Deadline::NEVER).await.unwrap();
        let mut buf = [0u8; 4];
        server.recv(&mut buf, Deadline::NEVER).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.send(b"pong", Deadline::NEVER).await.unwrap();
        client.await.unwrap();
    }
}
