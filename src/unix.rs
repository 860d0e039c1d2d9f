// ABOUTME: Unix-domain transport producing bytestream sockets
// ABOUTME: Includes the socketpair constructor used heavily by stack tests

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::socket::Listener;
use crate::stream::StreamSocket;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use tokio::net::UnixStream;

/// A connected Unix-domain bytestream.
pub type UnixSocket = StreamSocket<UnixStream>;

/// Connect to a Unix-domain socket at `path`.
pub async fn connect<P: AsRef<Path>>(path: P, deadline: Deadline) -> Result<UnixSocket> {
    let path = path.as_ref();
    let stream = deadline
        .cap(async { Ok(UnixStream::connect(path).await?) })
        .await?;
    Ok(StreamSocket::new(stream))
}

/// Create a pair of mutually connected Unix-domain bytestreams.
pub fn pair() -> Result<(UnixSocket, UnixSocket)> {
    let (a, b) = UnixStream::pair()?;
    Ok((StreamSocket::new(a), StreamSocket::new(b)))
}

/// A listening Unix-domain socket.
pub struct UnixListener {
    inner: tokio::net::UnixListener,
}

/// Start listening on a filesystem path.
pub fn listen<P: AsRef<Path>>(path: P) -> Result<UnixListener> {
    let inner = tokio::net::UnixListener::bind(path)?;
    Ok(UnixListener { inner })
}

#[async_trait]
impl Listener for UnixListener {
    type Conn = UnixSocket;

    async fn accept(&self, deadline: Deadline) -> Result<UnixSocket> {
        let stream = deadline
            .cap(async {
                loop {
                    match self.inner.accept().await {
                        Ok((stream, _peer)) => return Ok(stream),
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
    async fn test_pair_roundtrip() {
        let (a, b) = pair().unwrap();
        a.sendl(&[b"he", b"llo"], Deadline::NEVER).await.unwrap();
        let mut buf = [0u8; 5];
        b.recv(&mut buf, Deadline::NEVER).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
