// ABOUTME: Connected-UDP transport producing message sockets
// ABOUTME: One datagram per send/recv; oversized datagrams report message-too-big

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::iol;
use crate::socket::Message;
use async_trait::async_trait;
use tokio::net::ToSocketAddrs;
use tokio::sync::Mutex;

/// Largest datagram we are prepared to receive.
const MAX_DGRAM: usize = 65536;

/// A connected UDP message socket.
///
/// Each `send` emits one datagram, each `recv` consumes one. A datagram
/// larger than the caller's scatter capacity is dropped and reported as
/// [`Error::MessageTooBig`]; datagram boundaries keep the stream aligned by
/// themselves, so the error is not sticky.
pub struct UdpSocket {
    inner: tokio::net::UdpSocket,
    tx: Mutex<Vec<u8>>,
    rx: Mutex<Vec<u8>>,
}

/// Bind `local` and connect the socket to `remote`.
pub async fn connect<A: ToSocketAddrs, B: ToSocketAddrs>(local: A, remote: B) -> Result<UdpSocket> {
    let inner = tokio::net::UdpSocket::bind(local).await?;
    inner.connect(remote).await?;
    Ok(UdpSocket {
        inner,
        tx: Mutex::new(Vec::new()),
        rx: Mutex::new(vec![0u8; MAX_DGRAM]),
    })
}

impl UdpSocket {
    /// The bound local address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[async_trait]
impl Message for UdpSocket {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        let len = iol::size(iol);
        if len > MAX_DGRAM {
            return Err(Error::MessageTooBig);
        }
        let mut tx = self.tx.lock().await;
        tx.resize(len, 0);
        iol::copy_from(&mut tx, iol, 0, len);
        deadline
            .cap(async {
                self.inner.send(&tx).await?;
                Ok(())
            })
            .await
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        let len = deadline
            .cap(async { Ok(self.inner.recv(&mut rx).await?) })
            .await?;
        if len > iol::size_mut(iol) {
            return Err(Error::MessageTooBig);
        }
        iol::copy_to(iol, 0, &rx[..len]);
        Ok(len)
    }
}
