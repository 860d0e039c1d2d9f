// ABOUTME: In-process transports for wiring two halves of a stack together
// ABOUTME: A channel-backed message pair plus an in-memory bytestream pair

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::iol;
use crate::socket::Message;
use crate::stream::StreamSocket;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, mpsc};

/// Buffer capacity of the in-memory bytestream pair.
const STREAM_CAPACITY: usize = 16 * 1024;

/// One end of an in-process message pair.
///
/// Messages cross the pair by reference (a cheap [`Bytes`] handle), one at a
/// time. The receiving side enforces the message contract: a message larger
/// than the scatter capacity is dropped and reported as
/// [`Error::MessageTooBig`]. A dropped peer surfaces as
/// [`Error::BrokenPipe`] on both directions.
pub struct InprocSocket {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

/// Create a connected in-process message pair.
pub fn pair() -> (InprocSocket, InprocSocket) {
    let (atx, brx) = mpsc::channel(1);
    let (btx, arx) = mpsc::channel(1);
    (
        InprocSocket {
            tx: atx,
            rx: Mutex::new(arx),
        },
        InprocSocket {
            tx: btx,
            rx: Mutex::new(brx),
        },
    )
}

/// Create a connected in-memory bytestream pair.
///
/// Useful for exercising bytestream framers without touching the kernel.
pub fn stream_pair() -> (
    StreamSocket<tokio::io::DuplexStream>,
    StreamSocket<tokio::io::DuplexStream>,
) {
    let (a, b) = tokio::io::duplex(STREAM_CAPACITY);
    (StreamSocket::new(a), StreamSocket::new(b))
}

#[async_trait]
impl Message for InprocSocket {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        let mut msg = BytesMut::with_capacity(iol::size(iol));
        for chunk in iol {
            msg.extend_from_slice(chunk);
        }
        deadline
            .cap(async {
                self.tx
                    .send(msg.freeze())
                    .await
                    .map_err(|_| Error::BrokenPipe)
            })
            .await
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        let msg = deadline
            .cap(async { rx.recv().await.ok_or(Error::BrokenPipe) })
            .await?;
        if msg.len() > iol::size_mut(iol) {
            return Err(Error::MessageTooBig);
        }
        iol::copy_to(iol, 0, &msg);
        Ok(msg.len())
    }
}
