// ABOUTME: Shared bytestream engine over any tokio AsyncRead + AsyncWrite transport
// ABOUTME: Provides all-or-nothing deadline-driven vectored send/recv with a small receive buffer

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::rxbuf::RxBuf;
use crate::socket::Bytestream;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// A [`Bytestream`] over any tokio-compatible duplex transport.
///
/// This is the engine shared by the TCP and Unix-domain transports (and by
/// the in-process stream pair). It splits the transport into halves, keeps
/// per-direction sticky state, and layers the receive buffer under short
/// reads so byte-scanning framers above stay cheap.
///
/// Readiness waits, non-blocking mode and `EINTR`/`EAGAIN` retries live
/// inside tokio; a pipe closed under a send surfaces here as
/// [`Error::ConnectionReset`].
pub struct StreamSocket<T> {
    rd: Mutex<ReadEnd<T>>,
    wr: Mutex<WriteEnd<T>>,
}

struct ReadEnd<T> {
    half: ReadHalf<T>,
    buf: RxBuf,
    fail: bool,
    done: bool,
}

struct WriteEnd<T> {
    half: WriteHalf<T>,
    fail: bool,
    done: bool,
}

impl<T> StreamSocket<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a duplex transport.
    pub fn new(io: T) -> Self {
        let (rd, wr) = tokio::io::split(io);
        StreamSocket {
            rd: Mutex::new(ReadEnd {
                half: rd,
                buf: RxBuf::new(),
                fail: false,
                done: false,
            }),
            wr: Mutex::new(WriteEnd {
                half: wr,
                fail: false,
                done: false,
            }),
        }
    }

    /// Recover the underlying transport. Buffered receive bytes are dropped.
    pub fn into_inner(self) -> T {
        let rd = self.rd.into_inner();
        let wr = self.wr.into_inner();
        rd.half.unsplit(wr.half)
    }

    async fn fill(rd: &mut ReadEnd<T>, iol: &mut [&mut [u8]]) -> Result<()> {
        for slice in iol.iter_mut() {
            let mut filled = 0;
            while filled < slice.len() {
                let dst = &mut slice[filled..];
                let n = rd.buf.consume(dst);
                if n > 0 {
                    filled += n;
                    continue;
                }
                // Buffer is empty. Large remainders bypass it to avoid the
                // extra copy; small ones refill it first.
                if dst.len() >= rd.buf.capacity() {
                    let n = rd.half.read(dst).await?;
                    if n == 0 {
                        return Err(Error::BrokenPipe);
                    }
                    filled += n;
                } else {
                    let writable = rd.buf.writable();
                    let n = rd.half.read(writable).await?;
                    if n == 0 {
                        return Err(Error::BrokenPipe);
                    }
                    rd.buf.filled(n);
                }
            }
        }
        Ok(())
    }

    async fn drain(wr: &mut WriteEnd<T>, iol: &[&[u8]]) -> Result<()> {
        for slice in iol {
            wr.half.write_all(slice).await?;
        }
        wr.half.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<T> Bytestream for StreamSocket<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        let mut wr = self.wr.lock().await;
        if wr.fail {
            return Err(Error::ConnectionReset);
        }
        if wr.done {
            return Err(Error::BrokenPipe);
        }
        let wr = &mut *wr;
        let res = deadline.cap(Self::drain(wr, iol)).await;
        if !matches!(res, Ok(()) | Err(Error::TimedOut)) {
            wr.fail = true;
        }
        res
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<()> {
        let mut rd = self.rd.lock().await;
        if rd.fail {
            return Err(Error::ConnectionReset);
        }
        if rd.done {
            return Err(Error::BrokenPipe);
        }
        let rd = &mut *rd;
        let res = deadline.cap(Self::fill(rd, iol)).await;
        match res {
            Ok(()) | Err(Error::TimedOut) => {}
            Err(Error::BrokenPipe) => rd.done = true,
            Err(_) => rd.fail = true,
        }
        res
    }

    async fn done(&self, deadline: Deadline) -> Result<()> {
        let mut wr = self.wr.lock().await;
        if wr.fail {
            return Err(Error::ConnectionReset);
        }
        if wr.done {
            return Err(Error::BrokenPipe);
        }
        let wr = &mut *wr;
        let res = deadline
            .cap(async { Ok(wr.half.shutdown().await?) })
            .await;
        match res {
            Ok(()) => wr.done = true,
            Err(Error::TimedOut) => {}
            Err(_) => wr.fail = true,
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (StreamSocket<tokio::io::DuplexStream>, StreamSocket<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(4096);
        (StreamSocket::new(a), StreamSocket::new(b))
    }

    #[tokio::test]
    async fn test_all_or_nothing_roundtrip() {
        let (a, b) = pair();
        a.send(b"hello world", Deadline::NEVER).await.unwrap();
        let mut buf = [0u8; 11];
        b.recv(&mut buf, Deadline::NEVER).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn test_gather_scatter_partitions() {
        let (a, b) = pair();
        a.sendl(&[b"ab", b"", b"cdef", b"g"], Deadline::NEVER)
            .await
            .unwrap();
        let mut x = [0u8; 3];
        let mut y = [0u8; 4];
        b.recvl(&mut [&mut x, &mut y], Deadline::NEVER)
            .await
            .unwrap();
        assert_eq!(&x, b"abc");
        assert_eq!(&y, b"defg");
    }

    #[tokio::test]
    async fn test_large_transfer_bypasses_buffer() {
        let (a, b) = pair();
        let big = vec![0x5au8; 8192];
        let (big2, b2) = (big.clone(), b);
        let sender = tokio::spawn(async move {
            a.send(&big2, Deadline::NEVER).await.unwrap();
            a
        });
        let mut out = vec![0u8; 8192];
        b2.recv(&mut out, Deadline::NEVER).await.unwrap();
        assert_eq!(out, big);
        sender.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_deadline() {
        let (_a, b) = pair();
        let mut buf = [0u8; 4];
        let res = b
            .recv(&mut buf, Deadline::after(std::time::Duration::from_millis(20)))
            .await;
        assert_eq!(res, Err(Error::TimedOut));
    }

    #[tokio::test]
    async fn test_eof_reports_broken_pipe() {
        let (a, b) = pair();
        drop(a);
        let mut buf = [0u8; 1];
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await, Err(Error::BrokenPipe));
        // The done flag is sticky.
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await, Err(Error::BrokenPipe));
    }

    #[tokio::test]
    async fn test_done_half_closes_write_side() {
        let (a, b) = pair();
        a.send(b"bye", Deadline::NEVER).await.unwrap();
        a.done(Deadline::NEVER).await.unwrap();
        assert_eq!(a.send(b"x", Deadline::NEVER).await, Err(Error::BrokenPipe));

        let mut buf = [0u8; 3];
        b.recv(&mut buf, Deadline::NEVER).await.unwrap();
        assert_eq!(&buf, b"bye");
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await, Err(Error::BrokenPipe));
    }
}
