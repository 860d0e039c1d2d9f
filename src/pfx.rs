// ABOUTME: Length-prefixed message framer over a bytestream
// ABOUTME: 8-byte big-endian length per message; all-ones length is the terminator

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::iol;
use crate::socket::{Bytestream, Message};
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Wire value signalling that the sender will send no more messages.
const TERMINATOR: u64 = u64::MAX;

/// Chunk size used when discarding payloads during the stop handshake.
const DRAIN_CHUNK: usize = 512;

/// Length-prefixed framer: turns a bytestream into a [`Message`] socket.
///
/// Each message travels as an 8-byte big-endian length followed by the
/// payload. The all-ones length carries no payload and half-closes the
/// sender's direction; the receiver observes it as [`Error::BrokenPipe`].
///
/// # Example
///
/// ```rust,no_run
/// use sockstack::{pfx::PfxSocket, Deadline, Message};
///
/// # async fn run() -> sockstack::Result<()> {
/// let (a, b) = sockstack::inproc::stream_pair();
/// let (a, b) = (PfxSocket::start(a), PfxSocket::start(b));
/// a.send(b"hello", Deadline::NEVER).await?;
/// let mut buf = [0u8; 5];
/// let n = b.recv(&mut buf, Deadline::NEVER).await?;
/// assert_eq!(n, 5);
/// # Ok(())
/// # }
/// ```
pub struct PfxSocket<S> {
    inner: S,
    tx: Mutex<DirState>,
    rx: Mutex<DirState>,
}

#[derive(Default)]
struct DirState {
    fail: bool,
    done: bool,
}

impl DirState {
    fn check(&self) -> Result<()> {
        if self.fail {
            return Err(Error::ConnectionReset);
        }
        if self.done {
            return Err(Error::BrokenPipe);
        }
        Ok(())
    }
}

impl<S: Bytestream> PfxSocket<S> {
    /// Layer the framer on top of `inner`, taking ownership of it.
    pub fn start(inner: S) -> Self {
        PfxSocket {
            inner,
            tx: Mutex::new(DirState::default()),
            rx: Mutex::new(DirState::default()),
        }
    }

    /// Perform the terminal handshake and hand back the underlying socket.
    ///
    /// Sends the terminator if this side has not done so yet, then reads and
    /// discards inbound messages until the peer's terminator arrives. On any
    /// failure the whole stack is torn down instead.
    pub async fn stop(self, deadline: Deadline) -> Result<S> {
        {
            let mut tx = self.tx.lock().await;
            if tx.fail {
                return Err(Error::ConnectionReset);
            }
            if !tx.done {
                Self::send_terminator(&self.inner, &mut tx, deadline).await?;
            }
        }
        loop {
            match self.drain_one(deadline).await {
                Ok(()) => continue,
                Err(Error::BrokenPipe) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(self.inner)
    }

    async fn send_terminator(inner: &S, tx: &mut DirState, deadline: Deadline) -> Result<()> {
        match inner.send(&TERMINATOR.to_be_bytes(), deadline).await {
            Ok(()) => {
                tx.done = true;
                Ok(())
            }
            Err(e) => {
                tx.fail = true;
                Err(e)
            }
        }
    }

    /// Receive one message and throw its payload away.
    async fn drain_one(&self, deadline: Deadline) -> Result<()> {
        let mut rx = self.rx.lock().await;
        rx.check()?;
        let len = match self.read_header(&mut rx, deadline).await {
            Ok(Some(len)) => len,
            Ok(None) => return Err(Error::BrokenPipe),
            Err(e) => return Err(e),
        };
        let mut scratch = [0u8; DRAIN_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let take = remaining.min(DRAIN_CHUNK as u64) as usize;
            if let Err(e) = self.inner.recv(&mut scratch[..take], deadline).await {
                rx.fail = true;
                return Err(e);
            }
            remaining -= take as u64;
        }
        Ok(())
    }

    /// Read the 8-byte prefix. `None` means the terminator was seen and the
    /// inbound direction is now done.
    async fn read_header(&self, rx: &mut DirState, deadline: Deadline) -> Result<Option<u64>> {
        let mut hdr = [0u8; 8];
        if let Err(e) = self.inner.recv(&mut hdr, deadline).await {
            rx.fail = true;
            return Err(e);
        }
        let len = u64::from_be_bytes(hdr);
        if len == TERMINATOR {
            rx.done = true;
            return Ok(None);
        }
        Ok(Some(len))
    }
}

#[async_trait]
impl<S: Bytestream> Message for PfxSocket<S> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        let mut tx = self.tx.lock().await;
        tx.check()?;
        let len = iol::size(iol) as u64;
        let hdr = len.to_be_bytes();
        let mut vec: Vec<&[u8]> = Vec::with_capacity(iol.len() + 1);
        vec.push(&hdr);
        vec.extend_from_slice(iol);
        if let Err(e) = self.inner.sendl(&vec, deadline).await {
            tx.fail = true;
            return Err(e);
        }
        Ok(())
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        rx.check()?;
        let len = match self.read_header(&mut rx, deadline).await? {
            Some(len) => len,
            None => return Err(Error::BrokenPipe),
        };
        if len > iol::size_mut(iol) as u64 {
            // The payload is still on the wire; the stream is misaligned
            // for any further read, so the direction latches.
            rx.fail = true;
            return Err(Error::MessageTooBig);
        }
        let len = len as usize;
        let mut window = iol::cut_mut(iol, 0, len);
        if let Err(e) = self.inner.recvl(&mut window, deadline).await {
            rx.fail = true;
            return Err(e);
        }
        Ok(len)
    }

    async fn done(&self, deadline: Deadline) -> Result<()> {
        let mut tx = self.tx.lock().await;
        tx.check()?;
        Self::send_terminator(&self.inner, &mut tx, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inproc;

    fn framed_pair() -> (
        PfxSocket<crate::stream::StreamSocket<tokio::io::DuplexStream>>,
        PfxSocket<crate::stream::StreamSocket<tokio::io::DuplexStream>>,
    ) {
        let (a, b) = inproc::stream_pair();
        (PfxSocket::start(a), PfxSocket::start(b))
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let (a, b) = framed_pair();
        a.send(b"ABC", Deadline::NEVER).await.unwrap();
        a.sendl(&[b"DE", b"F"], Deadline::NEVER).await.unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await.unwrap(), 3);
        assert_eq!(&buf, b"ABC");
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await.unwrap(), 3);
        assert_eq!(&buf, b"DEF");
    }

    #[tokio::test]
    async fn test_empty_message() {
        let (a, b) = framed_pair();
        a.send(b"", Deadline::NEVER).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_terminator_breaks_pipe() {
        let (a, b) = framed_pair();
        a.send(b"AB", Deadline::NEVER).await.unwrap();
        a.send(b"CDE", Deadline::NEVER).await.unwrap();
        a.done(Deadline::NEVER).await.unwrap();
        // Local side may not send after done.
        assert_eq!(a.send(b"x", Deadline::NEVER).await, Err(Error::BrokenPipe));

        let mut buf = [0u8; 8];
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"AB");
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"CDE");
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await, Err(Error::BrokenPipe));
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await, Err(Error::BrokenPipe));
    }

    #[tokio::test]
    async fn test_message_too_big_latches() {
        let (a, b) = framed_pair();
        a.send(b"hello world", Deadline::NEVER).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            b.recv(&mut buf, Deadline::NEVER).await,
            Err(Error::MessageTooBig)
        );
        assert_eq!(
            b.recv(&mut buf, Deadline::NEVER).await,
            Err(Error::ConnectionReset)
        );
    }

    #[tokio::test]
    async fn test_stop_returns_underlying() {
        let (a, b) = framed_pair();
        a.send(b"tail", Deadline::NEVER).await.unwrap();

        let a_stop = tokio::spawn(async move { a.stop(Deadline::NEVER).await });
        // Peer never reads "tail"; stop drains it on the way out.
        let b_stream = b.stop(Deadline::NEVER).await.unwrap();
        let a_stream = a_stop.await.unwrap().unwrap();
        drop((a_stream, b_stream));
    }

    #[tokio::test]
    async fn test_scatter_across_partitions() {
        let (a, b) = framed_pair();
        a.send(b"partition", Deadline::NEVER).await.unwrap();
        let mut x = [0u8; 4];
        let mut y = [0u8; 8];
        let n = b
            .recvl(&mut [&mut x, &mut y], Deadline::NEVER)
            .await
            .unwrap();
        assert_eq!(n, 9);
        assert_eq!(&x, b"part");
        assert_eq!(&y[..5], b"ition");
    }
}
