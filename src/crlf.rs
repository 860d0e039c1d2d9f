// ABOUTME: CRLF-delimited message framer over a bytestream
// ABOUTME: Appends \r\n per message; an empty line is the terminator

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::iol;
use crate::socket::{Bytestream, Message};
use async_trait::async_trait;
use tokio::sync::Mutex;

const CRLF: &[u8] = b"\r\n";

/// CRLF framer: messages are arbitrary non-empty octet sequences that do not
/// contain `\r\n`, delimited on the wire by appending `\r\n`.
///
/// Sending a message that is empty or contains an embedded `\r\n` fails with
/// [`Error::InvalidArgument`] and latches the outbound direction: the framer
/// cannot express such a message, and a caller that tried is confused enough
/// that continuing would corrupt the stream.
///
/// The receive path pulls one byte at a time from the underlying bytestream;
/// the transport's receive buffer keeps that affordable. A line longer than
/// the scatter capacity is consumed to its end and reported as
/// [`Error::MessageTooBig`]; since the wire stays aligned, the error is not
/// sticky.
pub struct CrlfSocket<S> {
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

impl<S: Bytestream> CrlfSocket<S> {
    /// Layer the framer on top of `inner`, taking ownership of it.
    pub fn start(inner: S) -> Self {
        CrlfSocket {
            inner,
            tx: Mutex::new(DirState::default()),
            rx: Mutex::new(DirState::default()),
        }
    }

    /// Perform the terminal handshake and hand back the underlying socket.
    pub async fn stop(self, deadline: Deadline) -> Result<S> {
        let send_terminator = {
            let tx = self.tx.lock().await;
            let rx = self.rx.lock().await;
            if tx.fail || rx.fail {
                return Err(Error::ConnectionReset);
            }
            !tx.done
        };
        if send_terminator {
            self.done(deadline).await?;
        }
        loop {
            match self.recvl(&mut [], deadline).await {
                Ok(_) | Err(Error::MessageTooBig) => continue,
                Err(Error::BrokenPipe) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(self.inner)
    }
}

#[async_trait]
impl<S: Bytestream> Message for CrlfSocket<S> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        let mut tx = self.tx.lock().await;
        tx.check()?;
        // Scan the logical concatenation for an embedded CRLF.
        let mut prev = 0u8;
        for chunk in iol {
            for &byte in *chunk {
                if prev == b'\r' && byte == b'\n' {
                    tx.fail = true;
                    return Err(Error::InvalidArgument);
                }
                prev = byte;
            }
        }
        // The empty line is reserved for the terminator.
        if iol::size(iol) == 0 {
            tx.fail = true;
            return Err(Error::InvalidArgument);
        }
        let mut vec: Vec<&[u8]> = Vec::with_capacity(iol.len() + 1);
        vec.extend_from_slice(iol);
        vec.push(CRLF);
        if let Err(e) = self.inner.sendl(&vec, deadline).await {
            tx.fail = true;
            return Err(e);
        }
        Ok(())
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        rx.check()?;
        let capacity = iol::size_mut(iol);
        let mut row = 0;
        let mut col = 0;
        let mut total = 0usize;
        let mut prev = 0u8;
        let mut byte = [0u8; 1];
        loop {
            if let Err(e) = self.inner.recv(&mut byte, deadline).await {
                rx.fail = true;
                return Err(e);
            }
            let cur = byte[0];
            // Store the byte if there is still room; trailing delimiter
            // bytes beyond the returned length are harmless.
            while row < iol.len() && col == iol[row].len() {
                row += 1;
                col = 0;
            }
            if row < iol.len() {
                iol[row][col] = cur;
                col += 1;
            }
            total += 1;
            if prev == b'\r' && cur == b'\n' {
                break;
            }
            prev = cur;
        }
        if total == 2 {
            rx.done = true;
            return Err(Error::BrokenPipe);
        }
        let len = total - 2;
        if len > capacity {
            return Err(Error::MessageTooBig);
        }
        Ok(len)
    }

    async fn done(&self, deadline: Deadline) -> Result<()> {
        let mut tx = self.tx.lock().await;
        tx.check()?;
        if let Err(e) = self.inner.send(CRLF, deadline).await {
            tx.fail = true;
            return Err(e);
        }
        tx.done = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inproc;

    fn framed_pair() -> (
        CrlfSocket<crate::stream::StreamSocket<tokio::io::DuplexStream>>,
        CrlfSocket<crate::stream::StreamSocket<tokio::io::DuplexStream>>,
    ) {
        let (a, b) = inproc::stream_pair();
        (CrlfSocket::start(a), CrlfSocket::start(b))
    }

    #[tokio::test]
    async fn test_line_roundtrip() {
        let (a, b) = framed_pair();
        a.send(b"first", Deadline::NEVER).await.unwrap();
        a.sendl(&[b"sec", b"ond"], Deadline::NEVER).await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"first");
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await.unwrap(), 6);
        assert_eq!(&buf[..6], b"second");
    }

    #[tokio::test]
    async fn test_embedded_crlf_rejected_and_latches() {
        let (a, _b) = framed_pair();
        assert_eq!(
            a.send(b"hi\r\nthere", Deadline::NEVER).await,
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            a.send(b"clean", Deadline::NEVER).await,
            Err(Error::ConnectionReset)
        );
    }

    #[tokio::test]
    async fn test_crlf_split_across_gather_entries() {
        let (a, _b) = framed_pair();
        assert_eq!(
            a.sendl(&[b"hi\r", b"\nthere"], Deadline::NEVER).await,
            Err(Error::InvalidArgument)
        );
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let (a, _b) = framed_pair();
        assert_eq!(a.send(b"", Deadline::NEVER).await, Err(Error::InvalidArgument));
    }

    #[tokio::test]
    async fn test_terminator() {
        let (a, b) = framed_pair();
        a.send(b"last", Deadline::NEVER).await.unwrap();
        a.done(Deadline::NEVER).await.unwrap();
        assert_eq!(a.send(b"x", Deadline::NEVER).await, Err(Error::BrokenPipe));

        let mut buf = [0u8; 8];
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await.unwrap(), 4);
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await, Err(Error::BrokenPipe));
    }

    #[tokio::test]
    async fn test_oversized_line_consumed() {
        let (a, b) = framed_pair();
        a.send(b"overlong", Deadline::NEVER).await.unwrap();
        a.send(b"ok", Deadline::NEVER).await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(
            b.recv(&mut buf, Deadline::NEVER).await,
            Err(Error::MessageTooBig)
        );
        // The long line was consumed whole; the stream is still aligned.
        assert_eq!(b.recv(&mut buf, Deadline::NEVER).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ok");
    }

    #[tokio::test]
    async fn test_stop_handshake() {
        let (a, b) = framed_pair();
        a.send(b"tail", Deadline::NEVER).await.unwrap();
        let a_stop = tokio::spawn(async move { a.stop(Deadline::NEVER).await });
        let _b_stream = b.stop(Deadline::NEVER).await.unwrap();
        a_stop.await.unwrap().unwrap();
    }
}
