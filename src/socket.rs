// ABOUTME: Capability traits every socket in a stack implements
// ABOUTME: Bytestream and Message are the two universal surfaces; Listener accepts connections

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use async_trait::async_trait;

/// An ordered, reliable octet stream.
///
/// Both transfer operations are *all-or-nothing*: they return only when every
/// requested byte has been transferred, the deadline expires, or a fatal
/// error occurs. A partial transfer cut short by the deadline reports
/// [`Error::TimedOut`] with no bookkeeping for resumption; a short read cut
/// off by a graceful close reports [`Error::BrokenPipe`].
///
/// Methods take `&self`; implementations keep per-direction state behind
/// internal locks, so the send and receive directions of one socket can be
/// driven concurrently while calls within one direction serialize.
#[async_trait]
pub trait Bytestream: Send + Sync {
    /// Send every byte of the gather list.
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()>;

    /// Fill the entire scatter list with received bytes.
    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<()>;

    /// Send a single contiguous buffer.
    async fn send(&self, buf: &[u8], deadline: Deadline) -> Result<()> {
        self.sendl(&[buf], deadline).await
    }

    /// Receive into a single contiguous buffer.
    async fn recv(&self, buf: &mut [u8], deadline: Deadline) -> Result<()> {
        self.recvl(&mut [buf], deadline).await
    }

    /// Gracefully half-close the sending direction.
    ///
    /// Supported only where the layer defines a terminator on the wire;
    /// the default reports [`Error::NotSupported`].
    async fn done(&self, deadline: Deadline) -> Result<()> {
        let _ = deadline;
        Err(Error::NotSupported)
    }
}

/// Atomic, bounded datagrams.
///
/// Each call moves exactly one message. `recvl` reports the message length;
/// it fails with [`Error::MessageTooBig`] when the incoming message exceeds
/// the scatter capacity, and the implementation still consumes the wire bytes
/// (or latches the connection) so the stream stays aligned.
#[async_trait]
pub trait Message: Send + Sync {
    /// Send the gather list as one message.
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()>;

    /// Receive one message into the scatter list; returns its length.
    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize>;

    /// Send a single contiguous buffer as one message.
    async fn send(&self, buf: &[u8], deadline: Deadline) -> Result<()> {
        self.sendl(&[buf], deadline).await
    }

    /// Receive one message into a single contiguous buffer.
    async fn recv(&self, buf: &mut [u8], deadline: Deadline) -> Result<usize> {
        self.recvl(&mut [buf], deadline).await
    }

    /// Gracefully half-close the sending direction.
    async fn done(&self, deadline: Deadline) -> Result<()> {
        let _ = deadline;
        Err(Error::NotSupported)
    }
}

/// A socket that accepts inbound connections.
#[async_trait]
pub trait Listener: Send + Sync {
    type Conn;

    /// Wait for the next inbound connection.
    async fn accept(&self, deadline: Deadline) -> Result<Self::Conn>;
}

#[async_trait]
impl<T: Bytestream + ?Sized> Bytestream for Box<T> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        (**self).sendl(iol, deadline).await
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<()> {
        (**self).recvl(iol, deadline).await
    }

    async fn done(&self, deadline: Deadline) -> Result<()> {
        (**self).done(deadline).await
    }
}

#[async_trait]
impl<T: Message + ?Sized> Message for Box<T> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        (**self).sendl(iol, deadline).await
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize> {
        (**self).recvl(iol, deadline).await
    }

    async fn done(&self, deadline: Deadline) -> Result<()> {
        (**self).done(deadline).await
    }
}
