// ABOUTME: Token-bucket throttlers for bytestream and message sockets
// ABOUTME: Bucket refills to capacity every interval, measured from its last exhaustion

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::iol;
use crate::socket::{Bytestream, Message};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Throughput limit for one direction: `throughput` units per second,
/// enforced in bursts of one bucket per `interval`.
#[derive(Debug, Clone, Copy)]
pub struct Rate {
    /// Units (bytes or messages) per second.
    pub throughput: u64,
    /// Bucket refill period.
    pub interval: Duration,
}

impl Rate {
    pub fn new(throughput: u64, interval: Duration) -> Self {
        Rate {
            throughput,
            interval,
        }
    }
}

struct Bucket {
    full: usize,
    remaining: usize,
    interval: Duration,
    last: Instant,
}

impl Bucket {
    fn start(rate: Rate) -> Result<Self> {
        if rate.throughput == 0 || rate.interval.is_zero() {
            return Err(Error::InvalidArgument);
        }
        let full = (rate.throughput as u128 * rate.interval.as_millis() / 1000) as usize;
        if full == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Bucket {
            full,
            remaining: full,
            interval: rate.interval,
            last: Instant::now(),
        })
    }

    /// Sleep until the bucket refills, honoring the caller's deadline.
    async fn refill(&mut self, deadline: Deadline) -> Result<()> {
        let at = self.last + self.interval;
        if let Some(user) = deadline.instant() {
            if user < at {
                tokio::time::sleep_until(user).await;
                return Err(Error::TimedOut);
            }
        }
        tokio::time::sleep_until(at).await;
        self.remaining = self.full;
        self.last = Instant::now();
        Ok(())
    }
}

/// Byte-level token-bucket throttler.
///
/// The bucket holds `throughput * interval / 1000` bytes. A transfer that
/// exceeds the remaining tokens proceeds in slices: the permitted prefix is
/// forwarded (the gather list is cut so the suffix is carried exactly), then
/// the throttler sleeps until the refill point. A direction without a
/// configured rate is passthrough.
pub struct ByteThrottler<S> {
    inner: S,
    tx: Mutex<Option<Bucket>>,
    rx: Mutex<Option<Bucket>>,
}

impl<S: Bytestream> ByteThrottler<S> {
    /// Layer the throttler on top of `inner`, taking ownership of it.
    /// `send`/`recv` rates may be configured independently.
    pub fn start(inner: S, send: Option<Rate>, recv: Option<Rate>) -> Result<Self> {
        Ok(ByteThrottler {
            inner,
            tx: Mutex::new(send.map(Bucket::start).transpose()?),
            rx: Mutex::new(recv.map(Bucket::start).transpose()?),
        })
    }

    /// Detach the throttler and hand back the underlying socket.
    pub fn stop(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: Bytestream> Bytestream for ByteThrottler<S> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let Some(bucket) = guard.as_mut() else {
            return self.inner.sendl(iol, deadline).await;
        };
        let mut bytes = iol::size(iol);
        if bytes == 0 {
            return Ok(());
        }
        let mut pos = 0;
        loop {
            if bucket.remaining > 0 {
                let tosend = bytes.min(bucket.remaining);
                let window = iol::cut(iol, pos, tosend);
                self.inner.sendl(&window, deadline).await?;
                bucket.remaining -= tosend;
                pos += tosend;
                bytes -= tosend;
                if bytes == 0 {
                    return Ok(());
                }
            }
            bucket.refill(deadline).await?;
        }
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<()> {
        let mut guard = self.rx.lock().await;
        let Some(bucket) = guard.as_mut() else {
            return self.inner.recvl(iol, deadline).await;
        };
        let mut bytes = iol::size_mut(iol);
        if bytes == 0 {
            return Ok(());
        }
        let mut pos = 0;
        loop {
            if bucket.remaining > 0 {
                let torecv = bytes.min(bucket.remaining);
                let mut window = iol::cut_mut(iol, pos, torecv);
                self.inner.recvl(&mut window, deadline).await?;
                bucket.remaining -= torecv;
                pos += torecv;
                bytes -= torecv;
                if bytes == 0 {
                    return Ok(());
                }
            }
            bucket.refill(deadline).await?;
        }
    }

    async fn done(&self, deadline: Deadline) -> Result<()> {
        self.inner.done(deadline).await
    }
}

/// Message-level token-bucket throttler. A message costs one token
/// regardless of its size.
pub struct MsgThrottler<M> {
    inner: M,
    tx: Mutex<Option<Bucket>>,
    rx: Mutex<Option<Bucket>>,
}

impl<M: Message> MsgThrottler<M> {
    /// Layer the throttler on top of `inner`, taking ownership of it.
    pub fn start(inner: M, send: Option<Rate>, recv: Option<Rate>) -> Result<Self> {
        Ok(MsgThrottler {
            inner,
            tx: Mutex::new(send.map(Bucket::start).transpose()?),
            rx: Mutex::new(recv.map(Bucket::start).transpose()?),
        })
    }

    /// Detach the throttler and hand back the underlying socket.
    pub fn stop(self) -> M {
        self.inner
    }
}

#[async_trait]
impl<M: Message> Message for MsgThrottler<M> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let Some(bucket) = guard.as_mut() else {
            return self.inner.sendl(iol, deadline).await;
        };
        loop {
            if bucket.remaining > 0 {
                self.inner.sendl(iol, deadline).await?;
                bucket.remaining -= 1;
                return Ok(());
            }
            bucket.refill(deadline).await?;
        }
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize> {
        let mut guard = self.rx.lock().await;
        let Some(bucket) = guard.as_mut() else {
            return self.inner.recvl(iol, deadline).await;
        };
        loop {
            if bucket.remaining > 0 {
                let len = self.inner.recvl(iol, deadline).await?;
                bucket.remaining -= 1;
                return Ok(len);
            }
            bucket.refill(deadline).await?;
        }
    }

    async fn done(&self, deadline: Deadline) -> Result<()> {
        self.inner.done(deadline).await
    }
}
