// ABOUTME: Keep-alive adapter for message sockets
// ABOUTME: Background beacon sender plus a liveness deadline on the receive path

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::iol;
use crate::socket::Message;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Configuration for the keep-alive adapter.
///
/// `send_interval` controls how long the outbound direction may stay silent
/// before a beacon is emitted; `recv_interval` is the liveness deadline on
/// the inbound direction. Either may be disabled independently.
///
/// # Example
///
/// ```rust
/// use sockstack::keepalive::KeepAliveConfig;
/// use std::time::Duration;
///
/// let config = KeepAliveConfig::new(b"KEEPALIVE".as_slice())
///     .with_send_interval(Duration::from_millis(50))
///     .with_recv_interval(Duration::from_millis(150));
/// ```
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Emit a beacon when nothing was sent for this long. `None` disables
    /// the background sender.
    pub send_interval: Option<Duration>,
    /// Consider the peer dead when nothing arrives for this long. `None`
    /// disables the liveness deadline.
    pub recv_interval: Option<Duration>,
    /// The heartbeat payload both peers recognise and discard.
    pub beacon: Bytes,
}

impl KeepAliveConfig {
    /// Configuration with the given beacon and both directions disabled.
    pub fn new(beacon: impl Into<Bytes>) -> Self {
        KeepAliveConfig {
            send_interval: None,
            recv_interval: None,
            beacon: beacon.into(),
        }
    }

    /// Enable beacon emission after `interval` of outbound silence.
    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = Some(interval);
        self
    }

    /// Enable the inbound liveness deadline.
    pub fn with_recv_interval(mut self, interval: Duration) -> Self {
        self.recv_interval = Some(interval);
        self
    }
}

type SendRequest = (Bytes, oneshot::Sender<Result<()>>);

/// Keep-alive adapter: layers heartbeat emission and liveness monitoring on
/// a [`Message`] socket without changing the layers below.
///
/// When the send side is enabled, user sends rendezvous with a background
/// task that also owns the beacon timer, so "real traffic resets the timer"
/// falls out for free. When the receive side is enabled, `recv` uses
/// `min(user deadline, last_recv + recv_interval)`; expiry at the liveness
/// deadline is reported as [`Error::ConnectionReset`] — the peer is
/// considered dead, which is not the same thing as the caller's timeout.
/// Beacon messages arriving from the peer are dropped and `recv` retries.
pub struct KeepAlive<M: Message + 'static> {
    inner: Arc<M>,
    config: KeepAliveConfig,
    sendch: Option<mpsc::Sender<SendRequest>>,
    worker: Option<JoinHandle<()>>,
    last_recv: std::sync::Mutex<Instant>,
}

impl<M: Message + 'static> KeepAlive<M> {
    /// Layer the adapter on top of `inner`, taking ownership of it.
    pub fn start(inner: M, config: KeepAliveConfig) -> Self {
        let inner = Arc::new(inner);
        let (sendch, worker) = match config.send_interval {
            None => (None, None),
            Some(interval) => {
                let (tx, rx) = mpsc::channel(1);
                let handle = tokio::spawn(sender_loop(
                    Arc::clone(&inner),
                    interval,
                    config.beacon.clone(),
                    rx,
                ));
                (Some(tx), Some(handle))
            }
        };
        KeepAlive {
            inner,
            config,
            sendch,
            worker,
            last_recv: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// Detach the adapter and hand back the underlying socket. The
    /// background sender is stopped first; no terminal handshake is
    /// involved at this layer.
    pub async fn stop(self) -> Result<M> {
        let KeepAlive {
            inner,
            sendch,
            worker,
            ..
        } = self;
        drop(sendch);
        if let Some(handle) = worker {
            let _ = handle.await;
        }
        Ok(Arc::into_inner(inner).expect("keep-alive worker released its socket reference"))
    }

    fn stamp_recv(&self) {
        *self.last_recv.lock().unwrap() = Instant::now();
    }

    /// Whether the received message equals the beacon payload.
    fn is_beacon(&self, iol: &[&mut [u8]], len: usize) -> bool {
        let beacon = &self.config.beacon;
        if len != beacon.len() {
            return false;
        }
        let mut offset = 0;
        for chunk in iol {
            let take = chunk.len().min(len - offset);
            if chunk[..take] != beacon[offset..offset + take] {
                return false;
            }
            offset += take;
            if offset == len {
                break;
            }
        }
        true
    }
}

/// Background task owning the outbound direction.
async fn sender_loop<M: Message>(
    sock: Arc<M>,
    interval: Duration,
    beacon: Bytes,
    mut requests: mpsc::Receiver<SendRequest>,
) {
    let mut last_sent = Instant::now();
    loop {
        tokio::select! {
            req = requests.recv() => {
                let Some((msg, ack)) = req else { return };
                let res = sock.send(&msg, Deadline::NEVER).await;
                let failed = res.is_err();
                let _ = ack.send(res);
                if failed {
                    return;
                }
                last_sent = Instant::now();
            }
            _ = tokio::time::sleep_until(last_sent + interval) => {
                if sock.send(&beacon, Deadline::NEVER).await.is_err() {
                    return;
                }
                last_sent = Instant::now();
            }
        }
    }
}

#[async_trait]
impl<M: Message + 'static> Message for KeepAlive<M> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        let Some(sendch) = &self.sendch else {
            return self.inner.sendl(iol, deadline).await;
        };
        let mut msg = BytesMut::with_capacity(iol::size(iol));
        for chunk in iol {
            msg.extend_from_slice(chunk);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        deadline
            .cap(async {
                sendch
                    .send((msg.freeze(), ack_tx))
                    .await
                    .map_err(|_| Error::ConnectionReset)?;
                ack_rx.await.map_err(|_| Error::ConnectionReset)?
            })
            .await
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize> {
        loop {
            let (effective, liveness) = match self.config.recv_interval {
                None => (deadline, false),
                Some(interval) => {
                    let expiry = *self.last_recv.lock().unwrap() + interval;
                    match deadline.instant() {
                        Some(user) if user <= expiry => (deadline, false),
                        _ => (Deadline::at(expiry), true),
                    }
                }
            };
            match self.inner.recvl(iol, effective).await {
                Err(Error::TimedOut) if liveness => return Err(Error::ConnectionReset),
                Err(e) => return Err(e),
                Ok(len) => {
                    self.stamp_recv();
                    if self.is_beacon(iol, len) {
                        continue;
                    }
                    return Ok(len);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inproc;

    fn config() -> KeepAliveConfig {
        KeepAliveConfig::new(b"KEEPALIVE".as_slice())
            .with_send_interval(Duration::from_millis(50))
            .with_recv_interval(Duration::from_millis(150))
    }

    #[tokio::test(start_paused = true)]
    async fn test_beacon_emitted_when_idle() {
        let (a, b) = inproc::pair();
        let _ka = KeepAlive::start(a, config());

        let start = Instant::now();
        let mut buf = [0u8; 32];
        let n = b.recv(&mut buf, Deadline::NEVER).await.unwrap();
        assert_eq!(&buf[..n], b"KEEPALIVE");
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40) && elapsed <= Duration::from_millis(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_beacons_filtered_on_receive() {
        let (a, b) = inproc::pair();
        let _ka_a = KeepAlive::start(a, config());
        let ka_b = KeepAlive::start(b, KeepAliveConfig::new(b"KEEPALIVE".as_slice()));

        // Only beacons arrive; a user deadline earlier than any liveness
        // cutoff times out normally.
        let mut buf = [0u8; 32];
        let res = ka_b
            .recv(&mut buf, Deadline::after(Duration::from_millis(300)))
            .await;
        assert_eq!(res, Err(Error::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_connection_reset() {
        let (a, _b) = inproc::pair();
        let ka = KeepAlive::start(
            a,
            KeepAliveConfig::new(b"BEACON".as_slice())
                .with_recv_interval(Duration::from_millis(150)),
        );
        let start = Instant::now();
        let mut buf = [0u8; 16];
        assert_eq!(
            ka.recv(&mut buf, Deadline::NEVER).await,
            Err(Error::ConnectionReset)
        );
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_sends_reset_beacon_timer() {
        let (a, b) = inproc::pair();
        let ka = KeepAlive::start(a, config());

        // Keep sending every 30 ms; no beacon should ever be emitted.
        let mut buf = [0u8; 32];
        for _ in 0..5 {
            ka.send(b"data", Deadline::NEVER).await.unwrap();
            let n = b.recv(&mut buf, Deadline::NEVER).await.unwrap();
            assert_eq!(&buf[..n], b"data");
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_returns_underlying() {
        let (a, b) = inproc::pair();
        let ka = KeepAlive::start(a, config());
        ka.send(b"msg", Deadline::NEVER).await.unwrap();
        let inner = ka.stop().await.unwrap();
        let mut buf = [0u8; 8];
        let n = b.recv(&mut buf, Deadline::NEVER).await.unwrap();
        assert_eq!(&buf[..n], b"msg");
        inner.send(b"direct", Deadline::NEVER).await.unwrap();
        let n = b.recv(&mut buf, Deadline::NEVER).await.unwrap();
        assert_eq!(&buf[..n], b"direct");
    }
}
