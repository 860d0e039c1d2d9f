// ABOUTME: Nagle-style batching adapter for bytestreams
// ABOUTME: Coalesces small sends in a worker-owned buffer, flushing on overflow or timer

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::iol;
use crate::socket::Bytestream;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

enum Request {
    Data(Bytes, oneshot::Sender<Result<()>>),
    Flush(oneshot::Sender<Result<()>>),
}

/// Send-side batching adapter.
///
/// A background task owns a `batch`-sized buffer. Small sends are appended
/// and acknowledged immediately; when a chunk no longer fits, the buffer is
/// flushed first; a chunk of at least `batch` bytes skips the buffer and
/// goes straight to the wire. With an interval configured, buffered bytes
/// are flushed no later than `interval` after the last flush; with `None`
/// they wait for overflow (or `done`/`stop`).
///
/// The receive path is pure passthrough.
pub struct Nagle<S: Bytestream + 'static> {
    inner: Arc<S>,
    sendch: mpsc::Sender<Request>,
    worker: Option<JoinHandle<()>>,
}

impl<S: Bytestream + 'static> Nagle<S> {
    /// Layer the adapter on top of `inner`, taking ownership of it.
    pub fn start(inner: S, batch: usize, interval: Option<Duration>) -> Self {
        let inner = Arc::new(inner);
        let (tx, rx) = mpsc::channel(1);
        let worker = tokio::spawn(sender_loop(Arc::clone(&inner), batch, interval, rx));
        Nagle {
            inner,
            sendch: tx,
            worker: Some(worker),
        }
    }

    /// Flush pending bytes, stop the worker and hand back the underlying
    /// socket.
    pub async fn stop(self, deadline: Deadline) -> Result<S> {
        self.flush(deadline).await?;
        let Nagle {
            inner,
            sendch,
            worker,
        } = self;
        drop(sendch);
        if let Some(handle) = worker {
            let _ = handle.await;
        }
        Ok(Arc::into_inner(inner).expect("nagle worker released its socket reference"))
    }

    /// Push any buffered bytes to the wire now.
    pub async fn flush(&self, deadline: Deadline) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        deadline
            .cap(async {
                self.sendch
                    .send(Request::Flush(ack_tx))
                    .await
                    .map_err(|_| Error::ConnectionReset)?;
                ack_rx.await.map_err(|_| Error::ConnectionReset)?
            })
            .await
    }
}

/// Background task owning the coalescing buffer.
async fn sender_loop<S: Bytestream>(
    sock: Arc<S>,
    batch: usize,
    interval: Option<Duration>,
    mut requests: mpsc::Receiver<Request>,
) {
    let mut buf = BytesMut::with_capacity(batch);
    let mut last_flush = Instant::now();
    loop {
        let req = match interval {
            Some(interval) if !buf.is_empty() => {
                tokio::select! {
                    req = requests.recv() => req,
                    _ = tokio::time::sleep_until(last_flush + interval) => {
                        if sock.send(&buf, Deadline::NEVER).await.is_err() {
                            return;
                        }
                        buf.clear();
                        last_flush = Instant::now();
                        continue;
                    }
                }
            }
            _ => requests.recv().await,
        };
        let Some(req) = req else {
            // Adapter dropped; push out whatever is pending.
            if !buf.is_empty() {
                let _ = sock.send(&buf, Deadline::NEVER).await;
            }
            return;
        };
        match req {
            Request::Flush(ack) => {
                let res = if buf.is_empty() {
                    Ok(())
                } else {
                    sock.send(&buf, Deadline::NEVER).await
                };
                let failed = res.is_err();
                let _ = ack.send(res);
                if failed {
                    return;
                }
                buf.clear();
                last_flush = Instant::now();
            }
            Request::Data(chunk, ack) => {
                // Fits alongside what is buffered: coalesce.
                if buf.len() + chunk.len() < batch {
                    buf.extend_from_slice(&chunk);
                    let _ = ack.send(Ok(()));
                    continue;
                }
                if !buf.is_empty() {
                    if let Err(e) = sock.send(&buf, Deadline::NEVER).await {
                        let _ = ack.send(Err(e));
                        return;
                    }
                    buf.clear();
                    last_flush = Instant::now();
                }
                // Fits into the now-empty buffer: coalesce with later sends.
                if chunk.len() < batch {
                    buf.extend_from_slice(&chunk);
                    let _ = ack.send(Ok(()));
                    continue;
                }
                // A big chunk; no point batching it.
                let res = sock.send(&chunk, Deadline::NEVER).await;
                let failed = res.is_err();
                let _ = ack.send(res);
                if failed {
                    return;
                }
                last_flush = Instant::now();
            }
        }
    }
}

#[async_trait]
impl<S: Bytestream + 'static> Bytestream for Nagle<S> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        let mut chunk = BytesMut::with_capacity(iol::size(iol));
        for slice in iol {
            chunk.extend_from_slice(slice);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        deadline
            .cap(async {
                self.sendch
                    .send(Request::Data(chunk.freeze(), ack_tx))
                    .await
                    .map_err(|_| Error::ConnectionReset)?;
                ack_rx.await.map_err(|_| Error::ConnectionReset)?
            })
            .await
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<()> {
        self.inner.recvl(iol, deadline).await
    }

    async fn done(&self, deadline: Deadline) -> Result<()> {
        self.flush(deadline).await?;
        self.inner.done(deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inproc;
    use tokio::sync::Mutex;

    /// Records every underlying write so coalescing is observable.
    struct WriteRecorder {
        writes: Mutex<Vec<Vec<u8>>>,
    }

    impl WriteRecorder {
        fn new() -> Self {
            WriteRecorder {
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Bytestream for WriteRecorder {
        async fn sendl(&self, iol: &[&[u8]], _deadline: Deadline) -> Result<()> {
            let mut flat = Vec::new();
            for chunk in iol {
                flat.extend_from_slice(chunk);
            }
            self.writes.lock().await.push(flat);
            Ok(())
        }

        async fn recvl(&self, _iol: &mut [&mut [u8]], _deadline: Deadline) -> Result<()> {
            Err(Error::NotSupported)
        }
    }

    #[tokio::test]
    async fn test_small_sends_coalesce_into_one_write() {
        let nagle = Nagle::start(WriteRecorder::new(), 10, None);
        nagle.send(b"12", Deadline::NEVER).await.unwrap();
        nagle.send(b"345", Deadline::NEVER).await.unwrap();
        let recorder = nagle.stop(Deadline::NEVER).await.unwrap();
        let writes = recorder.writes.lock().await;
        assert_eq!(writes.as_slice(), &[b"12345".to_vec()]);
    }

    #[tokio::test]
    async fn test_big_chunk_goes_straight_through() {
        let nagle = Nagle::start(WriteRecorder::new(), 5, None);
        nagle.send(b"123456789", Deadline::NEVER).await.unwrap();
        let recorder = nagle.stop(Deadline::NEVER).await.unwrap();
        let writes = recorder.writes.lock().await;
        assert_eq!(writes.as_slice(), &[b"123456789".to_vec()]);
    }

    #[tokio::test]
    async fn test_overflow_flushes_buffer_first() {
        let nagle = Nagle::start(WriteRecorder::new(), 5, None);
        nagle.send(b"12", Deadline::NEVER).await.unwrap();
        nagle.send(b"34567", Deadline::NEVER).await.unwrap();
        let recorder = nagle.stop(Deadline::NEVER).await.unwrap();
        let writes = recorder.writes.lock().await;
        assert_eq!(writes.as_slice(), &[b"12".to_vec(), b"34567".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_interval_small_chunk_stays_buffered() {
        let (a, b) = inproc::stream_pair();
        let nagle = Nagle::start(a, 5, None);
        nagle.send(b"12", Deadline::NEVER).await.unwrap();
        let mut buf = [0u8; 2];
        let res = b
            .recv(&mut buf, Deadline::after(Duration::from_millis(100)))
            .await;
        assert_eq!(res, Err(Error::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_small_chunk() {
        let (a, b) = inproc::stream_pair();
        let nagle = Nagle::start(a, 5, Some(Duration::from_millis(50)));
        nagle.send(b"12", Deadline::NEVER).await.unwrap();
        let mut buf = [0u8; 2];
        b.recv(&mut buf, Deadline::NEVER).await.unwrap();
        assert_eq!(&buf, b"12");
    }
}
