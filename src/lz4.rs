// ABOUTME: LZ4 frame-compression message framer
// ABOUTME: One self-describing LZ4 frame per message; content size is a required header field

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::iol;
use crate::socket::Message;
use async_trait::async_trait;
use lz4_flex::frame::{FrameDecoder, FrameEncoder, FrameInfo};
use std::io::{Read, Write};
use tokio::sync::Mutex;

/// LZ4 frame magic number, little-endian on the wire.
const FRAME_MAGIC: u32 = 0x184D2204;
/// FLG bit signalling that the content-size field is present.
const FLG_CONTENT_SIZE: u8 = 0x08;
/// Frame-header overhead budgeted on top of the worst-case block size.
const FRAME_OVERHEAD: usize = 64;

/// Compressing framer: each message travels as one LZ4 frame.
///
/// The frame's content-size header field carries the original length; that
/// is how the receiver sizes its output, so a frame without it (or with a
/// zero size) is rejected as a protocol violation. A frame that would
/// decompress beyond the caller's capacity is rejected with
/// [`Error::MessageTooBig`] before any decompression happens.
pub struct Lz4Socket<M> {
    inner: M,
    tx: Mutex<Vec<u8>>,
    rx: Mutex<RxState>,
}

struct RxState {
    scratch: Vec<u8>,
    fail: bool,
}

impl<M: Message> Lz4Socket<M> {
    /// Layer the framer on top of `inner`, taking ownership of it.
    pub fn start(inner: M) -> Self {
        Lz4Socket {
            inner,
            tx: Mutex::new(Vec::new()),
            rx: Mutex::new(RxState {
                scratch: Vec::new(),
                fail: false,
            }),
        }
    }

    /// Detach the framer and hand back the underlying socket.
    pub fn stop(self) -> M {
        self.inner
    }
}

/// Extract the content size from an LZ4 frame header.
fn frame_content_size(frame: &[u8]) -> Result<u64> {
    if frame.len() < 14 || frame[..4] != FRAME_MAGIC.to_le_bytes() {
        return Err(Error::Protocol);
    }
    let flg = frame[4];
    if flg & FLG_CONTENT_SIZE == 0 {
        return Err(Error::Protocol);
    }
    // Magic (4), FLG (1), BD (1), then the 8-byte little-endian size.
    let mut size = [0u8; 8];
    size.copy_from_slice(&frame[6..14]);
    Ok(u64::from_le_bytes(size))
}

#[async_trait]
impl<M: Message> Message for Lz4Socket<M> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        let len = iol::size(iol);
        // A zero content size is indistinguishable from an absent one on
        // the wire, so empty messages cannot be framed.
        if len == 0 {
            return Err(Error::InvalidArgument);
        }
        let mut tx = self.tx.lock().await;
        tx.resize(len, 0);
        iol::copy_from(&mut tx, iol, 0, len);

        let mut info = FrameInfo::new();
        info.content_size = Some(len as u64);
        let mut encoder = FrameEncoder::with_frame_info(
            info,
            Vec::with_capacity(lz4_flex::block::get_maximum_output_size(len) + FRAME_OVERHEAD),
        );
        encoder.write_all(&tx).map_err(|_| Error::NoMemory)?;
        let compressed = encoder.finish().map_err(|_| Error::NoMemory)?;
        self.inner.sendl(&[compressed.as_slice()], deadline).await
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        if rx.fail {
            return Err(Error::ConnectionReset);
        }
        let capacity = iol::size_mut(iol);
        let need = lz4_flex::block::get_maximum_output_size(capacity) + FRAME_OVERHEAD;
        rx.scratch.resize(need, 0);
        let rx = &mut *rx;
        let len = {
            let mut window: [&mut [u8]; 1] = [&mut rx.scratch[..]];
            self.inner.recvl(&mut window, deadline).await?
        };
        let content_size = match frame_content_size(&rx.scratch[..len]) {
            Ok(size) => size,
            Err(e) => {
                rx.fail = true;
                return Err(e);
            }
        };
        if content_size == 0 {
            rx.fail = true;
            return Err(Error::Protocol);
        }
        if content_size > capacity as u64 {
            return Err(Error::MessageTooBig);
        }
        let mut decoder = FrameDecoder::new(&rx.scratch[..len]);
        let mut plain = vec![0u8; content_size as usize];
        if decoder.read_exact(&mut plain).is_err() {
            rx.fail = true;
            return Err(Error::Protocol);
        }
        // The frame must not hide extra bytes beyond the declared size.
        let mut probe = [0u8; 1];
        match decoder.read(&mut probe) {
            Ok(0) => {}
            _ => {
                rx.fail = true;
                return Err(Error::Protocol);
            }
        }
        iol::copy_to(iol, 0, &plain);
        Ok(plain.len())
    }
}
