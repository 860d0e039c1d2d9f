// ABOUTME: WebSocket binary framer (RFC 6455 framing subset) over a bytestream
// ABOUTME: Data frames with fragmentation, client-side masking, ping/pong and close handling

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::iol;
use crate::socket::{Bytestream, Message};
use async_trait::async_trait;
use num_enum::TryFromPrimitive;
use tokio::sync::Mutex;

/// Staging buffer used to mask outgoing payloads in chunks.
const STAGING_SIZE: usize = 2048;

/// Largest control-frame payload allowed by RFC 6455 §5.5.
const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcodes recognised on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// WebSocket framer: binary message exchange plus control-frame servicing.
///
/// The client role sends masked frames (opcode `0x2`, `MASK=1`) and expects
/// unmasked frames from the server; the server role is the mirror image.
/// A frame masked the wrong way, an unknown opcode or a set RSV bit is a
/// protocol violation that latches the inbound direction.
///
/// Control frames are serviced inside `recv`: a Ping is answered with a Pong
/// carrying the same payload, a Pong is consumed silently, and a Close is
/// answered with a Close (once) after which `recv` reports
/// [`Error::BrokenPipe`]. Text frames are carried like binary ones; this
/// layer does not validate UTF-8.
pub struct WebSocket<S> {
    inner: S,
    client: bool,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
}

struct TxState {
    fail: bool,
    done: bool,
    staging: Box<[u8; STAGING_SIZE]>,
}

struct RxState {
    fail: bool,
    done: bool,
}

struct FrameHeader {
    fin: bool,
    opcode: Opcode,
    len: u64,
    mask: Option<[u8; 4]>,
}

impl<S: Bytestream> WebSocket<S> {
    /// Layer a client-role framer on top of `inner`.
    pub fn client(inner: S) -> Self {
        Self::start(inner, true)
    }

    /// Layer a server-role framer on top of `inner`.
    pub fn server(inner: S) -> Self {
        Self::start(inner, false)
    }

    fn start(inner: S, client: bool) -> Self {
        WebSocket {
            inner,
            client,
            tx: Mutex::new(TxState {
                fail: false,
                done: false,
                staging: Box::new([0u8; STAGING_SIZE]),
            }),
            rx: Mutex::new(RxState {
                fail: false,
                done: false,
            }),
        }
    }

    /// Complete the close handshake and hand back the underlying socket.
    ///
    /// Sends a Close frame if this side has not sent one yet, then discards
    /// inbound frames until the peer's Close arrives.
    pub async fn stop(self, deadline: Deadline) -> Result<S> {
        {
            let mut tx = self.tx.lock().await;
            if tx.fail {
                return Err(Error::ConnectionReset);
            }
            if !tx.done {
                self.send_close(&mut tx, deadline).await?;
            }
        }
        loop {
            match self.discard_message(deadline).await {
                Ok(()) => continue,
                Err(Error::BrokenPipe) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(self.inner)
    }

    async fn send_close(&self, tx: &mut TxState, deadline: Deadline) -> Result<()> {
        match Self::write_frame(
            &self.inner,
            tx.staging.as_mut(),
            self.client,
            Opcode::Close,
            &[],
            deadline,
        )
        .await
        {
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

    /// Emit one frame. `masked` selects the client wire form; the mask key is
    /// freshly generated per frame.
    async fn write_frame(
        inner: &S,
        staging: &mut [u8; STAGING_SIZE],
        masked: bool,
        opcode: Opcode,
        payload: &[&[u8]],
        deadline: Deadline,
    ) -> Result<()> {
        let len = iol::size(payload);
        let mut hdr = [0u8; 14];
        hdr[0] = 0x80 | opcode as u8;
        let mut hdr_len = 2;
        if len > 0xffff {
            hdr[1] = 127;
            hdr[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            hdr_len = 10;
        } else if len > 125 {
            hdr[1] = 126;
            hdr[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            hdr_len = 4;
        } else {
            hdr[1] = len as u8;
        }
        if !masked {
            let mut vec: Vec<&[u8]> = Vec::with_capacity(payload.len() + 1);
            vec.push(&hdr[..hdr_len]);
            vec.extend_from_slice(payload);
            return inner.sendl(&vec, deadline).await;
        }
        let mask: [u8; 4] = rand::random();
        hdr[1] |= 0x80;
        hdr[hdr_len..hdr_len + 4].copy_from_slice(&mask);
        hdr_len += 4;
        inner.send(&hdr[..hdr_len], deadline).await?;
        let mut pos = 0;
        while pos < len {
            let chunk = (len - pos).min(STAGING_SIZE);
            iol::copy_from(&mut staging[..chunk], payload, pos, chunk);
            for i in 0..chunk {
                staging[i] ^= mask[(pos + i) % 4];
            }
            inner.send(&staging[..chunk], deadline).await?;
            pos += chunk;
        }
        Ok(())
    }

    /// Parse one frame header off the wire, including the extended length
    /// and the mask key.
    async fn read_header(&self, deadline: Deadline) -> Result<FrameHeader> {
        let mut hdr = [0u8; 2];
        self.inner.recv(&mut hdr, deadline).await?;
        if hdr[0] & 0x70 != 0 {
            return Err(Error::Protocol);
        }
        let opcode = Opcode::try_from(hdr[0] & 0x0f).map_err(|_| Error::Protocol)?;
        let fin = hdr[0] & 0x80 != 0;
        let masked = hdr[1] & 0x80 != 0;
        let mut len = (hdr[1] & 0x7f) as u64;
        if len == 126 {
            let mut ext = [0u8; 2];
            self.inner.recv(&mut ext, deadline).await?;
            len = u16::from_be_bytes(ext) as u64;
        } else if len == 127 {
            let mut ext = [0u8; 8];
            self.inner.recv(&mut ext, deadline).await?;
            len = u64::from_be_bytes(ext);
        }
        // Each side rejects a frame masked the wrong way round.
        if masked == self.client {
            return Err(Error::Protocol);
        }
        let mask = if masked {
            let mut key = [0u8; 4];
            self.inner.recv(&mut key, deadline).await?;
            Some(key)
        } else {
            None
        };
        Ok(FrameHeader {
            fin,
            opcode,
            len,
            mask,
        })
    }

    /// Read and unmask a control-frame payload.
    async fn read_control_payload(
        &self,
        hdr: &FrameHeader,
        deadline: Deadline,
    ) -> Result<([u8; MAX_CONTROL_PAYLOAD], usize)> {
        let mut payload = [0u8; MAX_CONTROL_PAYLOAD];
        if !hdr.fin || hdr.len as usize > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol);
        }
        let len = hdr.len as usize;
        self.inner.recv(&mut payload[..len], deadline).await?;
        if let Some(mask) = hdr.mask {
            for (i, byte) in payload[..len].iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }
        Ok((payload, len))
    }

    /// Service a control frame. Returns `Err(BrokenPipe)` for Close.
    async fn handle_control(
        &self,
        rx: &mut RxState,
        hdr: &FrameHeader,
        deadline: Deadline,
    ) -> Result<()> {
        let (payload, len) = match self.read_control_payload(hdr, deadline).await {
            Ok(p) => p,
            Err(e) => {
                rx.fail = true;
                return Err(e);
            }
        };
        match hdr.opcode {
            Opcode::Ping => {
                let mut tx = self.tx.lock().await;
                if !tx.fail && !tx.done {
                    let staging = tx.staging.as_mut();
                    if Self::write_frame(
                        &self.inner,
                        // Clients mask control frames as well.
                        staging,
                        self.client,
                        Opcode::Pong,
                        &[&payload[..len]],
                        deadline,
                    )
                    .await
                    .is_err()
                    {
                        tx.fail = true;
                    }
                }
                Ok(())
            }
            Opcode::Pong => Ok(()),
            Opcode::Close => {
                rx.done = true;
                let mut tx = self.tx.lock().await;
                if !tx.fail && !tx.done {
                    let _ = self.send_close(&mut tx, deadline).await;
                }
                Err(Error::BrokenPipe)
            }
            _ => unreachable!("data opcode routed to control handler"),
        }
    }

    /// Receive and discard one message; used by the stop handshake.
    async fn discard_message(&self, deadline: Deadline) -> Result<()> {
        let mut rx = self.rx.lock().await;
        if rx.fail {
            return Err(Error::ConnectionReset);
        }
        if rx.done {
            return Err(Error::BrokenPipe);
        }
        let mut scratch = [0u8; 512];
        loop {
            let hdr = match self.read_header(deadline).await {
                Ok(hdr) => hdr,
                Err(e) => {
                    rx.fail = true;
                    return Err(e);
                }
            };
            if hdr.opcode.is_control() {
                self.handle_control(&mut rx, &hdr, deadline).await?;
                continue;
            }
            let mut remaining = hdr.len;
            while remaining > 0 {
                let take = remaining.min(scratch.len() as u64) as usize;
                if let Err(e) = self.inner.recv(&mut scratch[..take], deadline).await {
                    rx.fail = true;
                    return Err(e);
                }
                remaining -= take as u64;
            }
            if hdr.fin {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl<S: Bytestream> Message for WebSocket<S> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        let mut tx = self.tx.lock().await;
        if tx.fail {
            return Err(Error::ConnectionReset);
        }
        if tx.done {
            return Err(Error::BrokenPipe);
        }
        let tx = &mut *tx;
        if let Err(e) = Self::write_frame(
            &self.inner,
            tx.staging.as_mut(),
            self.client,
            Opcode::Binary,
            iol,
            deadline,
        )
        .await
        {
            tx.fail = true;
            return Err(e);
        }
        Ok(())
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        if rx.fail {
            return Err(Error::ConnectionReset);
        }
        if rx.done {
            return Err(Error::BrokenPipe);
        }
        let capacity = iol::size_mut(iol);
        let mut pos = 0usize;
        loop {
            let hdr = match self.read_header(deadline).await {
                Ok(hdr) => hdr,
                Err(e) => {
                    rx.fail = true;
                    return Err(e);
                }
            };
            if hdr.opcode.is_control() {
                self.handle_control(&mut rx, &hdr, deadline).await?;
                continue;
            }
            if hdr.len > (capacity - pos) as u64 {
                rx.fail = true;
                return Err(Error::MessageTooBig);
            }
            let len = hdr.len as usize;
            let mut window = iol::cut_mut(iol, pos, len);
            if let Err(e) = self.inner.recvl(&mut window, deadline).await {
                rx.fail = true;
                return Err(e);
            }
            if let Some(mask) = hdr.mask {
                let mut mpos = 0;
                for chunk in window.iter_mut() {
                    for byte in chunk.iter_mut() {
                        *byte ^= mask[mpos % 4];
                        mpos += 1;
                    }
                }
            }
            pos += len;
            if hdr.fin {
                return Ok(pos);
            }
        }
    }

    async fn done(&self, deadline: Deadline) -> Result<()> {
        let mut tx = self.tx.lock().await;
        if tx.fail {
            return Err(Error::ConnectionReset);
        }
        if tx.done {
            return Err(Error::BrokenPipe);
        }
        self.send_close(&mut tx, deadline).await
    }
}
