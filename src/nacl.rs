// ABOUTME: Authenticated-encryption message framer (NaCl secretbox, XSalsa20Poly1305)
// ABOUTME: Wire format per message: 24-byte nonce followed by the secretbox ciphertext

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::iol;
use crate::socket::Message;
use async_trait::async_trait;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::Mutex;

/// Shared-key length in bytes.
pub const KEY_SIZE: usize = 32;
/// Nonce length in bytes.
pub const NONCE_SIZE: usize = 24;
/// Authentication-tag overhead added by the secretbox construction.
const TAG_SIZE: usize = 16;

/// Encrypting framer: every message is encrypted and authenticated with a
/// pre-shared 32-byte key.
///
/// Each side keeps its own 24-byte nonce, seeded from the system entropy
/// source at construction and incremented (little-endian) before every
/// outgoing message; the nonce travels in front of the ciphertext so the
/// receiver uses whatever the sender chose. A message that fails
/// verification is treated as an attack, not a glitch: `recv` reports
/// [`Error::PermissionDenied`] and the inbound direction latches.
pub struct NaclSocket<M> {
    inner: M,
    cipher: XSalsa20Poly1305,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
}

struct TxState {
    nonce: [u8; NONCE_SIZE],
    scratch: Vec<u8>,
}

struct RxState {
    scratch: Vec<u8>,
    fail: bool,
}

impl<M: Message> NaclSocket<M> {
    /// Layer the framer on top of `inner`, taking ownership of it.
    pub fn start(inner: M, key: &[u8; KEY_SIZE]) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        NaclSocket {
            inner,
            cipher: XSalsa20Poly1305::new(Key::from_slice(key)),
            tx: Mutex::new(TxState {
                nonce,
                scratch: Vec::new(),
            }),
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

/// Little-endian increment with carry.
fn bump_nonce(nonce: &mut [u8; NONCE_SIZE]) {
    for byte in nonce.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

#[async_trait]
impl<M: Message> Message for NaclSocket<M> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        let mut tx = self.tx.lock().await;
        bump_nonce(&mut tx.nonce);
        let len = iol::size(iol);
        tx.scratch.resize(len, 0);
        iol::copy_from(&mut tx.scratch, iol, 0, len);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&tx.nonce), tx.scratch.as_slice())
            .map_err(|_| Error::NoMemory)?;
        self.inner
            .sendl(&[tx.nonce.as_slice(), ciphertext.as_slice()], deadline)
            .await
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        if rx.fail {
            return Err(Error::ConnectionReset);
        }
        let capacity = iol::size_mut(iol);
        let need = NONCE_SIZE + TAG_SIZE + capacity;
        rx.scratch.resize(need, 0);
        let rx = &mut *rx;
        let len = {
            let mut window: [&mut [u8]; 1] = [&mut rx.scratch[..]];
            self.inner.recvl(&mut window, deadline).await?
        };
        if len < NONCE_SIZE + TAG_SIZE {
            rx.fail = true;
            return Err(Error::Protocol);
        }
        let (nonce, ciphertext) = rx.scratch[..len].split_at(NONCE_SIZE);
        let plaintext = match self.cipher.decrypt(Nonce::from_slice(nonce), ciphertext) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                rx.fail = true;
                return Err(Error::PermissionDenied);
            }
        };
        iol::copy_to(iol, 0, &plaintext);
        Ok(plaintext.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inproc;

    const KEY: &[u8; KEY_SIZE] = b"01234567890123456789012345678901";

    #[tokio::test]
    async fn test_encrypted_roundtrip() {
        let (a, b) = inproc::pair();
        let a = NaclSocket::start(a, KEY);
        let b = NaclSocket::start(b, KEY);

        a.sendl(&[b"se", b"cret"], Deadline::NEVER).await.unwrap();
        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf, Deadline::NEVER).await.unwrap();
        assert_eq!(&buf[..n], b"secret");
    }

    #[tokio::test]
    async fn test_ciphertext_differs_from_plaintext() {
        let (a, raw) = inproc::pair();
        let a = NaclSocket::start(a, KEY);
        a.send(b"visible", Deadline::NEVER).await.unwrap();

        let mut wire = [0u8; 128];
        let n = raw.recv(&mut wire, Deadline::NEVER).await.unwrap();
        assert_eq!(n, NONCE_SIZE + TAG_SIZE + 7);
        assert!(!wire[..n].windows(7).any(|w| w == b"visible"));
    }

    #[tokio::test]
    async fn test_nonces_change_per_message() {
        let (a, raw) = inproc::pair();
        let a = NaclSocket::start(a, KEY);
        a.send(b"one", Deadline::NEVER).await.unwrap();
        a.send(b"two", Deadline::NEVER).await.unwrap();

        let mut m1 = [0u8; 64];
        let n1 = raw.recv(&mut m1, Deadline::NEVER).await.unwrap();
        let mut m2 = [0u8; 64];
        let n2 = raw.recv(&mut m2, Deadline::NEVER).await.unwrap();
        assert_eq!(n1, n2);
        assert_ne!(&m1[..NONCE_SIZE], &m2[..NONCE_SIZE]);
    }

    #[tokio::test]
    async fn test_tampered_message_is_rejected_and_latches() {
        let (a, raw) = inproc::pair();
        let (b, raw_b) = inproc::pair();
        let a = NaclSocket::start(a, KEY);
        let b = NaclSocket::start(b, KEY);

        a.send(b"payload", Deadline::NEVER).await.unwrap();
        let mut wire = [0u8; 128];
        let n = raw.recv(&mut wire, Deadline::NEVER).await.unwrap();
        // Flip one ciphertext bit and forward to the receiver.
        wire[NONCE_SIZE + 3] ^= 0x01;
        raw_b.send(&wire[..n], Deadline::NEVER).await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(
            b.recv(&mut buf, Deadline::NEVER).await,
            Err(Error::PermissionDenied)
        );
        assert_eq!(
            b.recv(&mut buf, Deadline::NEVER).await,
            Err(Error::ConnectionReset)
        );
    }

    #[test]
    fn test_bump_nonce_carries() {
        let mut nonce = [0xffu8; NONCE_SIZE];
        nonce[2] = 7;
        bump_nonce(&mut nonce);
        assert_eq!(nonce[0], 0);
        assert_eq!(nonce[1], 0);
        assert_eq!(nonce[2], 8);
    }
}
