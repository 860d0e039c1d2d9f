//! Composable network-transport protocol adapters.
//!
//! Every socket in this crate is a value exposing one of two capability
//! surfaces — [`Bytestream`] (ordered octets) or [`Message`] (atomic
//! datagrams) — and adapters wrap an underlying socket to add exactly one
//! concern: framing ([`pfx`], [`crlf`], [`websock`]), traffic shaping
//! ([`nagle`], [`throttler`], [`keepalive`]), transformation ([`nacl`],
//! [`lz4`]) or observation ([`trace`]). Concrete transports ([`tcp`],
//! [`unix`], [`udp`], [`inproc`]) sit at the bottom.
//!
//! Adapters stack freely. Construction is move-like: `start` takes ownership
//! of the underlying socket and `stop` hands it back, so a stack is built
//! once and then used through its top socket:
//!
//! ```rust,no_run
//! use sockstack::{Deadline, Message};
//! use sockstack::{pfx::PfxSocket, nacl::NaclSocket};
//!
//! # async fn run() -> sockstack::Result<()> {
//! let tcp = sockstack::tcp::connect("127.0.0.1:5555", Deadline::NEVER).await?;
//! let framed = PfxSocket::start(tcp);
//! let encrypted = NaclSocket::start(framed, b"01234567890123456789012345678901");
//!
//! encrypted.send(b"hello", Deadline::NEVER).await?;
//! let mut buf = [0u8; 64];
//! let n = encrypted.recv(&mut buf, Deadline::NEVER).await?;
//! println!("peer says: {:?}", &buf[..n]);
//! # Ok(())
//! # }
//! ```
//!
//! Every suspending operation takes a [`Deadline`]; errors come from the
//! closed [`Error`] set, with per-direction sticky latching on the stateful
//! adapters (see [`Error`] for the semantics).

pub mod crlf;
pub mod deadline;
pub mod error;
pub mod inproc;
pub mod iol;
pub mod keepalive;
pub mod lz4;
pub mod nacl;
pub mod nagle;
pub mod pfx;
mod rxbuf;
pub mod socket;
pub mod stream;
pub mod tcp;
pub mod throttler;
pub mod trace;
pub mod udp;
pub mod unix;
pub mod websock;


pub use deadline::Deadline;
pub use error::{Error, Result};
pub use socket::{Bytestream, Listener, Message};
