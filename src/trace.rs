// ABOUTME: Tracing adapters that hex-dump traffic and forward it unchanged
// ABOUTME: Safe to insert at any level of a stack, byte or message

use crate::deadline::Deadline;
use crate::error::Result;
use crate::iol;
use crate::socket::{Bytestream, Message};
use async_trait::async_trait;
use std::fmt::Write;

const TRACE_TARGET: &str = "sockstack::trace";

fn hex_gather(iol: &[&[u8]]) -> String {
    let mut out = String::with_capacity(iol::size(iol) * 2);
    for chunk in iol {
        for byte in *chunk {
            let _ = write!(out, "{byte:02x}");
        }
    }
    out
}

fn hex_scatter(iol: &[&mut [u8]], len: usize) -> String {
    let mut out = String::with_capacity(len * 2);
    let mut remaining = len;
    for chunk in iol {
        let take = chunk.len().min(remaining);
        for byte in &chunk[..take] {
            let _ = write!(out, "{byte:02x}");
        }
        remaining -= take;
        if remaining == 0 {
            break;
        }
    }
    out
}

/// Pass-through bytestream adapter that logs each transfer as hex.
pub struct ByteTrace<S> {
    inner: S,
    label: &'static str,
}

impl<S: Bytestream> ByteTrace<S> {
    /// Layer the tracer on top of `inner`. `label` distinguishes stacks in
    /// the log output.
    pub fn start(inner: S, label: &'static str) -> Self {
        ByteTrace { inner, label }
    }

    /// Detach the tracer and hand back the underlying socket.
    pub fn stop(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: Bytestream> Bytestream for ByteTrace<S> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        tracing::debug!(
            target: TRACE_TARGET,
            "{} send {} bytes: {}",
            self.label,
            iol::size(iol),
            hex_gather(iol)
        );
        self.inner.sendl(iol, deadline).await
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<()> {
        self.inner.recvl(iol, deadline).await?;
        tracing::debug!(
            target: TRACE_TARGET,
            "{} recv {} bytes: {}",
            self.label,
            iol::size_mut(iol),
            hex_scatter(iol, iol::size_mut(iol))
        );
        Ok(())
    }

    async fn done(&self, deadline: Deadline) -> Result<()> {
        tracing::debug!(target: TRACE_TARGET, "{} done", self.label);
        self.inner.done(deadline).await
    }
}

/// Pass-through message adapter that logs each message as hex.
pub struct MsgTrace<M> {
    inner: M,
    label: &'static str,
}

impl<M: Message> MsgTrace<M> {
    /// Layer the tracer on top of `inner`.
    pub fn start(inner: M, label: &'static str) -> Self {
        MsgTrace { inner, label }
    }

    /// Detach the tracer and hand back the underlying socket.
    pub fn stop(self) -> M {
        self.inner
    }
}

#[async_trait]
impl<M: Message> Message for MsgTrace<M> {
    async fn sendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<()> {
        tracing::debug!(
            target: TRACE_TARGET,
            "{} send {} bytes: {}",
            self.label,
            iol::size(iol),
            hex_gather(iol)
        );
        self.inner.sendl(iol, deadline).await
    }

    async fn recvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize> {
        let len = self.inner.recvl(iol, deadline).await?;
        tracing::debug!(
            target: TRACE_TARGET,
            "{} recv {} bytes: {}",
            self.label,
            len,
            hex_scatter(iol, len)
        );
        Ok(len)
    }

    async fn done(&self, deadline: Deadline) -> Result<()> {
        tracing::debug!(target: TRACE_TARGET, "{} done", self.label);
        self.inner.done(deadline).await
    }
}
