//! src/transport/mod.rs
//!
//! The transport abstraction: a uniform bidirectional datagram channel over
//! heterogeneous bearers. The node runtime holds an ordered list of
//! transport instances and drives them symmetrically; it neither knows nor
//! cares whether a frame rides an IP broadcast or a serial radio.

use crate::error::Result;
use async_trait::async_trait;

pub mod serial;
pub mod udp;

/// One received datagram plus an opaque hint about where it came from (an
/// IP address for the broadcast transport, absent for serial).
#[derive(Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub source: Option<String>,
}

/// An abstract bidirectional datagram channel.
///
/// `recv` is a non-blocking poll: `Ok(None)` means no data is currently
/// available. Sends are fire-and-forget; unicast (`dest = Some`) is
/// best-effort and `dest = None` means "broadcast on this link".
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Acquires the underlying resources. On failure the transport is left
    /// unstarted with no side effects.
    async fn start(&self) -> Result<()>;

    async fn send(&self, data: &[u8], dest: Option<&str>) -> Result<()>;

    async fn recv(&self) -> Result<Option<Frame>>;

    /// Releases resources. Idempotent.
    async fn stop(&self);
}
