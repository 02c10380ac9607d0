use std::io;
use std::time::Duration;

use super::Address;

/// A datagram received from a backend.
#[derive(Clone, Debug)]
pub struct Datagram {
    pub src: Address,
    pub dst: Address,
    pub bytes: Vec<u8>,
}

/// Unreliable, unordered datagram transport carrying WXP frames.
///
/// A backend is shared between the receiver thread and every session's sender thread, so all
/// methods take `&self`.
pub trait Backend: Send + Sync {
    /// Largest payload accepted by a single `write`.
    fn mtu(&self) -> u32;

    /// Sends one frame from `src` to `dst`.
    fn send_to(&self, src: &Address, dst: &Address, bytes: &[u8]) -> io::Result<()>;

    /// Returns the next received datagram, or `Ok(None)` if none is pending. Never blocks.
    fn recv_from(&self) -> io::Result<Option<Datagram>>;

    /// Blocks until a datagram may be available, `wake` is called, or the timeout elapses.
    /// Spurious returns are allowed.
    fn wait_ready(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Interrupts a pending or the next call to `wait_ready`.
    fn wake(&self);
}
