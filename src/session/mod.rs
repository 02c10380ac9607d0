pub(crate) mod flow;
pub(crate) mod queues;
pub(crate) mod timers;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::context::Shared;
use super::event::{lock, Event};
use super::frame::Pdu;
use super::queue::PacketQueue;
use super::sender;
use super::{Address, CloseReason, Error, Result};

use flow::Hysteresis;
use queues::{seq_before, QueueSet};
use timers::SenderTimers;

// Upper bound on any single blocking wait inside read/write/close, so that session death is
// noticed promptly
const FLOW_POLL_MS: u64 = 100;
const DISPOSAL_POLL_MS: u64 = 100;

const CLOSE_DRAIN_BUFFER_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

/// Observable connection state of a [`Session`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// SYN sent or received, handshake not yet complete.
    Handshaking,
    /// Data may flow in both directions.
    Connected,
    /// A reset was sent or received, or the session was marked for destruction.
    Closing,
    /// Removed from the session table.
    Destroyed,
}

pub(crate) type SessionRef = Arc<SessionCore>;

pub(crate) struct SessionCore {
    // Owning context
    pub shared: Arc<Shared>,
    // Side of the handshake this session plays
    role: Role,
    // Endpoints used for every transmission
    local_addr: Address,
    remote_addr: Address,
    // Current id; a client replaces its tentative id with the server's on SYNACK
    id: AtomicU32,
    // Server: the client's tentative id. Client: its own former tentative id.
    suggested_id: AtomicU32,
    // Creation time, used to expire unanswered handshakes
    first_syn_ms: u64,
    // Lifecycle flags
    connected: AtomicBool,
    wait_kill: AtomicBool,
    reset_sent: AtomicBool,
    disposed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    // Packet pipeline
    pub queues: QueueSet,
    // Received sequences awaiting acknowledgement
    pub acks: Mutex<PacketQueue<u16>>,
    // Highest sequence acknowledged by the peer
    highest_ack: AtomicU16,
    pub flow: Hysteresis,
    pub timers: SenderTimers,
    // Signaled when a client handshake completes or is refused
    pub connection_event: Event,
    // Signaled once the receiver has removed the session from the table
    dispose_event: Event,
    // Unread remainder of the last payload
    half_packet: Mutex<Vec<u8>>,
    sender_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SessionCore {
    pub fn new(
        shared: Arc<Shared>,
        role: Role,
        id: u32,
        suggested_id: u32,
        local_addr: Address,
        remote_addr: Address,
    ) -> SessionRef {
        debug_assert!(id != 0);

        let first_syn_ms = shared.epoch.time_now_ms();
        let flow = Hysteresis::new(shared.config.lock_threshold, shared.config.unlock_threshold);

        Arc::new(Self {
            shared,
            role,
            local_addr,
            remote_addr,
            id: AtomicU32::new(id),
            suggested_id: AtomicU32::new(suggested_id),
            first_syn_ms,
            connected: AtomicBool::new(false),
            wait_kill: AtomicBool::new(false),
            reset_sent: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            queues: QueueSet::new(),
            acks: Mutex::new(PacketQueue::new()),
            highest_ack: AtomicU16::new(0),
            flow,
            timers: SenderTimers::new(),
            connection_event: Event::new(),
            dispose_event: Event::new(),
            half_packet: Mutex::new(Vec::new()),
            sender_thread: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    /// Only the session table may change a registered session's id.
    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn suggested_id(&self) -> u32 {
        self.suggested_id.load(Ordering::SeqCst)
    }

    pub fn set_suggested_id(&self, id: u32) {
        self.suggested_id.store(id, Ordering::SeqCst);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    pub fn local_addr(&self) -> &Address {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &Address {
        &self.remote_addr
    }

    pub fn first_syn_ms(&self) -> u64 {
        self.first_syn_ms
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns true if the session was not connected before.
    pub fn set_connected(&self) -> bool {
        !self.connected.swap(true, Ordering::SeqCst)
    }

    pub fn is_wait_kill(&self) -> bool {
        self.wait_kill.load(Ordering::SeqCst)
    }

    pub fn is_reset_sent(&self) -> bool {
        self.reset_sent.load(Ordering::SeqCst)
    }

    /// Returns true if no reset had been sent before.
    pub fn mark_reset_sent(&self) -> bool {
        !self.reset_sent.swap(true, Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *lock(&self.close_reason)
    }

    /// Marks the session for destruction and releases every thread blocked on it. The first
    /// reason recorded wins.
    pub fn set_wait_kill(&self, reason: CloseReason) {
        {
            let mut close_reason = lock(&self.close_reason);
            if close_reason.is_none() {
                *close_reason = Some(reason);
            }
        }

        if !self.wait_kill.swap(true, Ordering::SeqCst) {
            debug!("session {:08x}: marked for destruction ({})", self.id(), reason);

            self.queues.mark_dead();
            self.timers.interrupt();
            self.flow.signal();
            self.connection_event.set();
        }
    }

    /// Called by the receiver once the session is out of the table.
    pub fn mark_disposed(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.dispose_event.set();
    }

    fn wait_disposal(&self) {
        while !self.is_disposed() && !self.shared.is_shut_down() {
            self.dispose_event.wait(DISPOSAL_POLL_MS);
        }
    }

    pub fn state(&self) -> SessionState {
        if self.is_disposed() {
            SessionState::Destroyed
        } else if self.is_wait_kill() || self.is_reset_sent() {
            SessionState::Closing
        } else if self.is_connected() {
            SessionState::Connected
        } else {
            SessionState::Handshaking
        }
    }

    pub fn highest_ack(&self) -> u16 {
        self.highest_ack.load(Ordering::SeqCst)
    }

    /// Raises the acknowledgement high-water mark. Only the receiver thread calls this.
    pub fn note_ack(&self, seq: u16) {
        if seq_before(self.highest_ack(), seq) {
            self.highest_ack.store(seq, Ordering::SeqCst);
        }
    }

    /// Sends a PDU stamped with this session's id.
    pub fn transmit(&self, pdu: &Pdu) -> io::Result<()> {
        let mut header = pdu.header;
        header.session_id = self.id();

        trace!(
            "session {:08x}: -> {:?} field {:08x} ({} bytes)",
            header.session_id,
            header.packet_type,
            header.field,
            pdu.payload.len()
        );

        self.shared
            .send(&self.local_addr, &self.remote_addr, header, &pdu.payload)
    }

    pub fn start_sender(self: &Arc<Self>) -> io::Result<()> {
        let session = Arc::clone(self);

        let handle = thread::Builder::new()
            .name(format!("wxp-sender-{:08x}", self.id()))
            .spawn(move || sender::run(session))?;

        *lock(&self.sender_thread) = Some(handle);

        Ok(())
    }

    /// Joins the sender thread and frees all buffered data. The session must already be marked
    /// for destruction.
    fn destroy(&self) {
        debug_assert!(self.is_wait_kill());

        let handle = lock(&self.sender_thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        self.queues.clear();
        lock(&self.acks).clear();
        lock(&self.half_packet).clear();
    }

    /// Marks the session for destruction, waits for the receiver to drop it from the table,
    /// then releases its resources.
    pub fn teardown(&self, reason: CloseReason) {
        self.set_wait_kill(reason);
        self.shared.signal_new_state();
        self.wait_disposal();
        self.destroy();
    }

    fn check_open(&self) -> Result<()> {
        if self.is_wait_kill() {
            return Err(Error::Closed(
                self.close_reason().unwrap_or(CloseReason::StateCleared),
            ));
        }
        if self.is_reset_sent() {
            return Err(Error::Closing);
        }
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        {
            let mut half_packet = lock(&self.half_packet);
            if !half_packet.is_empty() {
                let n = buf.len().min(half_packet.len());
                buf[..n].copy_from_slice(&half_packet[..n]);
                half_packet.drain(..n);
                return Ok(n);
            }
        }

        let payload = loop {
            if let Some(payload) = self.queues.in_queue_pick() {
                break payload;
            }

            if let Err(err) = self.check_open() {
                // The last payload may have arrived along with the reset
                match self.queues.in_queue_pick() {
                    Some(payload) => break payload,
                    None => return Err(err),
                }
            }

            if let Some(payload) = self.queues.in_queue_read(self.shared.config.read_poll_ms) {
                break payload;
            }
        };

        let n = buf.len().min(payload.len());
        buf[..n].copy_from_slice(&payload[..n]);

        if n < payload.len() {
            let remainder = &payload[n..];
            let mut half_packet = lock(&self.half_packet);
            half_packet
                .try_reserve_exact(remainder.len())
                .map_err(|_| Error::OutOfMemory)?;
            half_packet.extend_from_slice(remainder);
        }

        Ok(n)
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        self.check_open()?;

        let size = data.len().min(self.shared.backend.mtu() as usize);

        if self.flow.should_lock(self.queues.in_flight_count()) {
            trace!("session {:08x}: write blocked by flow control", self.id());

            let released = self.flow.wait_for_release(
                || self.queues.in_flight_count(),
                || self.check_open().is_err(),
                FLOW_POLL_MS,
                None,
            );

            if !released {
                return self.check_open().and(Err(Error::Closing));
            }
        }

        let seq = self.queues.out_queue_write(&data[..size])?;
        trace!("session {:08x}: queued seq {} ({} bytes)", self.id(), seq, size);

        sender::sched_send(self);

        Ok(size)
    }

    fn close(&self) {
        let config = &self.shared.config;

        if self.is_connected() && !self.is_wait_kill() {
            if self.mark_reset_sent() {
                let seq = self.queues.out_queue_reset();
                debug!("session {:08x}: closing, RST seq {}", self.id(), seq);
                sender::sched_send(self);
            }

            self.flow.release_all();

            let deadline = Instant::now() + Duration::from_millis(config.close_timeout_ms);
            let drained = self.flow.wait_for_release(
                || self.queues.in_flight_count(),
                || self.is_wait_kill(),
                FLOW_POLL_MS,
                Some(deadline),
            );

            if !drained && !self.is_wait_kill() {
                warn!(
                    "session {:08x}: {} packets unacknowledged after {}ms, forcing teardown",
                    self.id(),
                    self.queues.in_flight_count(),
                    config.close_timeout_ms
                );
            }

            // Discard whatever is left unread
            let mut scratch = [0; CLOSE_DRAIN_BUFFER_SIZE];
            while self.read(&mut scratch).is_ok() {}

            if let Err(err) = sender::send_pending_acks(self) {
                debug!("session {:08x}: final ack flush failed: {}", self.id(), err);
            }
        }

        self.teardown(CloseReason::ConnectionReset);
    }
}

/// A WXP connection.
///
/// `read` and `write` may be called concurrently from different threads. Dropping a session that
/// was not closed tears it down without the reset exchange.
pub struct Session {
    core: SessionRef,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(core: SessionRef) -> Self {
        Self {
            core,
            closed: AtomicBool::new(false),
        }
    }

    /// Current session id. For clients this is the id assigned by the server.
    pub fn id(&self) -> u32 {
        self.core.id()
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn is_server(&self) -> bool {
        self.core.is_server()
    }

    pub fn local_addr(&self) -> &Address {
        self.core.local_addr()
    }

    pub fn remote_addr(&self) -> &Address {
        self.core.remote_addr()
    }

    /// Reads received bytes into `buf`, blocking until some are available.
    ///
    /// Payload boundaries are not preserved: if `buf` is smaller than the next payload, the rest
    /// is returned by subsequent calls. Fails once the session is closing or closed and no data
    /// remains.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.core.read(buf)
    }

    /// Queues at most [`Backend::mtu`](crate::Backend::mtu) bytes of `data` for reliable
    /// delivery and returns how many were taken. Blocks while too many packets are in flight.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.core.write(data)
    }

    /// Resets the connection, waits (bounded) for outstanding data to be acknowledged, and
    /// releases the session. Subsequent calls do nothing.
    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.core.close();
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.core.set_wait_kill(CloseReason::StateCleared);
            self.core.shared.signal_new_state();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &format_args!("{:08x}", self.id()))
            .field("state", &self.state())
            .field("server", &self.is_server())
            .finish()
    }
}
