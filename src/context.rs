use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::backend::Backend;
use super::epoch::Epoch;
use super::event::{lock, Event};
use super::frame::{self, Header, Pdu};
use super::receiver;
use super::session::{Role, Session, SessionCore};
use super::table::{Backlog, SessionTable};
use super::{Address, CloseReason, Error, Result};

const LISTEN_BACKLOG_DEFAULT: usize = 16;
const LISTEN_BACKLOG_MIN: usize = 1;

const LOCK_THRESHOLD_DEFAULT: usize = 10;
const UNLOCK_THRESHOLD_DEFAULT: usize = 5;

const CLOSE_TIMEOUT_DEFAULT_MS: u64 = 30_000;
const REPEAT_TIMEOUT_DEFAULT_MS: u64 = 5_000;
const CONNECTION_TIMEOUT_DEFAULT_MS: u64 = 5_000;
const SYNACK_TIMEOUT_DEFAULT_MS: u64 = 30_000;
const REPEAT_CHECK_PERIOD_DEFAULT_MS: u64 = 2_000;

const MAX_RETRY_DEFAULT: u32 = 50;
const MAX_CONNECTION_RETRY_DEFAULT: u32 = 5;

const ACK_DELAY_DEFAULT_MS: u64 = 100;
const SEND_DELAY_DEFAULT_MS: u64 = 0;
const REPEAT_DELAY_DEFAULT_MS: u64 = 10;
const LOST_DELAY_DEFAULT_MS: u64 = 5_000;
const READ_POLL_DEFAULT_MS: u64 = 3_000;

const LISTEN_POLL_MS: u64 = 500;

/// Configuration for a [`Context`] and every session it creates.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of inbound sessions awaiting `listen`.
    ///
    /// Minimum value: 1 \
    /// Default value: 16
    pub listen_backlog: usize,

    /// In-flight packet count at which `write` blocks.
    ///
    /// Minimum value: 1 \
    /// Default value: 10
    pub lock_threshold: usize,

    /// In-flight packet count at or below which a blocked `write` resumes. Must be less than
    /// `lock_threshold`.
    ///
    /// Default value: 5
    pub unlock_threshold: usize,

    /// Time `close` waits for outstanding data to be acknowledged, in milliseconds.
    ///
    /// Default value: 30,000
    pub close_timeout_ms: u64,

    /// Age after which an unacknowledged packet is retransmitted, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 5,000
    pub repeat_timeout_ms: u64,

    /// Time `connect` waits for a SYNACK before re-sending SYN, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 5,000
    pub connection_timeout_ms: u64,

    /// Time an inbound handshake may stay incomplete before it is evicted, in milliseconds.
    ///
    /// Default value: 30,000
    pub synack_timeout_ms: u64,

    /// Interval of the periodic retransmission sweep, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 2,000
    pub repeat_check_period_ms: u64,

    /// Retransmissions of a single packet before the session fails.
    ///
    /// Minimum value: 1 \
    /// Default value: 50
    pub max_retry: u32,

    /// SYN attempts made by `connect`.
    ///
    /// Minimum value: 1 \
    /// Default value: 5
    pub max_connection_retry: u32,

    /// Window over which acknowledgements are coalesced, in milliseconds.
    ///
    /// Default value: 100
    pub ack_delay_ms: u64,

    /// Delay between a write and its transmission, in milliseconds.
    ///
    /// Default value: 0
    pub send_delay_ms: u64,

    /// Delay of a retransmission sweep triggered by the peer, in milliseconds.
    ///
    /// Default value: 10
    pub repeat_delay_ms: u64,

    /// Delay before asking the peer to resend missing packets, in milliseconds.
    ///
    /// Default value: 5,000
    pub lost_delay_ms: u64,

    /// Interval at which a blocked `read` re-checks the session, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 3,000
    pub read_poll_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_backlog: LISTEN_BACKLOG_DEFAULT,
            lock_threshold: LOCK_THRESHOLD_DEFAULT,
            unlock_threshold: UNLOCK_THRESHOLD_DEFAULT,
            close_timeout_ms: CLOSE_TIMEOUT_DEFAULT_MS,
            repeat_timeout_ms: REPEAT_TIMEOUT_DEFAULT_MS,
            connection_timeout_ms: CONNECTION_TIMEOUT_DEFAULT_MS,
            synack_timeout_ms: SYNACK_TIMEOUT_DEFAULT_MS,
            repeat_check_period_ms: REPEAT_CHECK_PERIOD_DEFAULT_MS,
            max_retry: MAX_RETRY_DEFAULT,
            max_connection_retry: MAX_CONNECTION_RETRY_DEFAULT,
            ack_delay_ms: ACK_DELAY_DEFAULT_MS,
            send_delay_ms: SEND_DELAY_DEFAULT_MS,
            repeat_delay_ms: REPEAT_DELAY_DEFAULT_MS,
            lost_delay_ms: LOST_DELAY_DEFAULT_MS,
            read_poll_ms: READ_POLL_DEFAULT_MS,
        }
    }
}

impl Config {
    fn validate(&self) {
        assert!(
            self.listen_backlog >= LISTEN_BACKLOG_MIN,
            "invalid configuration: listen_backlog < {}",
            LISTEN_BACKLOG_MIN
        );
        assert!(
            self.lock_threshold >= 1,
            "invalid configuration: lock_threshold < 1"
        );
        assert!(
            self.unlock_threshold < self.lock_threshold,
            "invalid configuration: unlock_threshold >= lock_threshold"
        );
        assert!(
            self.repeat_timeout_ms >= 1,
            "invalid configuration: repeat_timeout_ms < 1"
        );
        assert!(
            self.connection_timeout_ms >= 1,
            "invalid configuration: connection_timeout_ms < 1"
        );
        assert!(
            self.repeat_check_period_ms >= 1,
            "invalid configuration: repeat_check_period_ms < 1"
        );
        assert!(self.max_retry >= 1, "invalid configuration: max_retry < 1");
        assert!(
            self.max_connection_retry >= 1,
            "invalid configuration: max_connection_retry < 1"
        );
        assert!(
            self.read_poll_ms >= 1,
            "invalid configuration: read_poll_ms < 1"
        );
    }
}

/// State shared by the receiver thread, every sender thread and the application.
pub(crate) struct Shared {
    // Saved configuration
    pub config: Config,
    // Datagram transport
    pub backend: Box<dyn Backend>,
    // Only datagrams from this address are accepted
    pub remote_addr: Address,
    // Timestamps are computed relative to this
    pub epoch: Epoch,
    // Every live session, by id
    pub table: Mutex<SessionTable>,
    // Inbound sessions not yet returned by listen
    pub backlog: Mutex<Backlog>,
    // Signaled when an inbound handshake completes
    pub new_connection: Event,
    // Set when sessions were marked for destruction
    table_changed: AtomicBool,
    shutdown: AtomicBool,
}

impl Shared {
    pub fn new(config: Config, backend: Box<dyn Backend>, remote_addr: Address) -> Self {
        let backlog = Backlog::new(config.listen_backlog);

        Self {
            config,
            backend,
            remote_addr,
            epoch: Epoch::new(),
            table: Mutex::new(SessionTable::new()),
            backlog: Mutex::new(backlog),
            new_connection: Event::new(),
            table_changed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Asks the receiver to sweep sessions marked for destruction.
    pub fn signal_new_state(&self) {
        self.table_changed.store(true, Ordering::SeqCst);
        self.backend.wake();
    }

    pub fn take_new_state(&self) -> bool {
        self.table_changed.swap(false, Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Encodes and sends a frame with a fresh scramble value.
    pub fn send(&self, src: &Address, dst: &Address, mut header: Header, payload: &[u8]) -> io::Result<()> {
        header.scramble = rand::random();
        let frame = frame::serial::write(&header, payload);
        self.backend.send_to(src, dst, &frame)
    }

    pub fn send_pdu(&self, src: &Address, dst: &Address, pdu: &Pdu) -> io::Result<()> {
        self.send(src, dst, pdu.header, &pdu.payload)
    }

    /// Picks a nonzero id not used by any registered session. Must not be called with the table
    /// locked.
    pub fn random_session_id(&self) -> u32 {
        loop {
            let id = rand::random::<u32>();
            if id != 0 && lock(&self.table).lookup(id).is_none() {
                return id;
            }
        }
    }
}

/// A WXP endpoint bound to one backend and one remote peer.
///
/// Owns the receiver thread which demultiplexes every datagram arriving on the backend. Dropping
/// the context tears down every remaining session.
pub struct Context {
    shared: Arc<Shared>,
    receiver_thread: Option<thread::JoinHandle<()>>,
}

impl Context {
    /// Equivalent to `init_with_config(remote_addr, backend, Default::default())`.
    pub fn init<B>(remote_addr: Address, backend: B) -> Result<Self>
    where
        B: Backend + 'static,
    {
        Self::init_with_config(remote_addr, backend, Default::default())
    }

    /// Starts the receiver thread for `backend`. Only datagrams whose source is `remote_addr`
    /// are processed.
    ///
    /// *Note*: Panics if the provided configuration is invalid.
    pub fn init_with_config<B>(remote_addr: Address, backend: B, config: Config) -> Result<Self>
    where
        B: Backend + 'static,
    {
        config.validate();

        let shared = Arc::new(Shared::new(config, Box::new(backend), remote_addr));

        let receiver_shared = Arc::clone(&shared);
        let receiver_thread = thread::Builder::new()
            .name("wxp-receiver".into())
            .spawn(move || receiver::run(receiver_shared))?;

        debug!("context started, remote {:?}", shared.remote_addr);

        Ok(Self {
            shared,
            receiver_thread: Some(receiver_thread),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn remote_addr(&self) -> &Address {
        &self.shared.remote_addr
    }

    /// Number of sessions currently registered, including those awaiting destruction.
    pub fn session_count(&self) -> usize {
        lock(&self.shared.table).len()
    }

    /// Opens a session to the remote peer, re-sending SYN up to `max_connection_retry` times.
    pub fn connect(&self, local_addr: Address) -> Result<Session> {
        let ref shared = self.shared;
        let ref config = shared.config;

        if shared.is_shut_down() {
            return Err(Error::ContextShutdown);
        }

        let id = shared.random_session_id();
        let session = SessionCore::new(
            Arc::clone(shared),
            Role::Client,
            id,
            0,
            local_addr,
            shared.remote_addr.clone(),
        );

        lock(&shared.table).register(Arc::clone(&session));

        if let Err(err) = session.start_sender() {
            session.teardown(CloseReason::InternalError);
            return Err(err.into());
        }

        let mut attempts = 0;

        while !session.is_connected() && !session.is_wait_kill() && attempts < config.max_connection_retry {
            attempts += 1;

            debug!(
                "session {:08x}: sending SYN ({}/{})",
                id, attempts, config.max_connection_retry
            );

            let syn = Pdu::syn(id);
            if let Err(err) = shared.send_pdu(session.local_addr(), session.remote_addr(), &syn) {
                session.teardown(CloseReason::InternalError);
                return Err(err.into());
            }

            session.connection_event.wait(config.connection_timeout_ms);
        }

        if session.is_connected() && !session.is_wait_kill() {
            debug!("session {:08x}: connected as {:08x}", id, session.id());
            return Ok(Session::new(session));
        }

        let err = match session.close_reason() {
            Some(CloseReason::ConnectionReset) => Error::ConnectionReset,
            Some(CloseReason::StateCleared) => Error::ContextShutdown,
            _ => Error::ConnectionTimeout,
        };

        debug!("session {:08x}: connection failed: {}", id, err);

        session.teardown(CloseReason::ConnectionTimeout);

        Err(err)
    }

    /// Blocks until an inbound handshake completes on `local_addr` and returns its session. An
    /// unspecified address accepts connections on any local address.
    pub fn listen(&self, local_addr: &Address) -> Result<Session> {
        self.listen_until(local_addr, None)
    }

    /// Like [`listen`](Self::listen), but fails with [`Error::ListenTimeout`] after `timeout`.
    pub fn listen_timeout(&self, local_addr: &Address, timeout: Duration) -> Result<Session> {
        self.listen_until(local_addr, Some(Instant::now() + timeout))
    }

    fn listen_until(&self, local_addr: &Address, deadline: Option<Instant>) -> Result<Session> {
        let ref shared = self.shared;

        loop {
            if let Some(session) = lock(&shared.backlog).pull_first_connected(local_addr) {
                debug!("session {:08x}: accepted", session.id());
                return Ok(Session::new(session));
            }

            if shared.is_shut_down() {
                return Err(Error::ContextShutdown);
            }

            let wait_ms = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::ListenTimeout);
                    }
                    ((deadline - now).as_millis() as u64).clamp(1, LISTEN_POLL_MS)
                }
                None => LISTEN_POLL_MS,
            };

            shared.new_connection.wait(wait_ms);
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);

        let sessions = lock(&self.shared.table).sessions();

        for session in sessions {
            session.set_wait_kill(CloseReason::StateCleared);
        }

        self.shared.signal_new_state();

        if let Some(handle) = self.receiver_thread.take() {
            let _ = handle.join();
        }

        debug!("context stopped");
    }
}
