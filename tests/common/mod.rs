use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use wxp::frame::{self, PacketType, Pdu};
use wxp::{Address, Backend, Datagram};

pub const MOCK_MTU: u32 = 512;

type SendHook = Arc<dyn Fn(&MockBackend, &Datagram) + Send + Sync>;

struct State {
    inbound: VecDeque<Datagram>,
    woken: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    sent: Mutex<Vec<Datagram>>,
    on_send: Mutex<Option<SendHook>>,
}

/// In-memory backend. Every frame sent is logged and passed to an optional hook, which may
/// inject replies.
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<Inner>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    inbound: VecDeque::new(),
                    woken: false,
                }),
                cond: Condvar::new(),
                sent: Mutex::new(Vec::new()),
                on_send: Mutex::new(None),
            }),
        }
    }

    pub fn set_on_send<F>(&self, hook: F)
    where
        F: Fn(&MockBackend, &Datagram) + Send + Sync + 'static,
    {
        *self.inner.on_send.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn inject(&self, datagram: Datagram) {
        let mut state = self.inner.state.lock().unwrap();
        state.inbound.push_back(datagram);
        self.inner.cond.notify_all();
    }

    /// Injects `pdu` as if `src` had sent it to `dst`.
    pub fn inject_pdu(&self, src: &Address, dst: &Address, pdu: &Pdu) {
        self.inject(Datagram {
            src: src.clone(),
            dst: dst.clone(),
            bytes: frame::serial::write_pdu(pdu).into_vec(),
        });
    }

    pub fn sent(&self) -> Vec<Datagram> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn sent_pdus(&self) -> Vec<Pdu> {
        self.sent()
            .iter()
            .map(|datagram| frame::serial::read(&datagram.bytes).expect("sent an invalid frame"))
            .collect()
    }

    pub fn sent_of_type(&self, packet_type: PacketType) -> Vec<Pdu> {
        self.sent_pdus()
            .into_iter()
            .filter(|pdu| pdu.packet_type() == packet_type)
            .collect()
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }
}

impl Backend for MockBackend {
    fn mtu(&self) -> u32 {
        MOCK_MTU
    }

    fn send_to(&self, src: &Address, dst: &Address, bytes: &[u8]) -> io::Result<()> {
        let datagram = Datagram {
            src: src.clone(),
            dst: dst.clone(),
            bytes: bytes.to_vec(),
        };

        self.inner.sent.lock().unwrap().push(datagram.clone());

        let hook = self.inner.on_send.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(self, &datagram);
        }

        Ok(())
    }

    fn recv_from(&self) -> io::Result<Option<Datagram>> {
        Ok(self.inner.state.lock().unwrap().inbound.pop_front())
    }

    fn wait_ready(&self, timeout: Option<Duration>) -> io::Result<()> {
        let mut state = self.inner.state.lock().unwrap();

        if state.inbound.is_empty() && !state.woken {
            state = match timeout {
                Some(timeout) => self.inner.cond.wait_timeout(state, timeout).unwrap().0,
                None => self.inner.cond.wait(state).unwrap(),
            };
        }

        state.woken = false;

        Ok(())
    }

    fn wake(&self) {
        self.inner.state.lock().unwrap().woken = true;
        self.inner.cond.notify_all();
    }
}

/// Connects two mock backends so that each delivers what it sends to the other, subject to
/// `filter`. The filter may drop a datagram by returning an empty vector, or reorder and
/// duplicate them by holding and releasing datagrams.
pub fn link<F>(a: &MockBackend, b: &MockBackend, filter: F)
where
    F: Fn(&Datagram) -> Vec<Datagram> + Send + Sync + 'static,
{
    let filter = Arc::new(filter);

    let a_weak = a.downgrade();
    let b_weak = b.downgrade();

    let a_filter = Arc::clone(&filter);
    a.set_on_send(move |_, datagram| {
        if let Some(peer) = MockBackend::upgrade(&b_weak) {
            for datagram in a_filter(datagram) {
                peer.inject(datagram);
            }
        }
    });

    b.set_on_send(move |_, datagram| {
        if let Some(peer) = MockBackend::upgrade(&a_weak) {
            for datagram in filter(datagram) {
                peer.inject(datagram);
            }
        }
    });
}

pub fn client_addr() -> Address {
    "10.0.0.1:4000".parse::<std::net::SocketAddr>().unwrap().into()
}

pub fn server_addr() -> Address {
    "10.0.0.2:9999".parse::<std::net::SocketAddr>().unwrap().into()
}

/// Timings scaled down so that retransmission paths run within a test's lifetime.
pub fn fast_config() -> wxp::Config {
    wxp::Config {
        close_timeout_ms: 2_000,
        repeat_timeout_ms: 100,
        connection_timeout_ms: 200,
        synack_timeout_ms: 2_000,
        repeat_check_period_ms: 50,
        max_retry: 50,
        max_connection_retry: 3,
        ack_delay_ms: 10,
        repeat_delay_ms: 5,
        lost_delay_ms: 50,
        read_poll_ms: 50,
        ..Default::default()
    }
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub const FAKE_SESSION_ID: u32 = 0x5EED_0001;

/// Answers SYN on `backend` as a server would. If `ack_data` is set, every DATA and RST is
/// acknowledged immediately.
pub fn fake_server(backend: &MockBackend, ack_data: bool) {
    backend.set_on_send(move |backend, datagram| {
        let pdu = frame::serial::read(&datagram.bytes).unwrap();

        let reply = match pdu.packet_type() {
            PacketType::Syn => Some(Pdu::synack(pdu.session_id(), FAKE_SESSION_ID)),
            PacketType::Data | PacketType::Rst if ack_data => {
                Some(Pdu::ack(FAKE_SESSION_ID, &[pdu.seq()]))
            }
            _ => None,
        };

        if let Some(reply) = reply {
            backend.inject_pdu(&datagram.dst, &datagram.src, &reply);
        }
    });
}

/// DATA as a peer would send it to `session_id`.
pub fn peer_data(session_id: u32, seq: u16, payload: &[u8]) -> Pdu {
    let mut pdu = Pdu::data(seq, payload.to_vec().into());
    pdu.header.session_id = session_id;
    pdu
}
