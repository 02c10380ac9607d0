use std::io;
use std::net;
use std::sync::Mutex;
use std::time;

use super::backend::{Backend, Datagram};
use super::event::lock;
use super::Address;

const SOCKET_POLLING_KEY: usize = 0;

const FRAME_SIZE_MAX: usize = 65_535;

/// Payload budget used when none is given.
pub const DEFAULT_MTU: u32 = 768;

/// [`Backend`] over a non-blocking UDP socket.
pub struct UdpBackend {
    // Non-blocking socket, shared by every sending thread
    socket: net::UdpSocket,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    // Maximum payload per write
    mtu: u32,
    // Polling objects
    poller: polling::Poller,
    poller_events: Mutex<polling::Events>,
    // Always-allocated receive buffer
    recv_buffer: Mutex<Box<[u8]>>,
}

impl UdpBackend {
    pub fn bind<A>(bind_address: A) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        Self::bind_with_mtu(bind_address, DEFAULT_MTU)
    }

    pub fn bind_with_mtu<A>(bind_address: A, mtu: u32) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        let socket = net::UdpSocket::bind(bind_address)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        let poller = polling::Poller::new()?;

        unsafe {
            poller.add(&socket, polling::Event::readable(SOCKET_POLLING_KEY))?;
        }

        Ok(Self {
            socket,
            local_addr,
            mtu,
            poller,
            poller_events: Mutex::new(polling::Events::new()),
            recv_buffer: Mutex::new(vec![0; FRAME_SIZE_MAX].into_boxed_slice()),
        })
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }

    /// The local socket address in [`Address`] form.
    pub fn address(&self) -> Address {
        Address::from(self.local_addr)
    }
}

impl Backend for UdpBackend {
    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn send_to(&self, _src: &Address, dst: &Address, bytes: &[u8]) -> io::Result<()> {
        let addr = dst.to_socket_addr().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "not a socket address")
        })?;

        match self.socket.send_to(bytes, addr) {
            Ok(_) => Ok(()),
            // A full send buffer is indistinguishable from loss
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn recv_from(&self) -> io::Result<Option<Datagram>> {
        let mut recv_buffer = lock(&self.recv_buffer);

        match self.socket.recv_from(&mut recv_buffer) {
            Ok((frame_len, sender_addr)) => Ok(Some(Datagram {
                src: Address::from(sender_addr),
                dst: Address::from(self.local_addr),
                bytes: recv_buffer[..frame_len].to_vec(),
            })),
            Err(err) => match err.kind() {
                // The only acceptable error is WouldBlock, indicating no packet
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            },
        }
    }

    fn wait_ready(&self, timeout: Option<time::Duration>) -> io::Result<()> {
        let mut poller_events = lock(&self.poller_events);

        // Wait for a readable event (must be done prior to each wait() call)
        self.poller
            .modify(&self.socket, polling::Event::readable(SOCKET_POLLING_KEY))?;

        poller_events.clear();

        self.poller.wait(&mut poller_events, timeout)?;

        Ok(())
    }

    fn wake(&self) {
        let _ = self.poller.notify();
    }
}

impl Drop for UdpBackend {
    fn drop(&mut self) {
        let _ = self.poller.delete(&self.socket);
    }
}
