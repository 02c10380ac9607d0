/*

WXP is a reliable, ordered, connection-oriented transport layered on an unreliable datagram
backend. Every frame starts with a 16 byte big-endian header:

  0       4       6          8       12      16
  | sid   | type  | scramble | field | cksum |  payload...

The checksum is the one's complement of the 32-bit sum of all 16-bit words of the frame, computed
with the checksum field zeroed. The scramble value is random per frame so that retransmissions of
identical PDUs are not byte-identical.

# Handshake

  client                            server
    SYN(sid = tentative)      ->
                              <-    SYNACK(sid = tentative, field = new id)
    ACK(sid = new id)         ->

The client picks a random tentative id and re-sends SYN until it receives SYNACK or runs out of
attempts. The server keeps an unaccepted session in a fixed-size listen backlog and re-sends
SYNACK periodically until the ACK arrives. If the ACK is lost but DATA arrives for the new id, the
server treats the session as connected. A client that receives a second SYNACK for its former id
re-sends the ACK.

# Data transfer

DATA and RST carry a 16-bit sequence number in the high half of the header field. Sequence numbers
are compared in serial order and wrap freely. Each session keeps four queues:

  output      written by the application, not yet sent
  outcoming   sent, awaiting acknowledgement
  incoming    received ahead of a gap, sorted by distance from the expected sequence
  input       delivered in order, ready for read

Every DATA or RST received is acknowledged; acknowledgements are coalesced and sent as ACK PDUs
listing up to 100 sequences. Unacknowledged PDUs are resent by a periodic sweep once older than the
repeat timeout. A receiver holding out-of-order PDUs asks for the gaps with a REPEAT PDU, which
makes the sender resend the listed sequences on its next sweep.

# Flow control

The in-flight count is the distance from the oldest queued or unacknowledged sequence to the next
sequence to be assigned. Writers block when it reaches the lock threshold and resume once it falls
to the unlock threshold.

# Close

Closing queues an RST in the data stream. The peer delivers everything before it, answers with its
own RST, and both sides wait (bounded) for their RST to be acknowledged before destroying the
session.

# Threads

A context owns one receiver thread that demultiplexes frames to sessions, runs the server half of
the handshake, and destroys sessions marked for destruction. Each session owns one sender thread
driven by four timers: ack, repeat, lost and send.

*/

mod address;
mod backend;
mod context;
mod epoch;
mod error;
mod event;
pub mod frame;
pub mod queue;
mod receiver;
mod sender;
mod session;
mod socket;
mod table;

pub use address::Address;
pub use backend::{Backend, Datagram};
pub use context::{Config, Context};
pub use error::{CloseReason, Error, Result};
pub use session::{Session, SessionState};
pub use socket::UdpBackend;
