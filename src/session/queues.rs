//! The four per-session packet queues.
//!
//! * output: written by the application, not yet transmitted
//! * outcoming: transmitted, awaiting acknowledgement
//! * incoming: received ahead of a gap, sorted by sequence
//! * input: delivered in order, ready for `read`
//!
//! Each queue has its own lock. `in_put` holds input then incoming; the in-flight count and
//! `out_queue_pick` hold output then outcoming. No other path holds two queue locks at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::event::{lock, Event};
use crate::frame::{PacketType, Pdu};
use crate::queue::PacketQueue;
use crate::{Error, Result};

/// True if `a` precedes `b` in 16-bit serial order.
pub fn seq_before(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueKind {
    Input,
    Output,
    Incoming,
    Outcoming,
}

impl QueueKind {
    fn index(self) -> usize {
        match self {
            Self::Input => 0,
            Self::Output => 1,
            Self::Incoming => 2,
            Self::Outcoming => 3,
        }
    }
}

/// Outcome of [`QueueSet::in_put`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IncomingState {
    /// In-order data was delivered to the input queue.
    Expected,
    /// Only empty DATA was consumed.
    ZeroPacket,
    /// The PDU was buffered behind a gap.
    LostPacket,
    /// The PDU had already been received.
    Repeated,
    /// An RST was reached in sequence.
    Close,
}

/// A transmitted PDU awaiting acknowledgement.
pub struct Pending {
    pub timestamp_ms: u64,
    pub retry_count: u32,
    // Requested by the peer; resend on the next sweep regardless of age
    pub forced: bool,
    pub pdu: Pdu,
}

/// Outcome of [`QueueSet::retransmit`].
#[derive(Debug, Eq, PartialEq)]
pub enum Retransmit {
    Skip,
    Send(Pdu),
    Exhausted,
}

struct Output {
    packets: PacketQueue<Pdu>,
    next_seq: u16,
}

struct Incoming {
    packets: PacketQueue<Pdu>,
    expected_seq: u16,
}

pub struct QueueSet {
    dead: AtomicBool,
    output: Mutex<Output>,
    outcoming: Mutex<PacketQueue<Pending>>,
    input: Mutex<PacketQueue<Box<[u8]>>>,
    incoming: Mutex<Incoming>,
    signals: [Event; 4],
}

fn try_copy(data: &[u8]) -> Result<Box<[u8]>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(data.len())
        .map_err(|_| Error::OutOfMemory)?;
    buf.extend_from_slice(data);
    Ok(buf.into_boxed_slice())
}

impl QueueSet {
    pub fn new() -> Self {
        Self {
            dead: AtomicBool::new(false),
            output: Mutex::new(Output {
                packets: PacketQueue::new(),
                next_seq: 0,
            }),
            outcoming: Mutex::new(PacketQueue::new()),
            input: Mutex::new(PacketQueue::new()),
            incoming: Mutex::new(Incoming {
                packets: PacketQueue::new(),
                expected_seq: 0,
            }),
            signals: Default::default(),
        }
    }

    pub fn signal(&self, kind: QueueKind) {
        self.signals[kind.index()].set();
    }

    /// Waits for `kind` to be signaled. A zero timeout waits forever.
    pub fn wait(&self, kind: QueueKind, timeout_ms: u64) -> bool {
        self.signals[kind.index()].wait(timeout_ms)
    }

    /// Wakes every reader; blocked reads return once the input queue is empty.
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.signal(QueueKind::Input);
        self.signal(QueueKind::Output);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn out_queue_push(&self, pdu_for_seq: impl FnOnce(u16) -> Pdu) -> u16 {
        let seq = {
            let mut output = lock(&self.output);

            let seq = output.next_seq;
            output.next_seq = seq.wrapping_add(1);
            output.packets.put(pdu_for_seq(seq));

            seq
        };

        self.signal(QueueKind::Output);

        seq
    }

    /// Queues a DATA PDU carrying a copy of `data`. Returns its sequence number.
    pub fn out_queue_write(&self, data: &[u8]) -> Result<u16> {
        let payload = try_copy(data)?;
        Ok(self.out_queue_push(|seq| Pdu::data(seq, payload)))
    }

    /// Queues an RST. Returns its sequence number.
    pub fn out_queue_reset(&self) -> u16 {
        self.out_queue_push(|seq| Pdu::rst(0, seq))
    }

    /// Moves the oldest output PDU to the in-flight queue and returns it for transmission.
    pub fn out_queue_pick(&self, now_ms: u64) -> Option<Pdu> {
        let mut output = lock(&self.output);
        let pdu = output.packets.pick()?;

        // Move under both locks so the in-flight count never misses the PDU
        lock(&self.outcoming).put(Pending {
            timestamp_ms: now_ms,
            retry_count: 0,
            forced: false,
            pdu: pdu.clone(),
        });

        drop(output);

        self.signal(QueueKind::Output);
        self.signal(QueueKind::Outcoming);

        Some(pdu)
    }

    /// Removes the in-flight PDU with sequence `seq`. Returns false if there was none.
    pub fn out_queue_ack_packet(&self, seq: u16) -> bool {
        let removed = {
            let mut outcoming = lock(&self.outcoming);
            match outcoming.find(|pending| pending.pdu.seq() == seq) {
                Some(id) => outcoming.remove(id).is_some(),
                None => false,
            }
        };

        if removed {
            self.signal(QueueKind::Outcoming);
        }

        removed
    }

    /// Time until the soonest in-flight PDU becomes due for retransmission.
    pub fn out_get_min_timeout(&self, now_ms: u64, repeat_timeout_ms: u64) -> Option<u64> {
        lock(&self.outcoming)
            .iter()
            .map(|pending| {
                if pending.retry_count == 0 || pending.forced {
                    0
                } else {
                    (pending.timestamp_ms + repeat_timeout_ms).saturating_sub(now_ms)
                }
            })
            .min()
    }

    #[cfg(test)]
    pub fn out_next_seq(&self) -> u16 {
        lock(&self.output).next_seq
    }

    #[cfg(test)]
    pub fn output_len(&self) -> usize {
        lock(&self.output).packets.len()
    }

    #[cfg(test)]
    pub fn outcoming_len(&self) -> usize {
        lock(&self.outcoming).len()
    }

    pub fn outcoming_seqs(&self) -> Vec<u16> {
        lock(&self.outcoming)
            .iter()
            .map(|pending| pending.pdu.seq())
            .collect()
    }

    /// Distance from the oldest queued or in-flight sequence to the next outbound sequence.
    pub fn in_flight_count(&self) -> usize {
        let output = lock(&self.output);
        let outcoming = lock(&self.outcoming);

        let next_seq = output.next_seq;
        let behind = |seq: u16| next_seq.wrapping_sub(seq) as usize;

        output
            .packets
            .iter()
            .map(|pdu| behind(pdu.seq()))
            .chain(outcoming.iter().map(|pending| behind(pending.pdu.seq())))
            .max()
            .unwrap_or(0)
    }

    /// A sequence is confirmed once it has been sent, is no longer in flight, and lies below
    /// the acknowledgement high-water mark.
    pub fn seq_already_confirmed(&self, seq: u16, highest_ack: u16) -> bool {
        let next_seq = lock(&self.output).next_seq;
        if !seq_before(seq, next_seq) {
            return false;
        }

        if lock(&self.outcoming)
            .find(|pending| pending.pdu.seq() == seq)
            .is_some()
        {
            return false;
        }

        seq_before(seq, highest_ack)
    }

    /// Decides whether the in-flight PDU `seq` is due for retransmission, and if so bumps its
    /// retry counter and returns a copy to send.
    pub fn retransmit(
        &self,
        seq: u16,
        highest_ack: u16,
        now_ms: u64,
        repeat_timeout_ms: u64,
        max_retry: u32,
    ) -> Retransmit {
        if self.seq_already_confirmed(seq, highest_ack) {
            return Retransmit::Skip;
        }

        let mut outcoming = lock(&self.outcoming);

        let pending = match outcoming
            .find(|pending| pending.pdu.seq() == seq)
            .and_then(|id| outcoming.get_mut(id))
        {
            Some(pending) => pending,
            // Acknowledged since the snapshot
            None => return Retransmit::Skip,
        };

        let age_ms = now_ms.saturating_sub(pending.timestamp_ms);
        if pending.retry_count > 0 && !pending.forced && age_ms <= repeat_timeout_ms {
            return Retransmit::Skip;
        }

        pending.retry_count += 1;
        if pending.retry_count > max_retry {
            return Retransmit::Exhausted;
        }

        pending.timestamp_ms = now_ms;
        pending.forced = false;

        Retransmit::Send(pending.pdu.clone())
    }

    /// Marks the listed in-flight PDUs for retransmission on the next sweep. Returns how many
    /// were found.
    pub fn expedite<I>(&self, seqs: I) -> usize
    where
        I: IntoIterator<Item = u16>,
    {
        let mut outcoming = lock(&self.outcoming);
        let mut count = 0;

        for seq in seqs {
            if let Some(pending) = outcoming
                .find(|pending| pending.pdu.seq() == seq)
                .and_then(|id| outcoming.get_mut(id))
            {
                pending.forced = true;
                count += 1;
            }
        }

        count
    }

    fn deliver(pdu: Pdu, input: &mut PacketQueue<Box<[u8]>>, delivered: &mut bool) -> bool {
        match pdu.packet_type() {
            PacketType::Rst => return true,
            _ if pdu.payload.is_empty() => (),
            _ => {
                input.put(pdu.payload);
                *delivered = true;
            }
        }
        false
    }

    /// Reassembles a received DATA or RST PDU.
    pub fn in_put(&self, pdu: Pdu) -> IncomingState {
        let mut input = lock(&self.input);
        let mut incoming_guard = lock(&self.incoming);
        let incoming = &mut *incoming_guard;

        let seq = pdu.seq();
        let expected_seq = incoming.expected_seq;

        if seq == expected_seq {
            let mut delivered = false;
            let mut close = Self::deliver(pdu, &mut input, &mut delivered);
            incoming.expected_seq = expected_seq.wrapping_add(1);

            // Drain now-contiguous successors
            while !close {
                match incoming.packets.peek() {
                    Some(head) if head.seq() == incoming.expected_seq => (),
                    _ => break,
                }

                if let Some(next) = incoming.packets.pick() {
                    close = Self::deliver(next, &mut input, &mut delivered);
                    incoming.expected_seq = incoming.expected_seq.wrapping_add(1);
                }
            }

            drop(incoming_guard);
            drop(input);

            if delivered {
                self.signal(QueueKind::Input);
            }
            self.signal(QueueKind::Incoming);

            if close {
                IncomingState::Close
            } else if delivered {
                IncomingState::Expected
            } else {
                IncomingState::ZeroPacket
            }
        } else if seq_before(expected_seq, seq) {
            if incoming.packets.find(|pdu| pdu.seq() == seq).is_some() {
                return IncomingState::Repeated;
            }

            incoming.packets.insert_sorted_by(pdu, |a, b| {
                let a_dist = a.seq().wrapping_sub(expected_seq);
                let b_dist = b.seq().wrapping_sub(expected_seq);
                a_dist.cmp(&b_dist)
            });

            drop(incoming_guard);
            drop(input);

            self.signal(QueueKind::Incoming);

            IncomingState::LostPacket
        } else {
            IncomingState::Repeated
        }
    }

    pub fn in_queue_pick(&self) -> Option<Box<[u8]>> {
        let payload = lock(&self.input).pick();
        if payload.is_some() {
            self.signal(QueueKind::Output);
        }
        payload
    }

    /// Waits up to `timeout_ms` for a payload. Returns `None` if none arrived, which includes
    /// being woken without data (a reset, or the queue set dying).
    pub fn in_queue_read(&self, timeout_ms: u64) -> Option<Box<[u8]>> {
        if let Some(payload) = self.in_queue_pick() {
            return Some(payload);
        }

        if self.is_dead() {
            return None;
        }

        self.wait(QueueKind::Input, timeout_ms);

        self.in_queue_pick()
    }

    #[cfg(test)]
    pub fn in_expected_seq(&self) -> u16 {
        lock(&self.incoming).expected_seq
    }

    #[cfg(test)]
    pub fn input_len(&self) -> usize {
        lock(&self.input).len()
    }

    #[cfg(test)]
    pub fn incoming_len(&self) -> usize {
        lock(&self.incoming).packets.len()
    }

    /// Sequences missing between the expected sequence and the reorder buffer, at most `max` of
    /// them. Returns `None` if nothing is buffered.
    pub fn missing_sequences(&self, max: usize) -> Option<Vec<u16>> {
        let incoming = lock(&self.incoming);

        if incoming.packets.is_empty() {
            return None;
        }

        let mut missing = Vec::new();
        let mut next_seq = incoming.expected_seq;

        for pdu in incoming.packets.iter() {
            let seq = pdu.seq();

            while missing.len() < max && seq_before(next_seq, seq) {
                missing.push(next_seq);
                next_seq = next_seq.wrapping_add(1);
            }

            if missing.len() >= max {
                break;
            }

            next_seq = seq.wrapping_add(1);
        }

        Some(missing)
    }

    /// Frees every queued PDU.
    pub fn clear(&self) {
        lock(&self.output).packets.clear();
        lock(&self.outcoming).clear();
        lock(&self.input).clear();
        lock(&self.incoming).packets.clear();
    }

    #[cfg(test)]
    fn with_initial_seqs(out_seq: u16, in_seq: u16) -> Self {
        let queues = Self::new();
        lock(&queues.output).next_seq = out_seq;
        lock(&queues.incoming).expected_seq = in_seq;
        queues
    }
}
