//! Per-session sender thread and the functions that schedule its work.
//!
//! Every transmission other than SYN and the receiver's handshake replies happens on the sender
//! thread, driven by the session's four timers.

use std::io;
use std::iter;

use tracing::{debug, trace, warn};

use super::event::lock;
use super::frame::{Pdu, ENTRIES_PER_PDU_MAX};
use super::session::queues::Retransmit;
use super::session::timers::TimerName;
use super::session::{SessionCore, SessionRef};
use super::CloseReason;

pub(crate) fn run(session: SessionRef) {
    let ref epoch = session.shared.epoch;

    trace!("session {:08x}: sender started", session.id());

    while let Some(name) = session.timers.wait_next(epoch) {
        if session.is_wait_kill() {
            break;
        }

        let result = match name {
            TimerName::Ack => send_pending_acks(&session),
            TimerName::Repeat => handle_repeat(&session),
            TimerName::Lost => ask_for_lost(&session),
            TimerName::Send => handle_send(&session),
        };

        if let Err(err) = result {
            warn!("session {:08x}: {:?} handler failed: {}", session.id(), name, err);

            session.set_wait_kill(CloseReason::InternalError);
            session.shared.signal_new_state();
            break;
        }
    }

    trace!("session {:08x}: sender stopped", session.id());
}

/// Schedules transmission of the output queue.
pub(crate) fn sched_send(session: &SessionCore) {
    let ref shared = session.shared;
    let deadline_ms = shared.epoch.deadline_ms(shared.config.send_delay_ms);
    session.timers.arm_if_idle(TimerName::Send, deadline_ms);
}

/// Records `seq` for acknowledgement. Acknowledgements are coalesced over the ack delay.
pub(crate) fn sched_ack(session: &SessionCore, seq: u16) {
    lock(&session.acks).put(seq);

    let ref shared = session.shared;
    let deadline_ms = shared.epoch.deadline_ms(shared.config.ack_delay_ms);
    session.timers.arm_if_idle(TimerName::Ack, deadline_ms);
}

/// Schedules a prompt retransmission sweep.
pub(crate) fn sched_repeat(session: &SessionCore) {
    let ref shared = session.shared;
    let deadline_ms = shared.epoch.deadline_ms(shared.config.repeat_delay_ms);
    session.timers.arm_earliest(TimerName::Repeat, deadline_ms);
}

/// Schedules the next periodic retransmission sweep, unless one is due sooner.
pub(crate) fn sched_repeat_periodically(session: &SessionCore) {
    let ref shared = session.shared;
    let deadline_ms = shared.epoch.deadline_ms(shared.config.repeat_check_period_ms);
    session.timers.arm_earliest(TimerName::Repeat, deadline_ms);
}

/// Schedules a REPEAT request for the gaps in the reorder buffer.
pub(crate) fn sched_lost(session: &SessionCore) {
    let ref shared = session.shared;
    let deadline_ms = shared.epoch.deadline_ms(shared.config.lost_delay_ms);
    session.timers.arm_if_idle(TimerName::Lost, deadline_ms);
}

/// Sends every queued acknowledgement, at most [`ENTRIES_PER_PDU_MAX`] per ACK.
pub(crate) fn send_pending_acks(session: &SessionCore) -> io::Result<()> {
    loop {
        let seqs = {
            let mut acks = lock(&session.acks);
            iter::from_fn(|| acks.pick())
                .take(ENTRIES_PER_PDU_MAX)
                .collect::<Vec<u16>>()
        };

        if seqs.is_empty() {
            return Ok(());
        }

        session.transmit(&Pdu::ack(0, &seqs))?;
    }
}

fn handle_send(session: &SessionCore) -> io::Result<()> {
    let ref epoch = session.shared.epoch;
    let mut sent = 0;

    loop {
        let now_ms = epoch.time_now_ms();

        let pdu = match session.queues.out_queue_pick(now_ms) {
            Some(pdu) => pdu,
            None => break,
        };

        // Flush acknowledgements that are due before more data
        if session.timers.take_expired(TimerName::Ack, now_ms) {
            send_pending_acks(session)?;
        }

        session.transmit(&pdu)?;
        sent += 1;
    }

    if sent > 0 {
        trace!("session {:08x}: sent {} packets", session.id(), sent);
        sched_repeat_periodically(session);
    }

    Ok(())
}

fn handle_repeat(session: &SessionCore) -> io::Result<()> {
    let ref shared = session.shared;
    let ref config = shared.config;

    if !session.is_connected() {
        if session.is_server() {
            // Handshake ACK still missing
            let synack = Pdu::synack(session.suggested_id(), session.id());
            shared.send_pdu(session.local_addr(), session.remote_addr(), &synack)?;

            trace!("session {:08x}: SYNACK resent", session.id());

            sched_repeat_periodically(session);
        }
        return Ok(());
    }

    if !repeat_unconfirmed(session) {
        return Ok(());
    }

    let now_ms = shared.epoch.time_now_ms();

    if let Some(timeout_ms) = session
        .queues
        .out_get_min_timeout(now_ms, config.repeat_timeout_ms)
    {
        let delay_ms = timeout_ms.clamp(config.repeat_delay_ms, config.repeat_check_period_ms);
        session
            .timers
            .arm_earliest(TimerName::Repeat, shared.epoch.deadline_ms(delay_ms));
    }

    Ok(())
}

/// Retransmits every in-flight PDU that is due. Returns false if a PDU ran out of retries and
/// the session was killed.
fn repeat_unconfirmed(session: &SessionCore) -> bool {
    let ref shared = session.shared;
    let ref config = shared.config;

    let highest_ack = session.highest_ack();

    for seq in session.queues.outcoming_seqs() {
        let now_ms = shared.epoch.time_now_ms();

        match session.queues.retransmit(
            seq,
            highest_ack,
            now_ms,
            config.repeat_timeout_ms,
            config.max_retry,
        ) {
            Retransmit::Skip => (),
            Retransmit::Send(pdu) => {
                trace!("session {:08x}: retransmitting seq {}", session.id(), seq);

                // The retry was counted, so the next sweep tries again
                if let Err(err) = session.transmit(&pdu) {
                    debug!("session {:08x}: resend of seq {} failed: {}", session.id(), seq, err);
                }
            }
            Retransmit::Exhausted => {
                warn!(
                    "session {:08x}: seq {} unacknowledged after {} retries",
                    session.id(),
                    seq,
                    config.max_retry
                );

                session.set_wait_kill(CloseReason::AckTimeout);
                shared.signal_new_state();

                return false;
            }
        }
    }

    true
}

fn ask_for_lost(session: &SessionCore) -> io::Result<()> {
    let missing = match session.queues.missing_sequences(ENTRIES_PER_PDU_MAX) {
        Some(missing) => missing,
        None => return Ok(()),
    };

    if !missing.is_empty() {
        debug!(
            "session {:08x}: requesting {} missing packets from seq {}",
            session.id(),
            missing.len(),
            missing[0]
        );

        session.transmit(&Pdu::repeat(0, &missing))?;
    }

    // Gaps remain until the requested packets arrive
    sched_lost(session);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::backend::{Backend, Datagram};
    use crate::context::tests::test_shared;
    use crate::context::{Config, Shared};
    use crate::session::Role;
    use crate::Address;

    /// Backend whose `fail_at`-th send fails once.
    struct FlakyBackend {
        sends: Arc<AtomicUsize>,
        fail_at: usize,
    }

    impl Backend for FlakyBackend {
        fn mtu(&self) -> u32 {
            768
        }

        fn send_to(&self, _src: &Address, _dst: &Address, _bytes: &[u8]) -> io::Result<()> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_at {
                return Err(io::Error::new(io::ErrorKind::Other, "no buffer space"));
            }
            Ok(())
        }

        fn recv_from(&self) -> io::Result<Option<Datagram>> {
            Ok(None)
        }

        fn wait_ready(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn wake(&self) {}
    }

    fn connected_session() -> SessionRef {
        connected_session_on(test_shared())
    }

    fn connected_session_on(shared: Arc<Shared>) -> SessionRef {
        let session = SessionCore::new(
            shared,
            Role::Client,
            0x0A0B_0C0D,
            0,
            Address::unspecified(),
            Address::unspecified(),
        );
        session.set_connected();
        session
    }

    #[test]
    fn acks_are_coalesced() {
        let session = connected_session();

        for seq in 0..250 {
            sched_ack(&session, seq);
        }

        let deadline = session.timers.deadline(TimerName::Ack).unwrap();
        sched_ack(&session, 250);
        assert_eq!(session.timers.deadline(TimerName::Ack), Some(deadline));

        send_pending_acks(&session).unwrap();
        assert!(lock(&session.acks).is_empty());
    }

    #[test]
    fn send_moves_output_in_flight() {
        let session = connected_session();

        session.queues.out_queue_write(b"one").unwrap();
        session.queues.out_queue_write(b"two").unwrap();

        handle_send(&session).unwrap();

        assert_eq!(session.queues.output_len(), 0);
        assert_eq!(session.queues.outcoming_seqs(), vec![0, 1]);
        assert!(session.timers.deadline(TimerName::Repeat).is_some());
    }

    #[test]
    fn exhausted_retries_kill_session() {
        let session = connected_session();

        session.queues.out_queue_write(b"lost").unwrap();
        handle_send(&session).unwrap();

        let max_retry = session.shared.config.max_retry;
        for _ in 0..max_retry {
            session.queues.expedite([0]);
            assert!(repeat_unconfirmed(&session));
        }

        session.queues.expedite([0]);
        assert!(!repeat_unconfirmed(&session));
        assert_eq!(session.close_reason(), Some(CloseReason::AckTimeout));
    }

    #[test]
    fn failed_resend_keeps_session() {
        let sends = Arc::new(AtomicUsize::new(0));
        let backend = FlakyBackend {
            sends: Arc::clone(&sends),
            fail_at: 2,
        };
        let shared = Arc::new(Shared::new(
            Config::default(),
            Box::new(backend),
            Address::unspecified(),
        ));
        let session = connected_session_on(shared);

        session.queues.out_queue_write(b"payload").unwrap();
        handle_send(&session).unwrap();
        assert_eq!(sends.load(Ordering::SeqCst), 1);

        // First resend hits the failing send
        session.queues.expedite([0]);
        handle_repeat(&session).unwrap();
        assert_eq!(sends.load(Ordering::SeqCst), 2);
        assert!(!session.is_wait_kill());
        assert_eq!(session.queues.outcoming_seqs(), vec![0]);

        session.queues.expedite([0]);
        handle_repeat(&session).unwrap();
        assert_eq!(sends.load(Ordering::SeqCst), 3);
        assert!(!session.is_wait_kill());
    }

    #[test]
    fn lost_request_rearms() {
        let session = connected_session();

        assert_eq!(
            session.queues.in_put(Pdu::data(2, b"late".to_vec().into())),
            crate::session::queues::IncomingState::LostPacket
        );

        ask_for_lost(&session).unwrap();
        assert!(session.timers.deadline(TimerName::Lost).is_some());
    }

    #[test]
    fn sender_thread_exits_on_kill() {
        let session = connected_session();
        session.start_sender().unwrap();

        session.queues.out_queue_write(b"data").unwrap();
        sched_send(&session);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(session.queues.outcoming_len(), 1);

        session.set_wait_kill(CloseReason::StateCleared);
        session.mark_disposed();
        session.teardown(CloseReason::StateCleared);
    }
}
