//! The context's receiver thread: demultiplexes datagrams to sessions, runs the server side of
//! the handshake, and destroys sessions marked for destruction.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::backend::Datagram;
use super::context::Shared;
use super::event::lock;
use super::frame::{self, PacketType, Pdu, DEFENSIVE_RST_SEQ};
use super::sender;
use super::session::queues::{IncomingState, QueueKind};
use super::session::{Role, SessionCore, SessionRef};
use super::CloseReason;

const WAIT_READY_TIMEOUT: Duration = Duration::from_millis(1000);

pub(crate) fn run(shared: Arc<Shared>) {
    debug!("receiver started");

    while !shared.is_shut_down() {
        if let Err(err) = shared.backend.wait_ready(Some(WAIT_READY_TIMEOUT)) {
            warn!("backend wait failed: {}", err);
        }

        if shared.take_new_state() {
            clear_waitkill_sessions(&shared);
        }

        loop {
            match shared.backend.recv_from() {
                Ok(Some(datagram)) => handle_datagram(&shared, datagram),
                Ok(None) => break,
                Err(err) => {
                    warn!("backend receive failed: {}", err);
                    break;
                }
            }
        }
    }

    clear_waitkill_sessions(&shared);
    lock(&shared.backlog).clear();

    debug!("receiver stopped");
}

/// Removes every session marked for destruction from the table and the backlog, and wakes
/// threads waiting on their disposal.
fn clear_waitkill_sessions(shared: &Arc<Shared>) {
    let removed = lock(&shared.table).clear_waitkill();

    if removed.is_empty() {
        return;
    }

    lock(&shared.backlog).purge_waitkill();

    for session in removed {
        debug!("session {:08x}: destroyed", session.id());
        session.mark_disposed();
    }
}

fn handle_datagram(shared: &Arc<Shared>, datagram: Datagram) {
    if datagram.src != shared.remote_addr {
        trace!("dropping datagram from unexpected source {:?}", datagram.src);
        return;
    }

    let pdu = match frame::serial::read(&datagram.bytes) {
        Ok(pdu) => pdu,
        Err(err) => {
            debug!("dropping invalid frame: {}", err);
            return;
        }
    };

    let session_id = pdu.session_id();

    trace!(
        "session {:08x}: <- {:?} field {:08x} ({} bytes)",
        session_id,
        pdu.packet_type(),
        pdu.header.field,
        pdu.payload.len()
    );

    if session_id == 0 {
        return;
    }

    let session = lock(&shared.table).lookup(session_id);

    match session {
        Some(session) => handle_session_pdu(shared, &session, pdu),
        None => handle_unmatched_pdu(shared, &datagram, pdu),
    }
}

fn expire_backlog(shared: &Arc<Shared>) {
    let now_ms = shared.epoch.time_now_ms();
    let expired = lock(&shared.backlog).take_expired(now_ms, shared.config.synack_timeout_ms);

    if expired.is_empty() {
        return;
    }

    for session in expired {
        debug!(
            "session {:08x}: handshake not completed after {}ms",
            session.id(),
            shared.config.synack_timeout_ms
        );
        session.set_wait_kill(CloseReason::ConnectionTimeout);
    }

    clear_waitkill_sessions(shared);
}

fn handle_unmatched_pdu(shared: &Arc<Shared>, datagram: &Datagram, pdu: Pdu) {
    expire_backlog(shared);

    match pdu.packet_type() {
        PacketType::Syn => handle_syn(shared, datagram, pdu.session_id()),
        PacketType::SynAck => {
            // Our ACK was lost and the server resent SYNACK to our former id
            let client = lock(&shared.table).lookup_by_suggested(Role::Client, pdu.session_id());

            if let Some(client) = client {
                if client.is_connected() && client.id() == pdu.new_session_id() {
                    trace!("session {:08x}: re-acknowledging SYNACK", client.id());

                    if let Err(err) = client.transmit(&Pdu::handshake_ack(0)) {
                        warn!("session {:08x}: ACK failed: {}", client.id(), err);
                    }
                }
            }
        }
        packet_type => {
            if lock(&shared.table).recently_dead(pdu.session_id()) {
                trace!("session {:08x}: late {:?} dropped", pdu.session_id(), packet_type);
            } else {
                debug!(
                    "session {:08x}: {:?} for unknown session dropped",
                    pdu.session_id(),
                    packet_type
                );
            }
        }
    }
}

fn handle_syn(shared: &Arc<Shared>, datagram: &Datagram, suggested_id: u32) {
    let pending = lock(&shared.backlog).find_by_suggested(suggested_id);

    if let Some(session) = pending {
        // Duplicate SYN, the first SYNACK was probably lost
        let synack = Pdu::synack(suggested_id, session.id());
        if let Err(err) = shared.send_pdu(session.local_addr(), session.remote_addr(), &synack) {
            warn!("session {:08x}: SYNACK failed: {}", session.id(), err);
        }
        return;
    }

    if lock(&shared.table)
        .lookup_by_suggested(Role::Server, suggested_id)
        .is_some()
    {
        trace!("duplicate SYN from {:08x} for an accepted session", suggested_id);
        return;
    }

    let id = shared.random_session_id();

    let session = SessionCore::new(
        Arc::clone(shared),
        Role::Server,
        id,
        suggested_id,
        datagram.dst.clone(),
        datagram.src.clone(),
    );

    lock(&shared.table).register(Arc::clone(&session));

    if !lock(&shared.backlog).push(Arc::clone(&session)) {
        warn!(
            "session {:08x}: listen backlog full, refusing {:08x}",
            id, suggested_id
        );

        session.set_wait_kill(CloseReason::TooManyConnections);
        clear_waitkill_sessions(shared);

        let rst = Pdu::rst(suggested_id, DEFENSIVE_RST_SEQ);
        if let Err(err) = shared.send_pdu(&datagram.dst, &datagram.src, &rst) {
            warn!("RST to {:08x} failed: {}", suggested_id, err);
        }
        return;
    }

    if let Err(err) = session.start_sender() {
        warn!("session {:08x}: failed to start sender: {}", id, err);
        session.set_wait_kill(CloseReason::InternalError);
        clear_waitkill_sessions(shared);
        return;
    }

    debug!("session {:08x}: SYN from {:08x}", id, suggested_id);

    let synack = Pdu::synack(suggested_id, id);
    if let Err(err) = shared.send_pdu(session.local_addr(), session.remote_addr(), &synack) {
        warn!("session {:08x}: SYNACK failed: {}", id, err);
    }

    sender::sched_repeat_periodically(&session);
}

fn handle_session_pdu(shared: &Arc<Shared>, session: &SessionRef, pdu: Pdu) {
    if session.is_wait_kill() {
        trace!("session {:08x}: dropping {:?}, session closing", session.id(), pdu.packet_type());
        return;
    }

    if !session.is_connected() {
        if let Some(pdu) = handle_handshake_pdu(shared, session, pdu) {
            handle_connected_pdu(session, pdu);
        }
    } else {
        handle_connected_pdu(session, pdu);
    }
}

/// Advances the handshake of an unconnected session. Returns the PDU if it should also be
/// processed as connected traffic.
fn handle_handshake_pdu(shared: &Arc<Shared>, session: &SessionRef, pdu: Pdu) -> Option<Pdu> {
    match (session.role(), pdu.packet_type()) {
        (Role::Server, PacketType::Ack) => {
            if session.set_connected() {
                debug!("session {:08x}: handshake complete", session.id());
                shared.new_connection.set();
            }
            None
        }
        (Role::Server, PacketType::Data) => {
            // Handshake ACK lost, but the client is already sending
            if session.set_connected() {
                debug!("session {:08x}: connected by early DATA", session.id());
                shared.new_connection.set();
            }
            Some(pdu)
        }
        (Role::Client, PacketType::SynAck) => {
            let old_id = session.id();
            let new_id = pdu.new_session_id();

            if !lock(&shared.table).rekey(old_id, new_id) {
                warn!(
                    "session {:08x}: SYNACK assigns id {:08x} already in use",
                    old_id, new_id
                );
                session.set_wait_kill(CloseReason::InternalError);
                shared.signal_new_state();
                return None;
            }

            session.set_connected();

            if let Err(err) = session.transmit(&Pdu::handshake_ack(0)) {
                warn!("session {:08x}: ACK failed: {}", new_id, err);
            }

            session.connection_event.set();
            None
        }
        (_, PacketType::Rst) => {
            debug!("session {:08x}: handshake reset by peer", session.id());

            session.set_wait_kill(CloseReason::ConnectionReset);
            session.connection_event.set();
            shared.signal_new_state();
            None
        }
        (_, packet_type) => {
            debug!(
                "session {:08x}: unexpected {:?} during handshake",
                session.id(),
                packet_type
            );

            if let Err(err) = session.transmit(&Pdu::rst(0, DEFENSIVE_RST_SEQ)) {
                warn!("session {:08x}: RST failed: {}", session.id(), err);
            }
            None
        }
    }
}

fn handle_connected_pdu(session: &SessionRef, pdu: Pdu) {
    match pdu.packet_type() {
        PacketType::Data | PacketType::Rst => {
            let seq = pdu.seq();

            match session.queues.in_put(pdu) {
                IncomingState::LostPacket => sender::sched_lost(session),
                IncomingState::Close => {
                    debug!("session {:08x}: reset by peer at seq {}", session.id(), seq);

                    if session.mark_reset_sent() {
                        session.queues.out_queue_reset();
                        sender::sched_send(session);
                    }

                    // Wake readers and writers so they observe the reset
                    session.queues.signal(QueueKind::Input);
                    session.flow.signal();
                }
                IncomingState::Expected | IncomingState::ZeroPacket | IncomingState::Repeated => (),
            }

            sender::sched_ack(session, seq);
        }
        PacketType::Ack => {
            let mut acked = 0;

            for seq in pdu.entries() {
                if session.queues.out_queue_ack_packet(seq) {
                    acked += 1;
                }
                session.note_ack(seq);
            }

            trace!("session {:08x}: {} packets acknowledged", session.id(), acked);

            if session.flow.can_unlock(session.queues.in_flight_count()) {
                session.flow.signal();
            }

            sender::sched_repeat_periodically(session);
        }
        PacketType::Repeat => {
            let found = session.queues.expedite(pdu.entries());

            debug!(
                "session {:08x}: peer requested {} packets, {} in flight",
                session.id(),
                pdu.count(),
                found
            );

            sender::sched_repeat(session);
        }
        packet_type => {
            trace!("session {:08x}: ignoring {:?}", session.id(), packet_type);
        }
    }
}
