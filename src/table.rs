use std::collections::HashMap;

use super::session::{Role, SessionRef};
use super::Address;

const DEAD_HISTORY_SIZE: usize = 32;

/// Ids of recently destroyed sessions, so that stray late packets are dropped quietly.
pub(crate) struct DeadHistory {
    ids: [u32; DEAD_HISTORY_SIZE],
    next: usize,
}

impl DeadHistory {
    pub fn new() -> Self {
        Self {
            ids: [0; DEAD_HISTORY_SIZE],
            next: 0,
        }
    }

    pub fn push(&mut self, id: u32) {
        self.ids[self.next] = id;
        self.next = (self.next + 1) % DEAD_HISTORY_SIZE;
    }

    pub fn contains(&self, id: u32) -> bool {
        id != 0 && self.ids.contains(&id)
    }
}

/// Every live session of a context, indexed by id.
///
/// Slots are recycled through a free list, so a session keeps its slot for its whole life even
/// when its id changes.
pub(crate) struct SessionTable {
    slots: Vec<Option<SessionRef>>,
    free_list: Vec<usize>,
    index: HashMap<u32, usize>,
    dead: DeadHistory,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            index: HashMap::new(),
            dead: DeadHistory::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn register(&mut self, session: SessionRef) {
        let id = session.id();
        debug_assert!(!self.index.contains_key(&id));

        let slot_idx = match self.free_list.pop() {
            Some(slot_idx) => {
                self.slots[slot_idx] = Some(session);
                slot_idx
            }
            None => {
                self.slots.push(Some(session));
                self.slots.len() - 1
            }
        };

        self.index.insert(id, slot_idx);
    }

    pub fn lookup(&self, id: u32) -> Option<SessionRef> {
        if id == 0 {
            return None;
        }

        let slot_idx = *self.index.get(&id)?;
        self.slots[slot_idx].clone()
    }

    /// Finds a session playing `role` whose suggested id is `id`: for a client its former
    /// tentative id, for a server the tentative id of its peer.
    pub fn lookup_by_suggested(&self, role: Role, id: u32) -> Option<SessionRef> {
        if id == 0 {
            return None;
        }

        self.slots
            .iter()
            .flatten()
            .find(|session| session.role() == role && session.suggested_id() == id)
            .cloned()
    }

    /// Moves the session registered as `old_id` to `new_id`, remembering `old_id` as its
    /// suggested id. Fails if `new_id` is taken or `old_id` is unknown.
    pub fn rekey(&mut self, old_id: u32, new_id: u32) -> bool {
        if new_id == 0 || self.index.contains_key(&new_id) {
            return false;
        }

        let slot_idx = match self.index.remove(&old_id) {
            Some(slot_idx) => slot_idx,
            None => return false,
        };

        if let Some(ref session) = self.slots[slot_idx] {
            session.set_id(new_id);
            session.set_suggested_id(old_id);
        }

        self.index.insert(new_id, slot_idx);

        true
    }

    pub fn sessions(&self) -> Vec<SessionRef> {
        self.slots.iter().flatten().cloned().collect()
    }

    /// Removes every session marked for destruction and returns them.
    pub fn clear_waitkill(&mut self) -> Vec<SessionRef> {
        let mut removed = Vec::new();

        for (slot_idx, slot) in self.slots.iter_mut().enumerate() {
            let is_wait_kill = slot.as_ref().map_or(false, |session| session.is_wait_kill());

            if is_wait_kill {
                if let Some(session) = slot.take() {
                    let id = session.id();

                    self.index.remove(&id);
                    self.free_list.push(slot_idx);
                    self.dead.push(id);

                    removed.push(session);
                }
            }
        }

        removed
    }

    pub fn recently_dead(&self, id: u32) -> bool {
        self.dead.contains(id)
    }
}

/// Inbound sessions waiting to be returned by `listen`.
pub(crate) struct Backlog {
    slots: Vec<Option<SessionRef>>,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Stores `session` in the first free slot. Returns false if the backlog is full.
    pub fn push(&mut self, session: SessionRef) -> bool {
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(session);
                true
            }
            None => false,
        }
    }

    /// Finds the pending session created for the client's tentative id `id`.
    pub fn find_by_suggested(&self, id: u32) -> Option<SessionRef> {
        self.slots
            .iter()
            .flatten()
            .find(|session| session.suggested_id() == id)
            .cloned()
    }

    /// Removes and returns the first connected session accepted on `local_addr`. An unspecified
    /// address matches any session.
    pub fn pull_first_connected(&mut self, local_addr: &Address) -> Option<SessionRef> {
        let slot = self.slots.iter_mut().find(|slot| match slot {
            Some(session) => {
                session.is_connected()
                    && !session.is_wait_kill()
                    && (local_addr.is_unspecified() || session.local_addr() == local_addr)
            }
            None => false,
        })?;

        slot.take()
    }

    /// Removes unconnected sessions whose handshake started more than `timeout_ms` before
    /// `now_ms`.
    pub fn take_expired(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<SessionRef> {
        let mut expired = Vec::new();

        for slot in self.slots.iter_mut() {
            let is_expired = slot.as_ref().map_or(false, |session| {
                !session.is_connected() && now_ms.saturating_sub(session.first_syn_ms()) > timeout_ms
            });

            if is_expired {
                expired.extend(slot.take());
            }
        }

        expired
    }

    /// Drops every session marked for destruction.
    pub fn purge_waitkill(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map_or(false, |session| session.is_wait_kill()) {
                *slot = None;
            }
        }
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::context::tests::test_shared;
    use crate::session::SessionCore;
    use crate::CloseReason;

    use std::sync::Arc;

    fn session(role: Role, id: u32, suggested_id: u32, local_addr: Address) -> SessionRef {
        SessionCore::new(test_shared(), role, id, suggested_id, local_addr, Address::unspecified())
    }

    #[test]
    fn register_and_rekey() {
        let mut table = SessionTable::new();

        let client = session(Role::Client, 7, 0, Address::unspecified());
        table.register(Arc::clone(&client));
        table.register(session(Role::Client, 9, 0, Address::unspecified()));

        assert!(table.lookup(0).is_none());
        assert!(table.lookup(7).is_some());

        assert!(!table.rekey(7, 9));
        assert!(table.rekey(7, 42));

        assert!(table.lookup(7).is_none());
        assert_eq!(client.id(), 42);
        assert_eq!(client.suggested_id(), 7);

        let found = table.lookup_by_suggested(Role::Client, 7).unwrap();
        assert!(Arc::ptr_eq(&found, &client));
        assert!(table.lookup_by_suggested(Role::Server, 7).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn sweep_remembers_dead() {
        let mut table = SessionTable::new();

        let doomed = session(Role::Server, 5, 1, Address::unspecified());
        table.register(Arc::clone(&doomed));
        table.register(session(Role::Server, 6, 2, Address::unspecified()));

        assert!(table.clear_waitkill().is_empty());

        doomed.set_wait_kill(CloseReason::ConnectionReset);
        let removed = table.clear_waitkill();

        assert_eq!(removed.len(), 1);
        assert!(table.lookup(5).is_none());
        assert!(table.recently_dead(5));
        assert!(!table.recently_dead(6));

        // Slot is reused
        table.register(session(Role::Server, 8, 3, Address::unspecified()));
        assert_eq!(table.slots.len(), 2);
    }

    #[test]
    fn dead_history_wraps() {
        let mut dead = DeadHistory::new();

        for id in 1..=(DEAD_HISTORY_SIZE as u32 + 1) {
            dead.push(id);
        }

        assert!(!dead.contains(1));
        assert!(dead.contains(2));
        assert!(!dead.contains(0));
    }

    #[test]
    fn backlog_capacity_and_accept() {
        let local: Address = "127.0.0.1:9999".parse::<std::net::SocketAddr>().unwrap().into();
        let other: Address = "127.0.0.1:9998".parse::<std::net::SocketAddr>().unwrap().into();

        let mut backlog = Backlog::new(2);

        let first = session(Role::Server, 1, 11, local.clone());
        let second = session(Role::Server, 2, 12, other.clone());

        assert!(backlog.push(Arc::clone(&first)));
        assert!(backlog.push(Arc::clone(&second)));
        assert!(!backlog.push(session(Role::Server, 3, 13, local.clone())));

        assert!(backlog.find_by_suggested(12).is_some());

        // Nothing connected yet
        assert!(backlog.pull_first_connected(&Address::unspecified()).is_none());

        second.set_connected();
        assert!(backlog.pull_first_connected(&local).is_none());

        let accepted = backlog.pull_first_connected(&other).unwrap();
        assert!(Arc::ptr_eq(&accepted, &second));
        assert_eq!(backlog.len(), 1);

        // Freed slot is reused
        assert!(backlog.push(session(Role::Server, 4, 14, local)));
    }

    #[test]
    fn backlog_expiry_spares_connected() {
        let mut backlog = Backlog::new(4);

        let stale = session(Role::Server, 1, 11, Address::unspecified());
        let connected = session(Role::Server, 2, 12, Address::unspecified());
        connected.set_connected();

        backlog.push(Arc::clone(&stale));
        backlog.push(Arc::clone(&connected));

        assert!(backlog.take_expired(stale.first_syn_ms() + 100, 100).is_empty());

        let expired = backlog.take_expired(stale.first_syn_ms() + 101, 100);
        assert_eq!(expired.len(), 1);
        assert!(Arc::ptr_eq(&expired[0], &stale));
        assert_eq!(backlog.len(), 1);

        connected.set_wait_kill(CloseReason::StateCleared);
        backlog.purge_waitkill();
        assert_eq!(backlog.len(), 0);
    }
}
