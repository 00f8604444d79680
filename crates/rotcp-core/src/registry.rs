//! The process-wide session table. Global mutable state (the live session
//! list, the relay's group-id allocator) is confined to this module and
//! exposed through an explicit registry, not free statics, per the
//! reactor's ownership discipline.

use std::collections::HashMap;

use mio::Token;

use crate::handshake::GroupIdAllocator;
use crate::session::Session;

/// Non-owning handle to a live session: a slot index into the registry's
/// arena. A Remote's back-reference to its Session is expressed this way,
/// never as a second owning pointer.
pub type SessionId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Local(SessionId),
    Remote(SessionId, usize),
}

#[derive(Default)]
pub struct SessionRegistry {
    slots: Vec<Option<Session>>,
    free: Vec<SessionId>,
    group_index: HashMap<u32, SessionId>,
    tokens: HashMap<Token, Owner>,
    pub group_ids: GroupIdAllocator,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            group_index: HashMap::new(),
            tokens: HashMap::new(),
            group_ids: GroupIdAllocator::new(),
        }
    }

    pub fn insert(&mut self, session: Session) -> SessionId {
        let id = if let Some(id) = self.free.pop() {
            self.slots[id] = Some(session);
            id
        } else {
            self.slots.push(Some(session));
            self.slots.len() - 1
        };
        let group_id = self.slots[id].as_ref().unwrap().group_id;
        if group_id != 0 {
            self.group_index.insert(group_id, id);
        }
        self.bind_token(self.slots[id].as_ref().unwrap().local.token, Owner::Local(id));
        for (idx, r) in self.slots[id].as_ref().unwrap().remotes.iter().enumerate() {
            self.tokens.insert(r.token, Owner::Remote(id, idx));
        }
        id
    }

    fn bind_token(&mut self, token: Token, owner: Owner) {
        self.tokens.insert(token, owner);
    }

    pub fn lookup_token(&self, token: Token) -> Option<Owner> {
        self.tokens.get(&token).copied()
    }

    /// Proxy-side: updates a session's group id once the first outbound
    /// handshake resolves it (sessions are created with `group_id == 0`
    /// at client-accept time, before any remote has connected).
    pub fn set_group_id(&mut self, id: SessionId, group_id: u32) {
        if let Some(session) = self.slots.get_mut(id).and_then(Option::as_mut) {
            session.record_group_id(group_id);
            self.group_index.insert(group_id, id);
        }
    }

    pub fn register_remote(&mut self, id: SessionId, remote_idx: usize, token: Token) {
        self.tokens.insert(token, Owner::Remote(id, remote_idx));
    }

    pub fn by_group(&self, group_id: u32) -> Option<SessionId> {
        self.group_index.get(&group_id).copied()
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionId, &Session)> {
        self.slots.iter().enumerate().filter_map(|(id, s)| s.as_ref().map(|s| (id, s)))
    }

    /// Tears down a session: closes every fd transitively (by dropping the
    /// sockets and pipes), removes it from the registry, releases its
    /// group id, and forgets every token that pointed at it. Idempotent —
    /// a missing id is a no-op.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.slots.get_mut(id).and_then(Option::take)?;
        self.free.push(id);
        if session.group_id != 0 {
            self.group_index.remove(&session.group_id);
            self.group_ids.release(session.group_id);
        }
        self.tokens.retain(|_, owner| !matches!(owner,
            Owner::Local(sid) | Owner::Remote(sid, _) if *sid == id));
        Some(session)
    }
}
