//! Reactor binding: owns the listener, the mio `Poll`, and the dispatch of
//! readiness events onto sessions and in-flight handshakes. Implemented as
//! explicit per-socket state machines driven from `Poll`/`Token`/`Interest`
//! rather than async tasks, keeping the single-reactor-thread, no-lock
//! invariant trivially true.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use crate::config::{ReactorConfig, Role};
use crate::endpoint::{bind_listener, connect_any, take_socket_error};
use crate::handshake::{HandshakeOutcome, PendingEgress, PendingIngress};
use crate::local::LocalEndpoint;
use crate::registry::{Owner, SessionId, SessionRegistry};
use crate::remote::Remote;
use crate::session::{PumpOutcome, Session};

const LISTENER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    registry: SessionRegistry,
    pending_ingress: HashMap<Token, PendingIngress>,
    pending_egress: HashMap<Token, (SessionId, PendingEgress)>,
    /// Proxy-side sessions whose first egress connection hasn't resolved a
    /// real group id yet: the remaining `usize` connections to dial once it
    /// does (see `spawn_proxy_session`).
    pending_dials: HashMap<SessionId, usize>,
    next_token: usize,
    config: ReactorConfig,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = bind_listener(config.local_addr, config.backlog)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listener,
            registry: SessionRegistry::new(),
            pending_ingress: HashMap::new(),
            pending_egress: HashMap::new(),
            pending_dials: HashMap::new(),
            next_token: 1,
            config,
        })
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Runs until `shutdown` is observed. No new sessions are accepted
    /// once set; in-flight chunks are not flushed. `dump` triggers a
    /// non-destructive debug dump of every session (the `SIGUSR1` path).
    pub fn run(&mut self, shutdown: &AtomicBool, dump: &AtomicBool) -> std::io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let tokens: Vec<(Token, ReadinessFlags)> = self
                .events
                .iter()
                .map(|ev| (ev.token(), ReadinessFlags { readable: ev.is_readable(), writable: ev.is_writable() }))
                .collect();

            for (token, ev) in tokens {
                if token == LISTENER {
                    if shutdown.load(Ordering::Relaxed) {
                        continue;
                    }
                    self.accept_loop();
                    continue;
                }
                self.dispatch(token, ev);
            }

            if dump.swap(false, Ordering::Relaxed) {
                self.dump_sessions();
            }

            if shutdown.load(Ordering::Relaxed) {
                info!("shutdown signal observed, exiting reactor loop");
                return Ok(());
            }
        }
    }

    fn dispatch(&mut self, token: Token, ev: ReadinessFlags) {
        if self.pending_ingress.contains_key(&token) {
            self.drive_ingress(token, ev);
            return;
        }
        if self.pending_egress.contains_key(&token) {
            self.drive_egress(token, ev);
            return;
        }
        match self.registry.lookup_token(token) {
            Some(Owner::Local(id)) => self.drive_local(id, ev),
            Some(Owner::Remote(id, idx)) => self.drive_remote(id, idx, ev),
            None => debug!(?token, "readiness event for unknown token, ignoring"),
        }
    }

    // ---- Accept / ingress (relay) --------------------------------------

    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = self.alloc_token();
                    if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                        warn!(%addr, error = %e, "failed to register accepted socket");
                        continue;
                    }
                    match self.config.role {
                        Role::Relay => {
                            self.pending_ingress.insert(token, PendingIngress::new(stream, token, addr));
                        }
                        Role::Proxy => {
                            // A proxy's listener faces its own local
                            // client, not a peer relay; no handshake on
                            // accept. One client yields one session.
                            self.spawn_proxy_session(stream, token, addr);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn drive_ingress(&mut self, token: Token, ev: ReadinessFlags) {
        let outcome = {
            let pending = self.pending_ingress.get_mut(&token).unwrap();
            if ev.readable && !pending.is_writing() {
                pending.drive_read()
            } else if ev.writable && pending.is_writing() {
                pending.drive_write()
            } else {
                return;
            }
        };
        match outcome {
            HandshakeOutcome::Pending => {
                let requested = self.pending_ingress.get(&token).and_then(PendingIngress::requested_group_id);
                if let Some(requested) = requested {
                    self.resolve_ingress_group(token, requested);
                } else {
                    self.rearm_pending(token);
                }
            }
            HandshakeOutcome::Failed(reason) => {
                debug!(?token, reason, "ingress handshake failed");
                self.drop_pending_ingress(token);
            }
            HandshakeOutcome::Done { group_id } => self.complete_ingress(token, group_id),
        }
    }

    fn resolve_ingress_group(&mut self, token: Token, requested: u32) {
        let Some(mut pending) = self.pending_ingress.remove(&token) else { return };
        if requested == 0 {
            let group_id = self.registry.group_ids.allocate();
            pending.set_echo(group_id);
        } else if self.registry.by_group(requested).is_some() || self.registry.group_ids.is_live(requested) {
            pending.set_echo(requested);
        } else {
            pending.set_echo(0);
        }
        let _ = self.poll.registry().reregister(&mut pending.stream, token, Interest::WRITABLE);
        self.pending_ingress.insert(token, pending);
    }

    fn rearm_pending(&mut self, token: Token) {
        if let Some(pending) = self.pending_ingress.get_mut(&token) {
            let interest = if pending.is_writing() { Interest::WRITABLE } else { Interest::READABLE };
            let _ = self.poll.registry().reregister(&mut pending.stream, token, interest);
        }
    }

    fn drop_pending_ingress(&mut self, token: Token) {
        if let Some(mut pending) = self.pending_ingress.remove(&token) {
            let _ = self.poll.registry().deregister(&mut pending.stream);
        }
    }

    fn complete_ingress(&mut self, token: Token, group_id: u32) {
        let Some(pending) = self.pending_ingress.remove(&token) else { return };
        if group_id == 0 {
            // Rejected: echoed 0, nothing more to do.
            return;
        }
        if let Some(id) = self.registry.by_group(group_id) {
            // Additional remote for an existing session.
            if let Some(session) = self.registry.get_mut(id) {
                let remote = Remote::new(pending.stream, token, pending.addr, true);
                let idx = session.add_remote(remote);
                self.registry.register_remote(id, idx, token);
                info!(group_id, remote = %pending.addr, "attached additional remote to existing session");
            }
            return;
        }

        // First socket for a brand new group: dial the relay's own
        // upstream service to become this session's local endpoint.
        match connect_any(std::slice::from_ref(&self.config.remote_addr)) {
            Ok((mut upstream, addr)) => {
                let local_token = self.alloc_token();
                if self.poll.registry().register(&mut upstream, local_token, Interest::READABLE | Interest::WRITABLE).is_err() {
                    return;
                }
                let local = LocalEndpoint::new(upstream, local_token, addr, false);
                let mut session = match Session::new(group_id, local) {
                    Ok(session) => session,
                    Err(e) => {
                        let e = crate::error::SessionError::ResourceExhausted(e);
                        warn!(error = %e, "aborting new relay session");
                        return;
                    }
                };
                let remote = Remote::new(pending.stream, token, pending.addr, true);
                session.add_remote(remote);
                let _enter = session.span.enter();
                info!("new relay session established");
                drop(_enter);
                self.registry.insert(session);
            }
            Err(e) => {
                warn!(error = %e, "failed to dial upstream service for new relay session");
            }
        }
    }

    // ---- Outbound (proxy) ----------------------------------------------

    fn spawn_proxy_session(&mut self, mut client: mio::net::TcpStream, token: Token, client_addr: SocketAddr) {
        // Accepted sockets are already connected; widen the interest the
        // listener registered it under (read-only) to also watch writes.
        let _ = self.poll.registry().reregister(&mut client, token, Interest::READABLE | Interest::WRITABLE);
        let local = LocalEndpoint::new(client, token, client_addr, true);
        let session = match Session::new(0, local) {
            Ok(session) => session,
            Err(e) => {
                let e = crate::error::SessionError::ResourceExhausted(e);
                warn!(error = %e, "aborting new proxy session");
                return;
            }
        };
        let id = self.registry.insert(session);
        // Dial one connection first; its handshake is the one that resolves
        // the group id every subsequent connection must present (requesting
        // 0 from each would make the relay allocate N independent
        // one-remote sessions instead of striping one session across N).
        // The rest are dialed once that id is known, in `drive_egress`.
        self.dial_remote(id);
        let remaining = self.config.connections.max(1) - 1;
        if remaining > 0 {
            self.pending_dials.insert(id, remaining);
        }
    }

    fn dial_remote(&mut self, id: SessionId) {
        match connect_any(std::slice::from_ref(&self.config.remote_addr)) {
            Ok((mut stream, addr)) => {
                let token = self.alloc_token();
                if self.poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE).is_err() {
                    return;
                }
                let requested = self.registry.get(id).map_or(0, |s| s.group_id);
                let egress = PendingEgress::new(stream, token, addr, requested, false);
                self.pending_egress.insert(token, (id, egress));
            }
            Err(e) => warn!(error = %e, "failed to dial remote for proxy session"),
        }
    }

    fn drive_egress(&mut self, token: Token, ev: ReadinessFlags) {
        let outcome = {
            let Some((_, egress)) = self.pending_egress.get_mut(&token) else { return };
            if ev.writable && egress.wants_write() {
                egress.on_writable()
            } else if ev.readable {
                egress.on_readable()
            } else {
                return;
            }
        };
        match outcome {
            HandshakeOutcome::Pending => {
                if let Some((_, egress)) = self.pending_egress.get_mut(&token) {
                    let interest = if egress.wants_write() { Interest::WRITABLE } else { Interest::READABLE };
                    let _ = self.poll.registry().reregister(&mut egress.stream, token, interest);
                }
            }
            HandshakeOutcome::Failed(reason) => {
                if let Some((id, mut egress)) = self.pending_egress.remove(&token) {
                    warn!(?token, reason, "egress handshake failed, tearing down proxy session");
                    let _ = self.poll.registry().deregister(&mut egress.stream);
                    self.teardown(id);
                }
            }
            HandshakeOutcome::Done { group_id } => {
                if let Some((id, egress)) = self.pending_egress.remove(&token) {
                    let just_grouped = self.registry.get(id).is_some_and(|s| s.group_id == 0);
                    if just_grouped {
                        self.registry.set_group_id(id, group_id);
                    }
                    if let Some(session) = self.registry.get_mut(id) {
                        let remote = Remote::new(egress.stream, token, egress.addr, true);
                        let idx = session.add_remote(remote);
                        self.registry.register_remote(id, idx, token);
                        debug!(group_id, remote = %egress.addr, "proxy remote connected");
                    }
                    // The group id was just resolved by this, the first
                    // connection: dial the rest now that they have a real
                    // id to present instead of the placeholder 0.
                    if just_grouped {
                        if let Some(remaining) = self.pending_dials.remove(&id) {
                            for _ in 0..remaining {
                                self.dial_remote(id);
                            }
                        }
                    }
                }
            }
        }
    }

    // ---- Session I/O -----------------------------------------------------

    fn drive_local(&mut self, id: SessionId, ev: ReadinessFlags) {
        let span = self.registry.get(id).map(|s| s.span.clone());
        let _enter = span.as_ref().map(tracing::Span::enter);
        let mut fail: Option<crate::error::SessionError> = None;
        if let Some(session) = self.registry.get_mut(id) {
            if !session.local.connected && ev.writable {
                match take_socket_error(&session.local.stream) {
                    Ok(()) => session.local.connected = true,
                    Err(_) => fail = Some(crate::error::SessionError::PeerClosed),
                }
            }
            if fail.is_none() && ev.readable {
                if let PumpOutcome::Failed(e) = session.pump_local_read() {
                    fail = Some(e);
                }
            }
            if fail.is_none() {
                if let PumpOutcome::Failed(e) = session.pump_schedule() {
                    fail = Some(e);
                }
            }
            if fail.is_none() && ev.writable {
                if let PumpOutcome::Failed(e) = session.pump_local_write() {
                    fail = Some(e);
                }
            }
        }
        match fail {
            Some(e) => self.fail_session(id, e),
            None => self.resync_interests(id),
        }
    }

    fn drive_remote(&mut self, id: SessionId, idx: usize, ev: ReadinessFlags) {
        let span = self.registry.get(id).map(|s| s.span.clone());
        let _enter = span.as_ref().map(tracing::Span::enter);
        let mut fail: Option<crate::error::SessionError> = None;
        if let Some(session) = self.registry.get_mut(id) {
            if idx >= session.remotes.len() {
                return;
            }
            if !session.remotes[idx].connected && ev.writable {
                match take_socket_error(&session.remotes[idx].stream) {
                    Ok(()) => session.remotes[idx].connected = true,
                    Err(_) => fail = Some(crate::error::SessionError::PeerClosed),
                }
            }
            if fail.is_none() && ev.readable {
                if let PumpOutcome::Failed(e) = session.pump_reassembly(idx) {
                    fail = Some(e);
                }
            }
            if fail.is_none() && ev.writable {
                if let PumpOutcome::Failed(e) = session.pump_schedule() {
                    fail = Some(e);
                }
            }
            if fail.is_none() {
                if let PumpOutcome::Failed(e) = session.pump_local_write() {
                    fail = Some(e);
                }
            }
        }
        match fail {
            Some(e) => self.fail_session(id, e),
            None => self.resync_interests(id),
        }
    }

    /// Re-applies each socket's `read_armed`/`write_armed` flags to its mio
    /// registration after a callback ran. mio has no "registered with no
    /// interest" state, so a socket with neither flag armed is deregistered
    /// outright instead of being left on a stale interest that would keep
    /// firing readiness events nothing is draining.
    fn resync_interests(&mut self, id: SessionId) {
        let Some(session) = self.registry.get_mut(id) else { return };
        resync_one(
            &self.poll,
            &mut session.local.stream,
            session.local.token,
            session.local.read_armed,
            session.local.write_armed,
            &mut session.local.registered,
        );
        for remote in &mut session.remotes {
            resync_one(&self.poll, &mut remote.stream, remote.token, remote.read_armed, remote.write_armed, &mut remote.registered);
        }
    }

    fn fail_session(&mut self, id: SessionId, e: crate::error::SessionError) {
        let span = self.registry.get(id).map(|s| s.span.clone());
        let _enter = span.as_ref().map(tracing::Span::enter);
        if e.is_quiet() {
            debug!(error = %e, "session closed");
        } else {
            warn!(error = %e, "session torn down");
        }
        drop(_enter);
        self.teardown(id);
    }

    /// Closes all N remote sockets and the local socket, frees the pipes,
    /// and removes the session from the registry. Idempotent.
    fn teardown(&mut self, id: SessionId) {
        self.pending_dials.remove(&id);
        if let Some(mut session) = self.registry.remove(id) {
            let _ = self.poll.registry().deregister(&mut session.local.stream);
            for remote in &mut session.remotes {
                let _ = self.poll.registry().deregister(&mut remote.stream);
            }
        }
    }

    fn dump_sessions(&self) {
        for (id, session) in self.registry.iter() {
            info!(
                id,
                group_id = session.group_id,
                local_addr = %session.local.addr,
                remotes = session.remotes.len(),
                send_serial = session.send_serial,
                receive_serial = session.receive_serial,
                nr = session.pipe_out.fill_level(),
                nw = session.pipe_in.fill_level(),
                "session snapshot"
            );
            for (i, r) in session.remotes.iter().enumerate() {
                debug!(
                    id,
                    remote = i,
                    addr = %r.addr,
                    connected = r.connected,
                    stats_in = r.stats_in,
                    stats_out = r.stats_out,
                    "remote snapshot"
                );
            }
        }
    }
}

#[derive(Clone, Copy)]
struct ReadinessFlags {
    readable: bool,
    writable: bool,
}

fn interest_from(read_armed: bool, write_armed: bool) -> Option<Interest> {
    match (read_armed, write_armed) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn resync_one(
    poll: &Poll,
    stream: &mut mio::net::TcpStream,
    token: Token,
    read_armed: bool,
    write_armed: bool,
    registered: &mut bool,
) {
    match interest_from(read_armed, write_armed) {
        Some(interest) if *registered => {
            let _ = poll.registry().reregister(stream, token, interest);
        }
        Some(interest) => {
            let _ = poll.registry().register(stream, token, interest);
            *registered = true;
        }
        None if *registered => {
            let _ = poll.registry().deregister(stream);
            *registered = false;
        }
        None => {}
    }
}
