use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use mio::{
    event::Event,
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token, Waker,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, trace, warn};

use super::{
    domain::BroadcastDomain, handle::Handle, stats::SocketState, DomainId, RelayError,
    RelayOptions,
};

/// Token of the waker used to stop the driver.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// What a readiness event asks the driver to do with a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    /// The socket reported an error.
    Error,
    /// There is something to accept or read.
    Readable,
    /// The peer hung up without anything left to read.
    Closed,
    /// None of the flags the driver registered for.
    Unknown,
}

impl Readiness {
    /// An error wins over everything else, pending data wins over a hang-up.
    const fn from_flags(error: bool, readable: bool, closed: bool) -> Self {
        if error {
            Self::Error
        } else if readable {
            Self::Readable
        } else if closed {
            Self::Closed
        } else {
            Self::Unknown
        }
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self::from_flags(
            event.is_error(),
            event.is_readable() || event.is_priority(),
            event.is_read_closed() || event.is_write_closed(),
        )
    }
}

/// The relay event loop. Owns every registered socket and every broadcast domain, and
/// runs on a single thread until a fatal error or a shutdown request.
///
/// Listener `i` is registered under `Token(i)` and owns domain `i`. Clients get tokens
/// above the listener range.
///
/// Readiness is edge-triggered, so a readable handle stays scheduled until it would
/// block. Each loop iteration does one unit of work per scheduled handle (one accept or
/// one received chunk) so that a busy client cannot hold up the other handles.
#[derive(Debug)]
pub(crate) struct RelayDriver {
    /// The readiness primitive.
    poll: Poll,
    /// Registration table, keyed by readiness token.
    handles: FxHashMap<Token, Handle>,
    /// Broadcast domains, indexed by [`DomainId`].
    domains: Vec<BroadcastDomain>,
    /// Handles that may still have something to accept or read, in service order.
    pending: VecDeque<Token>,
    /// The tokens currently in `pending`.
    scheduled: FxHashSet<Token>,
    /// Next token to hand out to a client.
    next_token: usize,
    /// First token of the client range.
    first_client_token: usize,
    /// Receive buffer, one chunk long.
    buf: Box<[u8]>,
    /// The relay options, shared with the socket.
    options: Arc<RelayOptions>,
    /// The relay state, shared with the socket.
    state: Arc<SocketState>,
}

impl RelayDriver {
    /// Registers every listener and creates its domain. Returns the driver along with the
    /// waker that interrupts its readiness wait.
    pub(crate) fn new(
        listeners: Vec<TcpListener>,
        options: Arc<RelayOptions>,
        state: Arc<SocketState>,
    ) -> Result<(Self, Waker), RelayError> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let mut handles = FxHashMap::default();
        let mut domains = Vec::with_capacity(listeners.len());

        for (index, mut listener) in listeners.into_iter().enumerate() {
            let token = Token(index);
            poll.registry().register(&mut listener, token, Interest::READABLE)?;

            domains.push(BroadcastDomain::new(token));
            handles.insert(token, Handle::Listening { domain: DomainId(index), listener });
        }

        let first_client_token = domains.len();
        let buf = vec![0; options.recv_chunk_size].into_boxed_slice();

        let driver = Self {
            poll,
            handles,
            domains,
            pending: VecDeque::new(),
            scheduled: FxHashSet::default(),
            next_token: first_client_token,
            first_client_token,
            buf,
            options,
            state,
        };

        Ok((driver, waker))
    }

    /// Runs the event loop. Only returns on a fatal error, or with `Ok(())` once shutdown
    /// has been requested.
    pub(crate) fn run(&mut self) -> Result<(), RelayError> {
        let mut events = Events::with_capacity(self.options.events_capacity);

        loop {
            // Only block when no handle has work left.
            let timeout = (!self.pending.is_empty()).then_some(Duration::ZERO);

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                error!(err = ?e, "Readiness wait failed");
                return Err(RelayError::Poll(e));
            }

            for event in events.iter() {
                let token = event.token();

                if token == WAKE_TOKEN {
                    if self.state.shutdown.load(Ordering::Acquire) {
                        debug!("Shutdown requested, stopping relay driver");
                        return Ok(());
                    }
                    continue;
                }

                self.on_event(token, Readiness::from(event));
            }

            self.serve_pending()?;
        }
    }

    /// Dispatches one readiness event. Readable handles are scheduled, the others closed.
    fn on_event(&mut self, token: Token, readiness: Readiness) {
        let Some(handle) = self.handles.get(&token) else {
            // Closed earlier in the same batch.
            trace!(?token, "Event for closed handle");
            return;
        };

        match readiness {
            Readiness::Readable => self.schedule(token),
            Readiness::Error | Readiness::Closed => {
                debug!(?handle, ?readiness, "Closing handle");
                self.close(token);
            }
            Readiness::Unknown => {
                warn!(?handle, "Unknown readiness flags, closing handle");
                self.close(token);
            }
        }
    }

    fn schedule(&mut self, token: Token) {
        if self.scheduled.insert(token) {
            self.pending.push_back(token);
        }
    }

    /// Gives every scheduled handle one turn, in order. Handles that may have more work
    /// are scheduled again, behind the others. Only returns an error if it is fatal.
    fn serve_pending(&mut self) -> Result<(), RelayError> {
        for _ in 0..self.pending.len() {
            let Some(token) = self.pending.pop_front() else { break };
            self.scheduled.remove(&token);

            let more = match self.handles.get(&token) {
                Some(Handle::Listening { domain, .. }) => {
                    let domain = *domain;
                    self.on_accept(token, domain)?
                }
                Some(Handle::Data { .. }) => self.on_readable(token),
                None => false,
            };

            if more {
                self.schedule(token);
            }
        }

        Ok(())
    }

    /// Accepts one pending connection on a listener. Returns whether there may be more.
    ///
    /// A failed accept is fatal: once the process runs out of descriptors there is no
    /// way to tell which backlog entries are still valid.
    fn on_accept(&mut self, listener_token: Token, domain: DomainId) -> Result<bool, RelayError> {
        let Some(Handle::Listening { listener, .. }) = self.handles.get(&listener_token) else {
            return Ok(false);
        };

        let (stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(true),
            Err(e) => {
                error!(err = ?e, "Failed to accept connection");
                return Err(RelayError::Accept(e));
            }
        };

        self.on_connection(listener_token, domain, stream, peer);

        Ok(true)
    }

    /// Registers a freshly accepted client and adds it to the listener's domain. On any
    /// failure the client is dropped, which closes it.
    fn on_connection(
        &mut self,
        listener: Token,
        domain: DomainId,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) {
        if let Err(e) = self.configure(&stream) {
            error!(%peer, err = ?e, "Failed to configure client socket");
            return;
        }

        let token = self.next_token();

        let slot = match self.domains[domain.0].add(token) {
            Ok(slot) => slot,
            Err(e) => {
                error!(%peer, err = ?e, "Failed to add client to broadcast domain");
                return;
            }
        };

        if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
            error!(%peer, err = ?e, "Failed to register client");
            self.domains[domain.0].remove(token);
            return;
        }

        self.handles.insert(token, Handle::Data { domain, listener, stream, peer });

        self.state.stats.increment_active_clients();
        self.state.stats.set_members(domain.0, self.domains[domain.0].len());

        debug!(%peer, ?token, slot, "New client");
    }

    #[cfg(target_os = "linux")]
    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        if let Some(timeout) = self.options.tcp_user_timeout {
            socket2::SockRef::from(stream).set_tcp_user_timeout(Some(timeout))?;
        }

        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn configure(&self, _stream: &TcpStream) -> io::Result<()> {
        Ok(())
    }

    /// Reads one chunk from a client and fans it out. Returns whether there may be more
    /// to read. EOF or a read error closes the client.
    fn on_readable(&mut self, token: Token) -> bool {
        let Some(Handle::Data { domain, stream, .. }) = self.handles.get(&token) else {
            return false;
        };
        let domain = *domain;

        let mut reader: &TcpStream = stream;
        match reader.read(&mut self.buf) {
            Ok(0) => {
                trace!(?token, "Client sent EOF");
                self.close(token);
                false
            }
            Ok(n) => {
                trace!(?token, n, "Received chunk");
                self.state.stats.increment_rx(n);
                self.fan_out(token, domain, n);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => true,
            Err(e) => {
                debug!(?token, err = ?e, "Failed to read from client");
                self.close(token);
                false
            }
        }
    }

    /// Sends the first `len` bytes of the receive buffer to every other member of the
    /// sender's domain, closing the peers that fail.
    fn fan_out(&mut self, sender: Token, domain: DomainId, len: usize) {
        let handles = &self.handles;
        let report = self.domains[domain.0].broadcast(sender, &self.buf[..len], |peer, bytes| {
            match handles.get(&peer) {
                Some(Handle::Data { stream, .. }) => {
                    let mut writer: &TcpStream = stream;
                    writer.write(bytes)
                }
                _ => Err(io::ErrorKind::NotConnected.into()),
            }
        });

        let stats = &self.state.stats;
        stats.increment_tx(report.bytes_tx);
        if report.dropped > 0 {
            stats.increment_dropped_sends(report.dropped);
        }

        if !report.evicted.is_empty() {
            stats.increment_evicted_peers(report.evicted.len());
            for peer in report.evicted {
                self.close(peer);
            }
        }
    }

    /// Closes a handle: deregisters it, drops its socket and removes it from its domain.
    /// Closing a listener closes every member of its domain as well.
    fn close(&mut self, token: Token) {
        let Some(mut handle) = self.handles.remove(&token) else {
            return;
        };

        if let Err(e) = handle.deregister(self.poll.registry()) {
            trace!(?token, err = ?e, "Failed to deregister handle");
        }

        let domain = handle.domain();

        match handle {
            Handle::Data { peer, .. } => {
                self.domains[domain.0].remove(token);
                self.state.stats.decrement_active_clients();
                debug!(%peer, ?token, "Closed client");
            }
            Handle::Listening { .. } => {
                warn!(?token, "Closing listener and all of its clients");
                for member in self.domains[domain.0].clear() {
                    self.close(member);
                }
            }
        }

        self.state.stats.set_members(domain.0, self.domains[domain.0].len());
    }

    /// Hands out the next free client token, skipping tokens still in use after a wrap.
    fn next_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = match self.next_token.checked_add(1) {
                Some(next) if next != WAKE_TOKEN.0 => next,
                _ => self.first_client_token,
            };

            if !self.handles.contains_key(&token) {
                return token;
            }
        }
    }
}
