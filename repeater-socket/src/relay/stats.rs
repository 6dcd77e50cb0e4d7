use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Statistics for a relay socket. These are shared between the driver and the socket.
#[derive(Debug)]
pub struct RelayStats {
    /// Total bytes received from clients
    bytes_rx: AtomicUsize,
    /// Total bytes fanned out to clients
    bytes_tx: AtomicUsize,
    /// Total number of connected clients, across all domains
    active_clients: AtomicUsize,
    /// Total number of payloads dropped because a peer was not writable
    dropped_sends: AtomicUsize,
    /// Total number of peers closed because sending to them failed
    evicted_peers: AtomicUsize,
    /// Members per broadcast domain, indexed like the listeners
    members: Box<[AtomicUsize]>,
}

impl RelayStats {
    pub(crate) fn new(domains: usize) -> Self {
        Self {
            bytes_rx: AtomicUsize::new(0),
            bytes_tx: AtomicUsize::new(0),
            active_clients: AtomicUsize::new(0),
            dropped_sends: AtomicUsize::new(0),
            evicted_peers: AtomicUsize::new(0),
            members: (0..domains).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[inline]
    pub(crate) fn increment_rx(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_tx(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_active_clients(&self) {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn decrement_active_clients(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dropped_sends(&self, count: usize) {
        self.dropped_sends.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_evicted_peers(&self, count: usize) {
        self.evicted_peers.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_members(&self, domain: usize, members: usize) {
        self.members[domain].store(members, Ordering::Relaxed);
    }

    /// Total bytes received from clients.
    #[inline]
    pub fn bytes_rx(&self) -> usize {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    /// Total bytes fanned out to clients.
    #[inline]
    pub fn bytes_tx(&self) -> usize {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    /// Number of connected clients, across all domains.
    #[inline]
    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::Relaxed)
    }

    /// Number of payloads dropped because a peer was not writable.
    #[inline]
    pub fn dropped_sends(&self) -> usize {
        self.dropped_sends.load(Ordering::Relaxed)
    }

    /// Number of peers closed because sending to them failed.
    #[inline]
    pub fn evicted_peers(&self) -> usize {
        self.evicted_peers.load(Ordering::Relaxed)
    }

    /// Number of members of the domain at `index`.
    #[inline]
    pub fn members(&self, index: usize) -> Option<usize> {
        self.members.get(index).map(|members| members.load(Ordering::Relaxed))
    }
}

/// The relay state, shared between the driver and the socket.
#[derive(Debug)]
pub(crate) struct SocketState {
    pub(crate) stats: RelayStats,
    /// Set before waking the driver to make it return.
    pub(crate) shutdown: AtomicBool,
}

impl SocketState {
    pub(crate) fn new(domains: usize) -> Self {
        Self { stats: RelayStats::new(domains), shutdown: AtomicBool::new(false) }
    }
}
