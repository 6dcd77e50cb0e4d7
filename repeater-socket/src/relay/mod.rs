use std::{collections::TryReserveError, io, time::Duration};

use thiserror::Error;

use repeater_common::constants::{EVENTS_CAPACITY, LISTEN_BACKLOG, RECV_CHUNK_SIZE};

mod domain;
pub use domain::{BroadcastDomain, BroadcastReport};

mod driver;

mod handle;

mod listener;

mod socket;
pub use socket::{RelaySocket, ShutdownHandle};

mod stats;
pub use stats::RelayStats;

/// Errors of a [`RelaySocket`].
#[derive(Debug, Error)]
pub enum RelayError {
    /// Setting up the readiness primitive or a thread failed.
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    /// A listener could not be opened.
    #[error("Failed to open listener on port {port}: {source}")]
    Bind {
        /// The port that failed.
        port: u16,
        /// The underlying error.
        source: io::Error,
    },
    /// Accepting a client failed. Fatal for the relay.
    #[error("Failed to accept connection: {0}")]
    Accept(io::Error),
    /// The readiness wait failed. Fatal for the relay.
    #[error("Readiness wait failed: {0}")]
    Poll(io::Error),
    /// A broadcast domain could not grow.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(#[from] TryReserveError),
    /// The socket was given no port to listen on.
    #[error("No ports to listen on")]
    NoListeners,
    /// The relay was already started.
    #[error("Relay driver is already running")]
    AlreadyRunning,
}

/// Index of a broadcast domain. Equal to the index of its listener in the listener set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct DomainId(pub(crate) usize);

/// Tuning options of a [`RelaySocket`].
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// The size of the chunk read from a client before it is fanned out.
    recv_chunk_size: usize,
    /// The maximum number of readiness events handled per loop iteration.
    events_capacity: usize,
    /// The listen backlog of every listener socket.
    listen_backlog: i32,
    /// `TCP_USER_TIMEOUT` applied to accepted clients. Only honored on Linux.
    tcp_user_timeout: Option<Duration>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            recv_chunk_size: RECV_CHUNK_SIZE,
            events_capacity: EVENTS_CAPACITY,
            listen_backlog: LISTEN_BACKLOG,
            tcp_user_timeout: None,
        }
    }
}

impl RelayOptions {
    /// Sets the size of the chunk read from a client per receive call. Every chunk is
    /// fanned out on its own, there is no framing across chunks.
    pub fn recv_chunk_size(mut self, recv_chunk_size: usize) -> Self {
        self.recv_chunk_size = recv_chunk_size.max(1);
        self
    }

    /// Sets the maximum number of readiness events handled per loop iteration.
    pub fn events_capacity(mut self, events_capacity: usize) -> Self {
        self.events_capacity = events_capacity.max(1);
        self
    }

    /// Sets the listen backlog of the listener sockets.
    pub fn listen_backlog(mut self, listen_backlog: i32) -> Self {
        self.listen_backlog = listen_backlog;
        self
    }

    /// Sets `TCP_USER_TIMEOUT` on every accepted client, so that a peer that stops
    /// acknowledging data is dropped by the kernel.
    pub fn tcp_user_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_user_timeout = Some(timeout);
        self
    }
}
