use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
    sync::{atomic::Ordering, Arc},
    thread::{self, JoinHandle},
};

use mio::Waker;
use tracing::debug;

use super::{
    driver::RelayDriver, listener::ListenerSet, stats::SocketState, RelayError, RelayOptions,
    RelayStats,
};

/// A relay socket. Listens on a set of ports and re-transmits whatever a client sends to
/// every other client connected to the same port.
///
/// ## Broadcast domains
/// Every port has its own broadcast domain: the clients accepted on that port. Bytes are
/// relayed verbatim, without framing, in the order they were received from each sender.
/// A peer that cannot take the data right away misses it; a peer that fails is closed.
///
/// The socket is bound on construction. The relay itself runs on a single thread, either
/// the caller's ([`RelaySocket::run`]) or a dedicated one ([`RelaySocket::spawn`]).
pub struct RelaySocket {
    /// The relay state, shared with the driver.
    state: Arc<SocketState>,
    /// The driver. Moved out once the relay runs.
    driver: Option<RelayDriver>,
    /// Wakes the driver to shut it down.
    waker: Arc<Waker>,
    /// The local addresses of the listeners, indexed like the broadcast domains.
    local_addrs: Vec<SocketAddr>,
}

impl RelaySocket {
    /// Binds one listener per port on `addr` with the default [`RelayOptions`].
    pub fn bind(addr: IpAddr, ports: impl IntoIterator<Item = u16>) -> Result<Self, RelayError> {
        Self::bind_with_options(addr, ports, RelayOptions::default())
    }

    /// Binds one listener per port on `addr` with the given options. Fails if any port
    /// cannot be bound.
    pub fn bind_with_options(
        addr: IpAddr,
        ports: impl IntoIterator<Item = u16>,
        options: RelayOptions,
    ) -> Result<Self, RelayError> {
        let options = Arc::new(options);
        let listeners = ListenerSet::bind(addr, ports, options.listen_backlog)?;
        let local_addrs = listeners.local_addrs().to_vec();

        let state = Arc::new(SocketState::new(listeners.len()));
        let (driver, waker) =
            RelayDriver::new(listeners.into_listeners(), options, Arc::clone(&state))?;

        debug!(listeners = local_addrs.len(), "Relay socket bound");

        Ok(Self { state, driver: Some(driver), waker: Arc::new(waker), local_addrs })
    }

    /// Runs the relay on the current thread. Blocks until a fatal error occurs or
    /// [`ShutdownHandle::shutdown`] is called.
    pub fn run(&mut self) -> Result<(), RelayError> {
        let mut driver = self.driver.take().ok_or(RelayError::AlreadyRunning)?;
        driver.run()
    }

    /// Runs the relay on a dedicated thread.
    pub fn spawn(&mut self) -> Result<JoinHandle<Result<(), RelayError>>, RelayError> {
        let mut driver = self.driver.take().ok_or(RelayError::AlreadyRunning)?;
        let handle =
            thread::Builder::new().name("relay-driver".into()).spawn(move || driver.run())?;

        Ok(handle)
    }

    /// Returns a handle that stops the relay from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { waker: Arc::clone(&self.waker), state: Arc::clone(&self.state) }
    }

    /// The relay statistics, updated while the relay runs.
    pub fn stats(&self) -> &RelayStats {
        &self.state.stats
    }

    /// Number of clients currently connected on `port`. `None` if the socket doesn't
    /// listen on it.
    pub fn members(&self, port: u16) -> Option<usize> {
        let index = self.local_addrs.iter().position(|addr| addr.port() == port)?;
        self.state.stats.members(index)
    }

    /// The local addresses of the listeners, in the order the ports were given.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }
}

impl fmt::Debug for RelaySocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySocket")
            .field("local_addrs", &self.local_addrs)
            .field("started", &self.driver.is_none())
            .field("stats", &self.state.stats)
            .finish()
    }
}

/// Stops a running relay. Can be cloned and sent across threads.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    state: Arc<SocketState>,
}

impl ShutdownHandle {
    /// Asks the driver to return from its loop.
    pub fn shutdown(&self) -> io::Result<()> {
        self.state.shutdown.store(true, Ordering::Release);
        self.waker.wake()
    }
}
