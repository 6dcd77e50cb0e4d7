use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use super::RelayError;

/// One bound, non-blocking listener per configured port.
#[derive(Debug)]
pub(crate) struct ListenerSet {
    listeners: Vec<TcpListener>,
    local_addrs: Vec<SocketAddr>,
}

impl ListenerSet {
    /// Opens a listener on `addr` for every port. Fails on the first port that cannot be
    /// bound, closing the listeners opened so far.
    pub(crate) fn bind(
        addr: IpAddr,
        ports: impl IntoIterator<Item = u16>,
        backlog: i32,
    ) -> Result<Self, RelayError> {
        let mut listeners = Vec::new();
        let mut local_addrs = Vec::new();

        for port in ports {
            let listener = listen(SocketAddr::new(addr, port), backlog)
                .map_err(|source| RelayError::Bind { port, source })?;
            let local_addr = listener.local_addr()?;

            debug!(%local_addr, "Listening");

            listeners.push(listener);
            local_addrs.push(local_addr);
        }

        if listeners.is_empty() {
            return Err(RelayError::NoListeners);
        }

        Ok(Self { listeners, local_addrs })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub(crate) fn into_listeners(self) -> Vec<TcpListener> {
        self.listeners
    }
}

fn listen(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into()))
}
