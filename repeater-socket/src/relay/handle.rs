use std::{io, net::SocketAddr};

use mio::{
    net::{TcpListener, TcpStream},
    Registry, Token,
};

use super::DomainId;

/// A socket registered with the driver.
pub(crate) enum Handle {
    /// A listener. New clients accepted on it join `domain`.
    Listening { domain: DomainId, listener: TcpListener },
    /// A client connection, member of `domain`, accepted on `listener`.
    Data { domain: DomainId, listener: Token, stream: TcpStream, peer: SocketAddr },
}

impl Handle {
    #[inline]
    pub(crate) fn domain(&self) -> DomainId {
        match self {
            Self::Listening { domain, .. } | Self::Data { domain, .. } => *domain,
        }
    }

    /// Removes the socket from the readiness set. The socket itself is closed on drop.
    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Listening { listener, .. } => registry.deregister(listener),
            Self::Data { stream, .. } => registry.deregister(stream),
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listening { domain, listener } => f
                .debug_struct("Listening")
                .field("domain", domain)
                .field("addr", &listener.local_addr().ok())
                .finish(),
            Self::Data { domain, listener, peer, .. } => f
                .debug_struct("Data")
                .field("domain", domain)
                .field("listener", listener)
                .field("peer", peer)
                .finish(),
        }
    }
}
