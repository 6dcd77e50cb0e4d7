//! A single-threaded TCP broadcast relay. Every listening port is its own broadcast
//! domain: whatever one client sends is re-sent to every other client of that port.

mod relay;

pub use mio::Token;
pub use relay::{
    BroadcastDomain, BroadcastReport, RelayError, RelayOptions, RelaySocket, RelayStats,
    ShutdownHandle,
};
