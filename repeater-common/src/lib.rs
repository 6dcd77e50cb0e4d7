//! Types and constants shared by the repeater crates.

mod range;
pub use range::{count_ports, PortRange, PortRangeError, Ports};

/// Sizes and defaults of the relay.
#[allow(non_upper_case_globals)]
pub mod constants {
    /// One kibibyte.
    pub const KiB: u32 = 1024;
    /// One mebibyte.
    pub const MiB: u32 = 1024 * KiB;

    /// Size of the chunk read from a client before it is fanned out.
    pub const RECV_CHUNK_SIZE: usize = KiB as usize;

    /// Minimum number of clients guaranteed to be connected at any given time.
    /// Only used to size the open file descriptor limit.
    pub const MIN_CLIENTS: u64 = 2000;

    /// Listen backlog of every listener socket.
    pub const LISTEN_BACKLOG: i32 = 8;

    /// Maximum number of readiness events handled per loop iteration.
    pub const EVENTS_CAPACITY: usize = 64;

    /// User the process switches to after all listeners are bound.
    pub const UNPRIVILEGED_USER: &str = "nobody";
    /// Group the process switches to after all listeners are bound.
    pub const UNPRIVILEGED_GROUP: &str = "nobody";
}
