//! Multi-port TCP broadcast relay: the relay sockets together with the process setup
//! of the `tcp-repeater` binary.

pub mod bootstrap;

pub use repeater_common::{constants, count_ports, PortRange, PortRangeError};
pub use repeater_socket::*;
