//! The `tcp-repeater` binary.

use std::{
    net::{IpAddr, Ipv4Addr},
    process::ExitCode,
    time::Duration,
};

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use repeater::{
    bootstrap::{bootstrap, Account, Config},
    constants::{MIN_CLIENTS, UNPRIVILEGED_GROUP, UNPRIVILEGED_USER},
    PortRange, RelayOptions,
};

/// Listens on the given ports, accepting any number of clients on each, and re-transmits
/// whatever a client sends to every other client connected to the same port.
#[derive(Debug, Parser)]
#[command(name = "tcp-repeater", version)]
struct Args {
    /// Ports or inclusive port ranges to listen on, e.g. `9000` or `9001-9002`.
    #[arg(required = true, value_name = "FROMPORT[-TOPORT]")]
    ports: Vec<PortRange>,

    /// Address to bind the listeners to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// User to switch to once the listeners are bound.
    #[arg(long, default_value = UNPRIVILEGED_USER)]
    user: String,

    /// Group to switch to once the listeners are bound.
    #[arg(long, default_value = UNPRIVILEGED_GROUP)]
    group: String,

    /// Number of clients the open file limit is sized for, on top of the listeners.
    #[arg(long, default_value_t = MIN_CLIENTS)]
    min_clients: u64,

    /// TCP_USER_TIMEOUT for accepted clients, in milliseconds (Linux only).
    #[arg(long, value_name = "MS")]
    user_timeout_ms: Option<u64>,

    /// Keep running under the current user instead of switching.
    #[arg(long)]
    keep_privileges: bool,
}

impl Args {
    fn into_config(self) -> Config {
        let mut options = RelayOptions::default();
        if let Some(ms) = self.user_timeout_ms {
            options = options.tcp_user_timeout(Duration::from_millis(ms));
        }

        let account =
            (!self.keep_privileges).then(|| Account { user: self.user, group: self.group });

        Config {
            bind: self.bind,
            ports: self.ports,
            min_clients: self.min_clients,
            account,
            options,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut socket = match bootstrap(&args.into_config()) {
        Ok(socket) => socket,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match socket.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
