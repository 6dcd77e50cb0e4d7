//! Process setup around the relay: descriptor limits, listener binding and dropping
//! privileges, in that order.

use std::net::{IpAddr, Ipv4Addr};

use nix::{
    errno::Errno,
    sys::resource::{getrlimit, rlim_t, setrlimit, Resource},
    unistd::{setgid, setuid, Group, User},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use repeater_common::{
    constants::{MIN_CLIENTS, UNPRIVILEGED_GROUP, UNPRIVILEGED_USER},
    count_ports, PortRange,
};
use repeater_socket::{RelayError, RelayOptions, RelaySocket};

/// Errors that abort process setup.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The open file limit could not be read.
    #[error("getrlimit(RLIMIT_NOFILE) failed: {0}")]
    GetRlimit(nix::Error),
    /// The open file limit could not be raised.
    #[error("setrlimit(RLIMIT_NOFILE) to {limit} failed: {source}")]
    SetRlimit {
        /// The limit asked for.
        limit: rlim_t,
        /// The underlying error.
        source: nix::Error,
    },
    /// Clearing the supplementary groups failed for another reason than permissions.
    #[error("setgroups failed: {0}")]
    SetGroups(nix::Error),
    /// Switching group failed for another reason than permissions.
    #[error("setgid failed: {0}")]
    SetGid(nix::Error),
    /// Switching user failed for another reason than permissions.
    #[error("setuid failed: {0}")]
    SetUid(nix::Error),
    /// Binding the listeners failed.
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Everything needed to bring up a relay process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listeners bind to.
    pub bind: IpAddr,
    /// Ports to listen on.
    pub ports: Vec<PortRange>,
    /// Client headroom added to the port count for the descriptor limit.
    pub min_clients: u64,
    /// Account to switch to once the listeners are bound. `None` keeps the current one.
    pub account: Option<Account>,
    /// Options of the relay socket.
    pub options: RelayOptions,
}

impl Config {
    /// A config for `ports`, bound on all interfaces, with the default client headroom
    /// and account.
    pub fn new(ports: Vec<PortRange>) -> Self {
        Self {
            bind: Ipv4Addr::UNSPECIFIED.into(),
            ports,
            min_clients: MIN_CLIENTS,
            account: Some(Account::default()),
            options: RelayOptions::default(),
        }
    }
}

/// An unprivileged user and group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// User name.
    pub user: String,
    /// Group name.
    pub group: String,
}

impl Default for Account {
    fn default() -> Self {
        Self { user: UNPRIVILEGED_USER.to_string(), group: UNPRIVILEGED_GROUP.to_string() }
    }
}

/// Outcome of [`drop_privileges`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeDrop {
    /// The process now runs as the account.
    Dropped,
    /// The process lacks the permission to switch, it keeps its identity.
    NotPermitted,
    /// The user or group doesn't exist, the process keeps its identity.
    AccountMissing,
}

/// Raises the descriptor limit, binds every listener and drops privileges. The returned
/// socket is ready to [`run`](RelaySocket::run).
pub fn bootstrap(config: &Config) -> Result<RelaySocket, BootstrapError> {
    let ports = count_ports(&config.ports);
    let limit = raise_nofile_limit(ports as rlim_t + config.min_clients as rlim_t)?;
    debug!(ports, limit, "Raised open file limit");

    let socket = RelaySocket::bind_with_options(
        config.bind,
        config.ports.iter().flat_map(PortRange::ports),
        config.options.clone(),
    )?;

    if let Some(ref account) = config.account {
        drop_privileges(account)?;
    }

    info!(bind = %config.bind, listeners = socket.local_addrs().len(), "Relay listening");

    Ok(socket)
}

/// Raises the soft `RLIMIT_NOFILE` to at least `to`, raising the hard limit along with it
/// if needed. Returns the resulting soft limit.
pub fn raise_nofile_limit(to: rlim_t) -> Result<rlim_t, BootstrapError> {
    let current = getrlimit(Resource::RLIMIT_NOFILE).map_err(BootstrapError::GetRlimit)?;

    match nofile_target(current, to) {
        Some((soft, hard)) => {
            setrlimit(Resource::RLIMIT_NOFILE, soft, hard)
                .map_err(|source| BootstrapError::SetRlimit { limit: to, source })?;
            Ok(soft)
        }
        None => Ok(current.0),
    }
}

/// New `(soft, hard)` limits needed to reach `to`, or `None` if the soft limit suffices.
fn nofile_target((soft, hard): (rlim_t, rlim_t), to: rlim_t) -> Option<(rlim_t, rlim_t)> {
    (soft < to).then(|| (to, hard.max(to)))
}

/// Switches the process to the given account. A missing account only logs a warning, and
/// lacking the permission to switch (`EPERM`, the process isn't privileged) is tolerated.
pub fn drop_privileges(account: &Account) -> Result<PrivilegeDrop, BootstrapError> {
    let user = User::from_name(&account.user).ok().flatten();
    let group = Group::from_name(&account.group).ok().flatten();

    let (Some(user), Some(group)) = (user, group) else {
        warn!(
            user = %account.user,
            group = %account.group,
            "User or group not found, keeping privileges"
        );
        return Ok(PrivilegeDrop::AccountMissing);
    };

    #[cfg(target_os = "linux")]
    let groups_set = permitted(nix::unistd::setgroups(&[group.gid]))
        .map_err(BootstrapError::SetGroups)?;
    #[cfg(not(target_os = "linux"))]
    let groups_set = true;

    let gid_set = permitted(setgid(group.gid)).map_err(BootstrapError::SetGid)?;
    let uid_set = permitted(setuid(user.uid)).map_err(BootstrapError::SetUid)?;

    if groups_set && gid_set && uid_set {
        info!(user = %account.user, group = %account.group, "Dropped privileges");
        Ok(PrivilegeDrop::Dropped)
    } else {
        debug!(user = %account.user, "Not permitted to switch account, keeping privileges");
        Ok(PrivilegeDrop::NotPermitted)
    }
}

/// `Ok(false)` on `EPERM`.
fn permitted(res: nix::Result<()>) -> nix::Result<bool> {
    match res {
        Ok(()) => Ok(true),
        Err(Errno::EPERM) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nofile_target_raises_soft_and_hard() {
        assert_eq!(nofile_target((1024, 4096), 2003), Some((2003, 4096)));
        assert_eq!(nofile_target((1024, 1024), 2003), Some((2003, 2003)));
        assert_eq!(nofile_target((4096, 4096), 2003), None);
        assert_eq!(nofile_target((2003, 2003), 2003), None);
    }

    #[test]
    fn raise_nofile_limit_noop_below_current() {
        let (soft, _) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        assert_eq!(raise_nofile_limit(1).unwrap(), soft);
        assert_eq!(getrlimit(Resource::RLIMIT_NOFILE).unwrap().0, soft);
    }

    #[test]
    fn missing_account_is_not_fatal() {
        let account = Account {
            user: "no-such-user-for-relay".to_string(),
            group: "no-such-group-for-relay".to_string(),
        };
        assert_eq!(drop_privileges(&account).unwrap(), PrivilegeDrop::AccountMissing);
    }

    #[test]
    fn bootstrap_binds_all_ports() {
        let mut config = Config::new(vec![PortRange::single(0), PortRange::single(0)]);
        config.bind = Ipv4Addr::LOCALHOST.into();
        config.min_clients = 0;
        config.account = None;

        let socket = bootstrap(&config).unwrap();
        assert_eq!(socket.local_addrs().len(), 2);
    }

    #[test]
    fn bootstrap_fails_on_taken_port() {
        let taken = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut config = Config::new(vec![PortRange::single(port)]);
        config.bind = Ipv4Addr::LOCALHOST.into();
        config.min_clients = 0;
        config.account = None;

        assert!(matches!(
            bootstrap(&config),
            Err(BootstrapError::Relay(RelayError::Bind { port: p, .. })) if p == port
        ));
    }
}
