//! Exports configuration paths the rest of the workspace builds file names
//! from. Modeled on `pbs-buildcfg`: a handful of `macro_rules!` constants
//! so other crates can `concat!` paths at compile time instead of
//! formatting them at runtime.

pub const CLUSTER_NODE_PKG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR"),
);
pub const CLUSTER_NODE_PKG_RELEASE: &str = env!("CARGO_PKG_VERSION_PATCH");

/// The configured configuration directory.
pub const CONFIGDIR: &str = "/etc/cluster-node";

#[macro_export]
macro_rules! CLUSTER_NODE_RUN_DIR_M {
    () => {
        "/run/cluster-node"
    };
}

#[macro_export]
macro_rules! CLUSTER_NODE_STATE_DIR_M {
    () => {
        "/var/lib/cluster-node"
    };
}

#[macro_export]
macro_rules! CLUSTER_NODE_LOG_DIR_M {
    () => {
        "/var/log/cluster-node"
    };
}

/// namespaced directory for in-memory (tmpfs) run state
pub const CLUSTER_NODE_RUN_DIR: &str = CLUSTER_NODE_RUN_DIR_M!();

/// namespaced directory for persistent state
pub const CLUSTER_NODE_STATE_DIR: &str = CLUSTER_NODE_STATE_DIR_M!();

/// namespaced directory for persistent logging
pub const CLUSTER_NODE_LOG_DIR: &str = CLUSTER_NODE_LOG_DIR_M!();

/// filename of the persisted scheduler state document (§6)
pub const SCHEDULER_STATE_FN: &str = concat!(CLUSTER_NODE_STATE_DIR_M!(), "/scheduler-state.json");

/// Prepend the configuration directory to a file name.
///
/// #### Example:
/// ```
/// let cfg = cnode_buildcfg::configdir!("/node.conf");
/// assert_eq!(cfg, "/etc/cluster-node/node.conf");
/// ```
#[macro_export]
macro_rules! configdir {
    ($subdir:expr) => {
        concat!("/etc/cluster-node", $subdir)
    };
}
