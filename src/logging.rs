//! Logger bootstrap, shared by both binaries.
//!
//! Modeled on `proxmox-restore-daemon`'s `env_logger::from_env(...)`
//! setup: no syslog integration (this workspace targets a container/VM
//! context rather than a bare-metal daemon), `RUST_LOG` still overrides
//! the default filter for local debugging.

pub fn init(default_filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}
