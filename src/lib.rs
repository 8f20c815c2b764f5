//! Root crate for the data-node and scheduler binaries: configuration
//! loading and logging bootstrap shared between the two. The chunk
//! lifecycle itself lives in `cnode-io`/`cnode-store`; the fair-share
//! tree and per-heartbeat scheduler live in `scheduler-tree`/
//! `scheduler-core`. This crate only wires those together into runnable
//! processes.

pub mod config;
pub mod logging;
