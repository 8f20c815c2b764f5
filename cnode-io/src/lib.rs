//! Location directories, disk-space accounting, pending-IO bookkeeping,
//! throttling and the per-location write invoker (§4.1).

pub mod config;
pub mod invoker;
pub mod location;
pub mod pending_io;
pub mod throttler;

pub use config::{LocationConfig, LocationType};
pub use invoker::Invoker;
pub use location::{ChunkDescriptor, Location};
pub use pending_io::{Direction, PendingIoGuard, Workload};
pub use throttler::Throttler;
