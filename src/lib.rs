//! A FUSE passthrough filesystem that makes fast disks act like slow ones.
//!
//! Every operation is proxied to a backing directory on the real filesystem,
//! then held up for as long as the configured device (say, a 7,200-rpm
//! rotational disk) would have taken: seek penalties for non-sequential
//! access, limited read/write throughput, write-back caching, and fsync
//! stalls. Workloads run against the mount point unmodified; data
//! correctness comes from the host filesystem, timing comes from here.

mod cache;

mod config;
pub use config::{
    parse_configs, ConfigError, DeviceConfig, FsyncStrategy, ParseStrategyError, WriteStrategy,
};

mod device;

pub mod fs;

mod queue;

mod request;
pub use request::{Request, RequestType};

mod scheduler;
pub use scheduler::Scheduler;

pub mod units;

const TRACING_TARGET: &str = "molasses";
