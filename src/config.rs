//! Device profiles.
//!
//! A [`DeviceConfig`] is an immutable description of the physical medium
//! being simulated: how expensive seeks are, how fast bytes move, and which
//! strategies model writes and fsync. Profiles are either built in (see
//! [`DeviceConfig::hdd7200rpm`]) or loaded from a JSON file containing an
//! array of profiles whose values are all strings, e.g.
//!
//! ```json
//! [{
//!     "name": "floppy",
//!     "seek_window": "512B",
//!     "seek_time": "80ms",
//!     "read_bytes_per_second": "125KB",
//!     "write_bytes_per_second": "125KB",
//!     "allocate_bytes_per_second": "125KB",
//!     "request_reorder_max_delay": "100us",
//!     "fsync_strategy": "none",
//!     "write_strategy": "simulate",
//!     "metadata_op_time": "80ms"
//! }]
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::units::{
    self, format_bytes, format_duration, ParseBytesError, ParseDurationError,
};
use crate::TRACING_TARGET;

/// How fsync is modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncStrategy {
    /// Fsync takes zero time.
    None,

    /// Fsync takes ten seek times, regardless of what was written.
    Dumb,

    /// Writes land in a simulated write-back cache and drain to disk during
    /// spare device time. Fsync on a file pays for whatever that file still
    /// has pending.
    WriteBackCached,
}

/// How writes are modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Writes take zero time, as if absorbed by a memory cache. Pairs with
    /// [`FsyncStrategy::WriteBackCached`].
    Fast,

    /// Writes behave like reads: a seek when non-sequential, then bytes move
    /// at the configured write throughput.
    Simulate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseStrategyError {
    #[error("unknown fsync strategy {0:?}")]
    UnknownFsyncStrategy(String),

    #[error("unknown write strategy {0:?}")]
    UnknownWriteStrategy(String),
}

impl FromStr for FsyncStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nofsync" | "none" | "no" => Ok(FsyncStrategy::None),
            "dumbfsync" | "dumb" => Ok(FsyncStrategy::Dumb),
            "writebackcachedfsync" | "writebackcache" | "wbc" => {
                Ok(FsyncStrategy::WriteBackCached)
            }
            _ => Err(ParseStrategyError::UnknownFsyncStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for FsyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsyncStrategy::None => write!(f, "NoFsync"),
            FsyncStrategy::Dumb => write!(f, "DumbFsync"),
            FsyncStrategy::WriteBackCached => write!(f, "WriteBackCachedFsync"),
        }
    }
}

impl FromStr for WriteStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fastwrite" | "fast" => Ok(WriteStrategy::Fast),
            "simulatewrite" | "simulate" => Ok(WriteStrategy::Simulate),
            _ => Err(ParseStrategyError::UnknownWriteStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteStrategy::Fast => write!(f, "FastWrite"),
            WriteStrategy::Simulate => write!(f, "SimulateWrite"),
        }
    }
}

/// Describes how a physical medium acts (e.g. a rotational hard drive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Profile name, used to select a profile on the command line.
    pub name: String,

    /// How many bytes ahead in a file an access may land and still count as
    /// sequential. Anything further (or backwards, or on another file) is a
    /// seek.
    pub seek_window: u64,

    /// Cost of one seek.
    pub seek_time: Duration,

    /// Read throughput in bytes per second.
    pub read_bytes_per_second: u64,

    /// Write throughput in bytes per second.
    pub write_bytes_per_second: u64,

    /// Allocation (fallocate) throughput in bytes per second.
    pub allocate_bytes_per_second: u64,

    /// How much later (by timestamp) a request may arrive and still be
    /// reordered in front of an earlier one.
    pub request_reorder_max_delay: Duration,

    /// How fsync is modelled.
    pub fsync_strategy: FsyncStrategy,

    /// How writes are modelled.
    pub write_strategy: WriteStrategy,

    /// Flat cost of metadata operations (chmod, rename, unlink, ...).
    pub metadata_op_time: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("expected an array of device configs: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{field}: {source}")]
    Bytes {
        field: &'static str,
        source: ParseBytesError,
    },

    #[error("{field}: {source}")]
    Duration {
        field: &'static str,
        source: ParseDurationError,
    },

    #[error("{field}: {source}")]
    Strategy {
        field: &'static str,
        source: ParseStrategyError,
    },

    #[error("{0} cannot be zero")]
    ZeroThroughput(&'static str),
}

/// The string-typed shape a profile takes in a config file. Every field is
/// required and unknown fields are rejected.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDeviceConfig {
    name: String,
    seek_window: String,
    seek_time: String,
    read_bytes_per_second: String,
    write_bytes_per_second: String,
    allocate_bytes_per_second: String,
    request_reorder_max_delay: String,
    fsync_strategy: String,
    write_strategy: String,
    metadata_op_time: String,
}

fn bytes_field(field: &'static str, value: &str) -> Result<u64, ConfigError> {
    units::parse_bytes(value).map_err(|source| ConfigError::Bytes { field, source })
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    units::parse_duration(value).map_err(|source| ConfigError::Duration { field, source })
}

impl TryFrom<RawDeviceConfig> for DeviceConfig {
    type Error = ConfigError;

    fn try_from(raw: RawDeviceConfig) -> Result<Self, Self::Error> {
        let config = DeviceConfig {
            name: raw.name,
            seek_window: bytes_field("seek_window", &raw.seek_window)?,
            seek_time: duration_field("seek_time", &raw.seek_time)?,
            read_bytes_per_second: bytes_field(
                "read_bytes_per_second",
                &raw.read_bytes_per_second,
            )?,
            write_bytes_per_second: bytes_field(
                "write_bytes_per_second",
                &raw.write_bytes_per_second,
            )?,
            allocate_bytes_per_second: bytes_field(
                "allocate_bytes_per_second",
                &raw.allocate_bytes_per_second,
            )?,
            request_reorder_max_delay: duration_field(
                "request_reorder_max_delay",
                &raw.request_reorder_max_delay,
            )?,
            fsync_strategy: raw.fsync_strategy.parse().map_err(|source| {
                ConfigError::Strategy {
                    field: "fsync_strategy",
                    source,
                }
            })?,
            write_strategy: raw.write_strategy.parse().map_err(|source| {
                ConfigError::Strategy {
                    field: "write_strategy",
                    source,
                }
            })?,
            metadata_op_time: duration_field("metadata_op_time", &raw.metadata_op_time)?,
        };

        config.validate()?;
        Ok(config)
    }
}

impl DeviceConfig {
    /// A basic model of a 7,200-rpm rotational hard disk.
    pub fn hdd7200rpm() -> DeviceConfig {
        DeviceConfig {
            name: "hdd7200rpm".to_string(),
            seek_window: 4 * 1024,
            seek_time: Duration::from_millis(10),
            read_bytes_per_second: 100 * 1024 * 1024,
            write_bytes_per_second: 100 * 1024 * 1024,
            // Allocation moves at 4096 times the write rate, since ext4
            // allocates whole 4 KiB blocks.
            allocate_bytes_per_second: 4096 * 100 * 1024 * 1024,
            request_reorder_max_delay: Duration::from_micros(100),
            fsync_strategy: FsyncStrategy::WriteBackCached,
            write_strategy: WriteStrategy::Fast,
            metadata_op_time: Duration::from_millis(10),
        }
    }

    /// Check the profile for values that make no sense, and warn about
    /// combinations that probably aren't what the user wants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_bytes_per_second == 0 {
            return Err(ConfigError::ZeroThroughput("read_bytes_per_second"));
        }
        if self.write_bytes_per_second == 0 {
            return Err(ConfigError::ZeroThroughput("write_bytes_per_second"));
        }
        if self.allocate_bytes_per_second == 0 {
            return Err(ConfigError::ZeroThroughput("allocate_bytes_per_second"));
        }

        if self.request_reorder_max_delay > Duration::from_micros(500) {
            tracing::warn!(
                target: TRACING_TARGET,
                delay = %format_duration(self.request_reorder_max_delay),
                "request_reorder_max_delay above 500us is probably not what you want",
            );
        }

        if self.write_strategy == WriteStrategy::Simulate
            && self.fsync_strategy == FsyncStrategy::WriteBackCached
        {
            tracing::warn!(
                target: TRACING_TARGET,
                "combining simulated writes with a write back cache is probably not \
                 what you want: the cache models writes landing in memory for free \
                 and being paid for later, during spare device time or at fsync",
            );
        }

        Ok(())
    }

    /// How long writing `bytes` takes at the configured write throughput.
    pub fn write_time(&self, bytes: u64) -> Duration {
        time_from_throughput(bytes, self.write_bytes_per_second)
    }

    /// How long reading `bytes` takes at the configured read throughput.
    pub fn read_time(&self, bytes: u64) -> Duration {
        time_from_throughput(bytes, self.read_bytes_per_second)
    }

    /// How long allocating `bytes` takes at the configured allocation
    /// throughput.
    pub fn allocate_time(&self, bytes: u64) -> Duration {
        time_from_throughput(bytes, self.allocate_bytes_per_second)
    }

    /// How many bytes can be written in `duration`.
    pub fn writable_bytes(&self, duration: Duration) -> u64 {
        bytes_from_time(duration, self.write_bytes_per_second)
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.name)?;
        writeln!(f, "  {:<28} {}", "seek_window", format_bytes(self.seek_window))?;
        writeln!(f, "  {:<28} {}", "seek_time", format_duration(self.seek_time))?;
        writeln!(
            f,
            "  {:<28} {}",
            "read_bytes_per_second",
            format_bytes(self.read_bytes_per_second)
        )?;
        writeln!(
            f,
            "  {:<28} {}",
            "write_bytes_per_second",
            format_bytes(self.write_bytes_per_second)
        )?;
        writeln!(
            f,
            "  {:<28} {}",
            "allocate_bytes_per_second",
            format_bytes(self.allocate_bytes_per_second)
        )?;
        writeln!(
            f,
            "  {:<28} {}",
            "request_reorder_max_delay",
            format_duration(self.request_reorder_max_delay)
        )?;
        writeln!(f, "  {:<28} {}", "fsync_strategy", self.fsync_strategy)?;
        writeln!(f, "  {:<28} {}", "write_strategy", self.write_strategy)?;
        write!(
            f,
            "  {:<28} {}",
            "metadata_op_time",
            format_duration(self.metadata_op_time)
        )
    }
}

/// Parse a JSON config file: an array of device profiles with string values.
pub fn parse_configs(data: &str) -> Result<Vec<DeviceConfig>, ConfigError> {
    let raw: Vec<RawDeviceConfig> = serde_json::from_str(data)?;
    raw.into_iter().map(DeviceConfig::try_from).collect()
}

fn time_from_throughput(bytes: u64, bytes_per_second: u64) -> Duration {
    Duration::from_secs_f64(bytes as f64 / bytes_per_second as f64)
}

fn bytes_from_time(duration: Duration, bytes_per_second: u64) -> u64 {
    (duration.as_secs_f64() * bytes_per_second as f64) as u64
}
