//! Write-back cache model.
//!
//! Under [`FsyncStrategy::WriteBackCached`](crate::FsyncStrategy) writes are
//! absorbed for free and their bytes are recorded here as pending. Pending
//! bytes drain in two ways: the device grants the cache its idle gaps (see
//! [`WriteBackCache::write_back`]), and an fsync flushes one file completely
//! (the fsync itself is charged for those bytes by the device model).

use indexmap::IndexMap;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use std::time::Duration;

use crate::config::DeviceConfig;

pub(crate) struct WriteBackCache {
    /// Bytes written but not yet written back, per file.
    unwritten_bytes: IndexMap<String, u64>,

    /// Bytes belonging to files that were closed while still dirty. They no
    /// longer answer fsync, but they still compete for spare device time.
    orphaned_unwritten_bytes: u64,

    config: DeviceConfig,

    /// Drives the drain order shuffle. Seedable so tests can pin it.
    rng: Box<dyn RngCore + Send>,
}

impl WriteBackCache {
    pub(crate) fn new(config: DeviceConfig) -> WriteBackCache {
        WriteBackCache::with_rng(config, Box::new(SmallRng::from_os_rng()))
    }

    pub(crate) fn with_rng(config: DeviceConfig, rng: Box<dyn RngCore + Send>) -> WriteBackCache {
        WriteBackCache {
            unwritten_bytes: IndexMap::new(),
            orphaned_unwritten_bytes: 0,
            config,
            rng,
        }
    }

    /// Record `bytes` of new dirty data for `path`.
    pub(crate) fn write(&mut self, path: &str, bytes: u64) {
        if bytes > 0 {
            *self.unwritten_bytes.entry(path.to_string()).or_default() += bytes;
        }
    }

    /// The file was closed: its pending bytes become orphaned.
    pub(crate) fn close(&mut self, path: &str) {
        self.orphaned_unwritten_bytes += self.unwritten_bytes.swap_remove(path).unwrap_or(0);
    }

    /// Pending bytes for `path`; zero if the file has none.
    pub(crate) fn unwritten_bytes(&self, path: &str) -> u64 {
        self.unwritten_bytes.get(path).copied().unwrap_or(0)
    }

    /// Drop everything pending for `path`. Called on fsync, after the device
    /// model has already charged for writing those bytes out.
    pub(crate) fn write_back_file(&mut self, path: &str) {
        self.unwritten_bytes.swap_remove(path);
    }

    /// Spend up to `budget` of device time writing dirty bytes back.
    ///
    /// Files take turns in a freshly shuffled order so that no single file
    /// monopolises repeated short idle windows. Whatever budget remains after
    /// the per-file pass goes to orphaned bytes.
    pub(crate) fn write_back(&mut self, budget: Duration) {
        let mut paths: Vec<String> = self.unwritten_bytes.keys().cloned().collect();
        paths.shuffle(&mut self.rng);

        let mut remaining = budget;
        for path in paths {
            remaining = remaining.saturating_sub(self.write_back_bytes_for_file(&path, remaining));

            if remaining.is_zero() {
                break;
            }
        }

        if remaining >= self.config.seek_time {
            self.orphaned_unwritten_bytes -= self
                .orphaned_unwritten_bytes
                .min(self.writable_bytes(remaining));
        }
    }

    /// Write back as many of `path`'s bytes as fit in `budget`, returning the
    /// device time that took. Writing anything costs a seek first.
    fn write_back_bytes_for_file(&mut self, path: &str, budget: Duration) -> Duration {
        let bytes_to_write = self.unwritten_bytes(path).min(self.writable_bytes(budget));

        let mut time_taken = Duration::ZERO;
        if bytes_to_write != 0 {
            time_taken = self.config.seek_time + self.config.write_time(bytes_to_write);
        }

        if let Some(pending) = self.unwritten_bytes.get_mut(path) {
            *pending -= bytes_to_write;
            if *pending == 0 {
                self.unwritten_bytes.swap_remove(path);
            }
        }
        time_taken
    }

    /// How many bytes fit in `budget` once the leading seek is paid for. A
    /// budget smaller than one seek fits nothing.
    fn writable_bytes(&self, budget: Duration) -> u64 {
        self.config
            .writable_bytes(budget.saturating_sub(self.config.seek_time))
    }

    #[cfg(test)]
    fn total_pending(&self) -> u64 {
        self.orphaned_unwritten_bytes + self.unwritten_bytes.values().sum::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FsyncStrategy, WriteStrategy};

    fn test_config() -> DeviceConfig {
        DeviceConfig {
            name: "test".to_string(),
            seek_window: 4,
            seek_time: Duration::from_millis(10),
            read_bytes_per_second: 100,
            write_bytes_per_second: 100,
            allocate_bytes_per_second: 1000,
            request_reorder_max_delay: Duration::from_millis(10),
            fsync_strategy: FsyncStrategy::WriteBackCached,
            write_strategy: WriteStrategy::Fast,
            metadata_op_time: Duration::from_millis(80),
        }
    }

    fn test_cache() -> WriteBackCache {
        WriteBackCache::with_rng(test_config(), Box::new(SmallRng::seed_from_u64(42)))
    }

    #[test]
    fn write_accumulates_per_path() {
        let cases = [
            ("a", 101, 101),
            ("b", 102, 102),
            ("c", 0, 0),
            ("c", 0, 0),
            ("c", 1, 1),
            ("c", 5, 6),
            ("a", 1, 102),
            ("b", 102, 204),
        ];

        let mut cache = test_cache();
        for (path, bytes, want) in cases {
            cache.write(path, bytes);
            assert_eq!(cache.unwritten_bytes(path), want, "path {path}");
        }
    }

    #[test]
    fn close_moves_bytes_to_orphaned() {
        let cases = [
            ("a", 101, 101),
            ("b", 102, 203),
            ("c", 0, 203),
            ("c", 0, 203),
            ("c", 1, 204),
            ("c", 5, 209),
            ("a", 1, 210),
            ("b", 102, 312),
        ];

        let mut cache = test_cache();
        for (path, bytes, want_orphaned) in cases {
            cache.write(path, bytes);
            cache.close(path);

            assert_eq!(cache.unwritten_bytes(path), 0, "path {path}");
            assert_eq!(cache.orphaned_unwritten_bytes, want_orphaned, "path {path}");
        }
    }

    #[test]
    fn close_of_untracked_path_is_a_noop() {
        let mut cache = test_cache();
        cache.close("nope");
        assert_eq!(cache.orphaned_unwritten_bytes, 0);
        assert_eq!(cache.total_pending(), 0);
    }

    #[test]
    fn write_back_file_drops_the_entry() {
        let mut cache = test_cache();
        cache.write("a", 500);
        cache.write_back_file("a");
        assert_eq!(cache.unwritten_bytes("a"), 0);
        assert_eq!(cache.orphaned_unwritten_bytes, 0);
    }

    #[test]
    fn write_back_with_nothing_pending() {
        let mut cache = test_cache();
        cache.write_back(Duration::ZERO);
        cache.write_back(Duration::from_secs(1));
        assert_eq!(cache.total_pending(), 0);
    }

    #[test]
    fn write_back_drains_everything_given_enough_time() {
        let mut cache = test_cache();
        for (path, bytes, close) in [
            ("a", 100, false),
            ("b", 100, true),
            ("b", 100, false),
            ("c", 200, false),
            ("d", 200, true),
            ("d", 200, true),
            ("d", 200, false),
            ("a", 100, false),
            ("b", 100, false),
        ] {
            cache.write(path, bytes);
            if close {
                cache.close(path);
            }
        }

        cache.write_back(Duration::ZERO);
        assert_eq!(cache.total_pending(), 1300);

        cache.write_back(Duration::from_secs(3600));
        assert_eq!(cache.total_pending(), 0);
    }

    #[test]
    fn write_back_consumes_budget_incrementally() {
        // At 100 B/s with a 10ms seek, a budget of d drains at most
        // (d - 10ms) * 100 bytes from the first file it touches.
        let cases = [
            (Duration::ZERO, 60),
            (Duration::from_millis(10), 60),
            (Duration::from_millis(5), 60),
            (Duration::from_millis(19), 60),
            (Duration::from_millis(15), 60),
            (Duration::from_millis(20), 59),
            (Duration::from_millis(100), 50),
            (Duration::from_millis(530), 0),
            (Duration::from_millis(500), 0),
        ];

        let mut cache = test_cache();
        for (path, bytes, close) in [
            ("a", 20, false),
            ("b", 10, true),
            ("c", 20, false),
            ("d", 10, true),
        ] {
            cache.write(path, bytes);
            if close {
                cache.close(path);
            }
        }

        for (budget, want_remaining) in cases {
            cache.write_back(budget);
            assert_eq!(cache.total_pending(), want_remaining, "budget {budget:?}");
        }
    }

    #[test]
    fn per_file_drain_costs_and_remainders() {
        struct Case {
            desc: &'static str,
            config: DeviceConfig,
            bytes: u64,
            budget: Duration,
            want_time: Duration,
            want_remaining: u64,
        }

        let odd_config = DeviceConfig {
            seek_time: Duration::from_micros(3044),
            write_bytes_per_second: 37,
            ..test_config()
        };

        let cases = [
            Case {
                desc: "no time to seek",
                config: test_config(),
                bytes: 1,
                budget: Duration::from_millis(9),
                want_time: Duration::ZERO,
                want_remaining: 1,
            },
            Case {
                desc: "no time to seek 2",
                config: test_config(),
                bytes: 6,
                budget: Duration::from_millis(4),
                want_time: Duration::ZERO,
                want_remaining: 6,
            },
            Case {
                desc: "time limited",
                config: test_config(),
                bytes: 100,
                budget: Duration::from_millis(510),
                want_time: Duration::from_millis(510),
                want_remaining: 50,
            },
            Case {
                desc: "non-nice duration",
                config: test_config(),
                bytes: 97,
                budget: Duration::from_millis(467),
                want_time: Duration::from_millis(460),
                want_remaining: 52,
            },
            Case {
                desc: "no bytes",
                config: test_config(),
                bytes: 0,
                budget: Duration::from_millis(100),
                want_time: Duration::ZERO,
                want_remaining: 0,
            },
            Case {
                desc: "zero budget",
                config: test_config(),
                bytes: 1,
                budget: Duration::ZERO,
                want_time: Duration::ZERO,
                want_remaining: 1,
            },
            Case {
                desc: "byte limited",
                config: test_config(),
                bytes: 10,
                budget: Duration::from_millis(510),
                want_time: Duration::from_millis(110),
                want_remaining: 0,
            },
            Case {
                desc: "odd numbers",
                config: odd_config,
                bytes: 13,
                budget: Duration::from_micros(137_543),
                want_time: Duration::from_nanos(111_152_108),
                want_remaining: 9,
            },
        ];

        for case in cases {
            let mut cache =
                WriteBackCache::with_rng(case.config, Box::new(SmallRng::seed_from_u64(7)));
            cache.write("a", case.bytes);

            assert_eq!(
                cache.write_back_bytes_for_file("a", case.budget),
                case.want_time,
                "case {}",
                case.desc
            );
            assert_eq!(
                cache.unwritten_bytes("a"),
                case.want_remaining,
                "case {}",
                case.desc
            );
        }
    }

    #[test]
    fn writable_bytes_charges_a_seek_first() {
        let cases = [
            (Duration::from_secs(1), 1, Duration::ZERO, 1),
            (Duration::from_secs(1), 1000, Duration::ZERO, 1000),
            (Duration::from_secs(1), 1, Duration::from_secs(1), 0),
            (Duration::from_secs(1), 1000, Duration::from_millis(500), 500),
            (Duration::from_secs(2), 1000, Duration::from_millis(500), 1500),
            (Duration::ZERO, 100, Duration::from_millis(500), 0),
        ];

        for (budget, bps, seek_time, want) in cases {
            let config = DeviceConfig {
                write_bytes_per_second: bps,
                seek_time,
                ..test_config()
            };
            let cache = WriteBackCache::with_rng(config, Box::new(SmallRng::seed_from_u64(7)));
            assert_eq!(
                cache.writable_bytes(budget),
                want,
                "budget {budget:?} bps {bps} seek {seek_time:?}"
            );
        }
    }

    #[test]
    fn drain_conserves_bytes() {
        let mut cache = test_cache();
        cache.write("a", 300);
        cache.write("b", 200);
        cache.close("b");

        let mut last = cache.total_pending();
        assert_eq!(last, 500);
        for _ in 0..20 {
            cache.write_back(Duration::from_millis(25));
            let now = cache.total_pending();
            assert!(now <= last, "pending grew from {last} to {now}");
            last = now;
        }
    }
}
