//! End-to-end scheduler tests.
//!
//! The clock starts paused, so timers advance deterministically and the
//! asserted durations are exact.

use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};

use molasses::{DeviceConfig, FsyncStrategy, Request, Scheduler, WriteStrategy};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Reads ten times slower than writes, to tell the two apart.
fn asymmetric_config() -> DeviceConfig {
    DeviceConfig {
        name: "asymmetric".to_string(),
        seek_window: 4,
        seek_time: ms(10),
        read_bytes_per_second: 10,
        write_bytes_per_second: 100,
        allocate_bytes_per_second: 1000,
        request_reorder_max_delay: ms(10),
        fsync_strategy: FsyncStrategy::None,
        write_strategy: WriteStrategy::Simulate,
        metadata_op_time: ms(80),
    }
}

fn basic_config() -> DeviceConfig {
    DeviceConfig {
        name: "basic".to_string(),
        read_bytes_per_second: 100,
        ..asymmetric_config()
    }
}

fn fast_write_config() -> DeviceConfig {
    DeviceConfig {
        name: "fast".to_string(),
        write_strategy: WriteStrategy::Fast,
        ..basic_config()
    }
}

fn write_back_config() -> DeviceConfig {
    DeviceConfig {
        name: "wbc".to_string(),
        fsync_strategy: FsyncStrategy::WriteBackCached,
        ..fast_write_config()
    }
}

#[tokio::test(start_paused = true)]
async fn sequential_reads_skip_the_second_seek() {
    let scheduler = Scheduler::new(asymmetric_config());
    let start = Instant::now();

    let first = scheduler.schedule(Request::read("a", 0, 1, start)).await;
    assert_eq!(first, ms(110));

    sleep_until(start + ms(110)).await;
    let second = scheduler
        .schedule(Request::read("a", 1, 1, Instant::now()))
        .await;
    assert_eq!(second, ms(100));
}

#[tokio::test(start_paused = true)]
async fn backward_reads_seek_again() {
    let scheduler = Scheduler::new(asymmetric_config());
    let start = Instant::now();

    let first = scheduler.schedule(Request::read("a", 1, 1, start)).await;
    assert_eq!(first, ms(110));

    sleep_until(start + ms(110)).await;
    let second = scheduler
        .schedule(Request::read("a", 0, 1, Instant::now()))
        .await;
    assert_eq!(second, ms(110));
}

#[tokio::test(start_paused = true)]
async fn simultaneous_reads_serialise_on_the_device() {
    let scheduler = Scheduler::new(asymmetric_config());
    let start = Instant::now();

    let (first, second) = tokio::join!(
        scheduler.schedule(Request::read("a", 0, 1, start)),
        scheduler.schedule(Request::read("a", 1, 1, start)),
    );

    // The second read waits out the first, then runs without a seek.
    assert_eq!(first, ms(110));
    assert_eq!(second, ms(210));
}

#[tokio::test(start_paused = true)]
async fn fast_writes_are_free_but_occupy_the_device() {
    let scheduler = Scheduler::new(fast_write_config());
    let start = Instant::now();

    let first = scheduler.schedule(Request::write("a", 0, 1, start)).await;
    assert_eq!(first, ms(0));

    sleep_until(start + ms(10)).await;
    let second = scheduler
        .schedule(Request::write("a", 1, 1, Instant::now()))
        .await;
    assert_eq!(second, ms(0));

    // A write stamped back at the start has to absorb the busy window left
    // by the second one.
    let stale = scheduler
        .schedule(Request::write("a", 10, 100, start))
        .await;
    assert_eq!(stale, ms(10));
}

#[tokio::test(start_paused = true)]
async fn fsync_pays_for_cached_writes() {
    let scheduler = Scheduler::new(write_back_config());
    let start = Instant::now();

    let first = scheduler
        .schedule(Request::write("a", 0, 1000, start))
        .await;
    let second = scheduler
        .schedule(Request::write("a", 1000, 100, start))
        .await;
    assert_eq!((first, second), (ms(0), ms(0)));

    // One seek plus 1100 bytes at 100 B/s.
    let fsync = scheduler
        .schedule(Request::fsync("a", Instant::now()))
        .await;
    assert_eq!(fsync, ms(11_010));

    // After the caller has slept off the fsync, a second one has nothing
    // left to flush and costs only the seek.
    sleep(ms(11_010)).await;
    let fsync = scheduler
        .schedule(Request::fsync("a", Instant::now()))
        .await;
    assert_eq!(fsync, ms(10));
}

#[tokio::test(start_paused = true)]
async fn allocate_is_charged_at_allocation_throughput() {
    let scheduler = Scheduler::new(basic_config());

    let duration = scheduler
        .schedule(Request::allocate("a", 5, 4123, Instant::now()))
        .await;
    assert_eq!(duration, ms(4133));
}

#[tokio::test(start_paused = true)]
async fn open_costs_a_metadata_op() {
    let scheduler = Scheduler::new(basic_config());

    let duration = scheduler
        .schedule(Request::open("a", Instant::now()))
        .await;
    assert_eq!(duration, ms(80));
}

#[tokio::test(start_paused = true)]
async fn metadata_requests_answer_in_submission_order() {
    let scheduler = Scheduler::new(basic_config());
    let start = Instant::now();

    let (first, second, third) = tokio::join!(
        scheduler.schedule(Request::metadata(start)),
        scheduler.schedule(Request::metadata(start)),
        scheduler.schedule(Request::close("a", start)),
    );

    // Each one queues up behind the previous on the device.
    assert_eq!(first, ms(80));
    assert_eq!(second, ms(160));
    assert_eq!(third, ms(240));
}

#[tokio::test(start_paused = true)]
async fn later_read_overtakes_to_form_a_sequential_run() {
    let scheduler = Scheduler::new(basic_config());
    let start = Instant::now();

    // Offset 1 arrives first; offset 0 arrives 5ms later but slots in ahead
    // because it ends exactly where the other begins.
    let behind = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let duration = scheduler.schedule(Request::read("a", 1, 1, start)).await;
            (duration, Instant::now())
        })
    };

    sleep(ms(5)).await;
    let duration = scheduler
        .schedule(Request::read("a", 0, 1, Instant::now()))
        .await;
    let ahead = (duration, Instant::now());

    let behind = behind.await.unwrap();

    // The overtaker runs first: one seek plus one byte.
    assert_eq!(ahead.0, ms(20));
    // The original head then reads sequentially, but only starts once the
    // device frees up at 25ms past its own submission.
    assert_eq!(behind.0, ms(35));
    assert!(ahead.1 < behind.1, "reordered request should answer first");
}

#[tokio::test(start_paused = true)]
async fn requests_too_old_cannot_be_overtaken() {
    let scheduler = Scheduler::new(basic_config());
    let start = Instant::now();

    let behind = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let duration = scheduler.schedule(Request::read("a", 1, 1, start)).await;
            (duration, Instant::now())
        })
    };

    // Arrives 11ms later: outside the 10ms reorder window, so it stays
    // behind even though it would form a sequential run.
    sleep(ms(11)).await;
    let duration = scheduler
        .schedule(Request::read("a", 0, 1, Instant::now()))
        .await;
    let late = (duration, Instant::now());

    let behind = behind.await.unwrap();

    assert!(behind.1 < late.1, "the older request should answer first");
    // The head pays its own seek; the latecomer seeks backwards.
    assert_eq!(behind.0, ms(20));
    assert_eq!(late.0, ms(29));
}
