//! Monotonic timestamps shared by transports, devices and the scheduler.
//!
//! On Unix the value comes straight from `CLOCK_MONOTONIC`, so a harness and an
//! adapter spawned on the same machine report timestamps in one time base. Other
//! platforms fall back to a process-local epoch.

/// Nanoseconds on the monotonic clock.
#[cfg(unix)]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC is always supported.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return fallback_ns();
    }
    (ts.tv_sec as u64).saturating_mul(1_000_000_000).saturating_add(ts.tv_nsec as u64)
}

/// Nanoseconds on the monotonic clock.
#[cfg(not(unix))]
pub fn monotonic_ns() -> u64 {
    fallback_ns()
}

fn fallback_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
}
