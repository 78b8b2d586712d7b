//! Host-side notifiers
//!
//! - [`CondvarNotifier`]: both ends in one process (tests, simulation)
//! - [`BackoffNotifier`]: spin-then-yield polling for a single waiter
//! - [`JailhouseIrq`]: interrupt injection into the bare-metal cell

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use cell_comms::notify::{IrqInjector, Notify};
use cell_comms::CommsError;
use crossbeam::utils::Backoff;

use crate::error::{HostError, Result};

/// Generation counter behind a condition variable
///
/// A waiter that misses a wake-up still returns after `timeout`, so a lost
/// notification costs latency, never progress.
pub struct CondvarNotifier {
    generation: Mutex<u64>,
    changed: Condvar,
    timeout: Duration,
}

impl CondvarNotifier {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_millis(1))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            generation: Mutex::new(0),
            changed: Condvar::new(),
            timeout,
        }
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CondvarNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notify for CondvarNotifier {
    fn notify(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }

    fn wait_for_change(&self) {
        let generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        let seen = *generation;
        let _ = self
            .changed
            .wait_timeout_while(generation, self.timeout, |g| *g == seen)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Exponential spin, then yield, then short sleeps
///
/// Owned by a single waiter; `notify` only resets the backoff, since the
/// peer is another cell that polls on its own.
#[derive(Default)]
pub struct BackoffNotifier {
    backoff: Backoff,
    sleep: Cell<Duration>,
}

impl BackoffNotifier {
    pub fn new(sleep: Duration) -> Self {
        Self {
            backoff: Backoff::new(),
            sleep: Cell::new(sleep),
        }
    }
}

impl Notify for BackoffNotifier {
    fn notify(&self) {
        self.backoff.reset();
    }

    fn wait_for_change(&self) {
        if self.backoff.is_completed() {
            std::thread::sleep(self.sleep.get());
        } else {
            self.backoff.snooze();
        }
    }
}

/// `JAILHOUSE_DEBUG_INJECTIRQ`, i.e. `_IOW(0, 6, unsigned int)`
pub const JAILHOUSE_DEBUG_INJECTIRQ: u32 = (1 << 30) | (4 << 16) | 6;

/// Interrupt injection through the Jailhouse driver
pub struct JailhouseIrq {
    device: File,
    irq: u32,
}

impl JailhouseIrq {
    /// Open the hypervisor device
    ///
    /// # Arguments
    /// * `path` - usually `/dev/jailhouse`
    /// * `irq` - interrupt number raised in the bare-metal cell
    pub fn open(path: &Path, irq: u32) -> Result<Self> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| HostError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { device, irq })
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }
}

impl IrqInjector for JailhouseIrq {
    fn inject(&self) -> cell_comms::Result<()> {
        // SAFETY: the request takes the interrupt number by value.
        let rc = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                JAILHOUSE_DEBUG_INJECTIRQ as _,
                libc::c_ulong::from(self.irq),
            )
        };
        if rc != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
            return Err(CommsError::InjectFailed(errno));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    #[test]
    fn test_condvar_wakes_waiter() {
        let notifier = CondvarNotifier::with_timeout(Duration::from_secs(5));
        let flag = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::Release);
                notifier.notify();
            });

            let start = Instant::now();
            while !flag.load(Ordering::Acquire) {
                notifier.wait_for_change();
            }
            assert!(start.elapsed() < Duration::from_secs(5));
        });
        assert_eq!(notifier.generation(), 1);
    }

    #[test]
    fn test_condvar_wait_times_out() {
        let notifier = CondvarNotifier::with_timeout(Duration::from_millis(5));
        let start = Instant::now();
        notifier.wait_for_change();
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_eventually_sleeps() {
        let notifier = BackoffNotifier::new(Duration::from_millis(2));
        for _ in 0..64 {
            notifier.wait_for_change();
        }
        let start = Instant::now();
        notifier.wait_for_change();
        assert!(start.elapsed() >= Duration::from_millis(2));
    }

    #[test]
    fn test_injectirq_request_code() {
        assert_eq!(JAILHOUSE_DEBUG_INJECTIRQ, 0x4004_0006);
    }

    #[test]
    fn test_inject_on_plain_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let irq = JailhouseIrq::open(file.path(), 125).unwrap();
        assert!(matches!(irq.inject(), Err(CommsError::InjectFailed(_))));
    }
}
