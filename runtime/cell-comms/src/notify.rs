//! Notify primitive
//!
//! The two cells share no scheduler, so every channel waits by re-checking
//! a flag in shared memory and calling [`Notify::wait_for_change`] between
//! checks. On ARM this is the `wfe`/`sev` pair; the hypervisor-backed
//! variant additionally injects an interrupt into the peer cell.
//!
//! The flag protocol is always the correctness mechanism. A notifier only
//! shortens the time a waiter spends before re-checking.

use crate::Result;

/// Cross-cell wake-up primitive
pub trait Notify {
    /// Wake any peer waiting in [`Notify::wait_for_change`]
    fn notify(&self);

    /// Pause until the peer may have changed shared state
    ///
    /// May return spuriously; callers always re-check their condition.
    fn wait_for_change(&self);
}

impl<N: Notify + ?Sized> Notify for &N {
    fn notify(&self) {
        (**self).notify();
    }

    fn wait_for_change(&self) {
        (**self).wait_for_change();
    }
}

/// Architectural event notifier (`sev` / `wfe`)
///
/// Falls back to a spin-loop hint on architectures without event
/// instructions.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventNotifier;

impl Notify for EventNotifier {
    #[inline]
    fn notify(&self) {
        send_event();
    }

    #[inline]
    fn wait_for_change(&self) {
        wait_for_event();
    }
}

#[cfg(any(target_arch = "aarch64", target_arch = "arm"))]
#[inline]
fn send_event() {
    // SAFETY: `sev` only sets the event register of every core; the barrier
    // orders all prior shared-memory writes before the wake-up.
    unsafe { core::arch::asm!("dsb sy", "sev", options(nostack, preserves_flags)) };
}

#[cfg(any(target_arch = "aarch64", target_arch = "arm"))]
#[inline]
fn wait_for_event() {
    // SAFETY: `wfe` suspends until the next event or interrupt.
    unsafe { core::arch::asm!("wfe", options(nomem, nostack, preserves_flags)) };
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "arm")))]
#[inline]
fn send_event() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "arm")))]
#[inline]
fn wait_for_event() {
    core::hint::spin_loop();
}

/// Injects an interrupt into the peer cell
pub trait IrqInjector {
    fn inject(&self) -> Result<()>;
}

/// Notifier that also raises a hypervisor-injected interrupt on `notify`
pub struct WithIrq<N, I> {
    inner: N,
    injector: I,
}

impl<N: Notify, I: IrqInjector> WithIrq<N, I> {
    pub fn new(inner: N, injector: I) -> Self {
        Self { inner, injector }
    }

    pub fn injector(&self) -> &I {
        &self.injector
    }
}

impl<N: Notify, I: IrqInjector> Notify for WithIrq<N, I> {
    fn notify(&self) {
        self.inner.notify();
        if let Err(err) = self.injector.inject() {
            // Peer still sees the flag on its next poll.
            log::warn!("peer interrupt not delivered: {err}");
        }
    }

    fn wait_for_change(&self) {
        self.inner.wait_for_change();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommsError;
    use core::cell::Cell;

    struct Counting {
        notified: Cell<u32>,
        waited: Cell<u32>,
    }

    impl Notify for Counting {
        fn notify(&self) {
            self.notified.set(self.notified.get() + 1);
        }

        fn wait_for_change(&self) {
            self.waited.set(self.waited.get() + 1);
        }
    }

    struct FlakyInjector {
        fail: bool,
        calls: Cell<u32>,
    }

    impl IrqInjector for FlakyInjector {
        fn inject(&self) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                Err(CommsError::InjectFailed(-1))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_with_irq_notifies_and_injects() {
        let notifier = WithIrq::new(
            Counting {
                notified: Cell::new(0),
                waited: Cell::new(0),
            },
            FlakyInjector {
                fail: false,
                calls: Cell::new(0),
            },
        );

        notifier.notify();
        notifier.wait_for_change();

        assert_eq!(notifier.inner.notified.get(), 1);
        assert_eq!(notifier.inner.waited.get(), 1);
        assert_eq!(notifier.injector().calls.get(), 1);
    }

    #[test]
    fn test_failed_injection_still_notifies() {
        let notifier = WithIrq::new(
            Counting {
                notified: Cell::new(0),
                waited: Cell::new(0),
            },
            FlakyInjector {
                fail: true,
                calls: Cell::new(0),
            },
        );

        notifier.notify();
        notifier.notify();

        assert_eq!(notifier.inner.notified.get(), 2);
        assert_eq!(notifier.injector().calls.get(), 2);
    }

    #[test]
    fn test_event_notifier_returns() {
        // Nothing to observe on the host; the calls must simply not block.
        EventNotifier.notify();
        EventNotifier.wait_for_change();
    }
}
