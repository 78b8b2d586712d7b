//! Libc Server
//!
//! # Purpose
//! Single consumer of the call channel. Publishes the readiness sentinel,
//! then takes calls in arrival order, runs each one through
//! [`dispatch`](crate::dispatch::dispatch) and hands the slot back.
//!
//! # Architecture
//! - One server per channel; [`CallServer::new`] is `unsafe` for that reason
//! - Calls are served one at a time; a slow host call delays every later
//!   call
//! - While idle the server first waits on its notifier (`wfe` on the board)
//!   and, once idle for longer than the spin window, sleeps between polls
//!
//! # Testing Strategy
//! Unit tests drive a real client against the server on two threads over a
//! heap-backed window. End-to-end file operations live in `tests/`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use cell_comms::call::{CallBuffer, ServerEnd};
use cell_comms::{Notify, OpCode, Param};

use crate::config::IdleConfig;
use crate::dispatch::{dispatch, Scratch};
use crate::guest_mem::GuestMemory;
use crate::host::HostOs;

/// Idle policy of the server loop
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    spin_for: Duration,
    sleep: Duration,
    idle_since: Option<Instant>,
}

impl IdleBackoff {
    /// # Arguments
    /// * `spin_for` - how long to keep waiting on the notifier once idle
    /// * `sleep` - sleep between polls after that
    pub fn new(spin_for: Duration, sleep: Duration) -> Self {
        Self {
            spin_for,
            sleep,
            idle_since: None,
        }
    }

    /// Wait once after a poll found nothing to do
    pub fn idle<N: Notify + ?Sized>(&mut self, notify: &N) {
        let since = *self.idle_since.get_or_insert_with(Instant::now);
        if since.elapsed() < self.spin_for {
            notify.wait_for_change();
        } else {
            std::thread::sleep(self.sleep);
        }
    }

    /// Work arrived; the next idle period starts over
    pub fn reset(&mut self) {
        self.idle_since = None;
    }

    pub fn is_sleeping(&self) -> bool {
        self.idle_since
            .is_some_and(|since| since.elapsed() >= self.spin_for)
    }
}

impl Default for IdleBackoff {
    fn default() -> Self {
        Self::from(&IdleConfig::default())
    }
}

impl From<&IdleConfig> for IdleBackoff {
    fn from(config: &IdleConfig) -> Self {
        Self::new(config.spin_for(), config.sleep())
    }
}

/// Host end of the call channel
pub struct CallServer<'a, H, M, N> {
    end: ServerEnd<'a>,
    host: H,
    mem: M,
    notify: N,
    guest_base: Param,
    served: u64,
}

impl<'a, H, M, N> CallServer<'a, H, M, N>
where
    H: HostOs,
    M: GuestMemory,
    N: Notify,
{
    /// Create the server for `buf`
    ///
    /// # Arguments
    /// * `host` - executes the operations
    /// * `mem` - resolves guest pointers found in arguments
    /// * `guest_base` - address of `buf` as the guest sees it; `readdir`
    ///   results point into it
    ///
    /// # Safety
    /// No other server may run on `buf`, in this process or the other cell.
    pub unsafe fn new(buf: &'a CallBuffer, host: H, mem: M, notify: N, guest_base: Param) -> Self {
        Self {
            // SAFETY: single server, per this function's contract.
            end: unsafe { buf.server_end() },
            host,
            mem,
            notify,
            guest_base,
            served: 0,
        }
    }

    pub fn buffer(&self) -> &'a CallBuffer {
        self.end.buffer()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Calls completed so far
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Tell clients the server is up
    ///
    /// # Returns
    /// `false` if the sentinel was already present; cursors and any queued
    /// calls are then left as they are.
    pub fn publish_ready(&self) -> bool {
        let buf = self.end.buffer();
        let fresh = buf.publish_ready();
        if fresh {
            log::info!("call channel ready");
        } else {
            log::info!(
                "call channel already ready, resuming at cursor {} ({} queued)",
                buf.read_cursor(),
                buf.in_flight()
            );
        }
        self.notify.notify();
        fresh
    }

    /// Serve at most one call
    ///
    /// # Returns
    /// `true` if a call was completed
    pub fn poll_once(&mut self) -> bool {
        let Some(mut call) = self.end.next_pending() else {
            return false;
        };

        let index = call.index();
        let op = call.op_raw();
        let words = call.args();
        let scratch = Scratch {
            guest_addr: self
                .guest_base
                .wrapping_add(CallBuffer::scratch_offset(index) as Param),
            bytes: call.scratch_mut(),
        };

        let done = dispatch(&self.host, &self.mem, op, &words, scratch);
        log::debug!(
            "slot {index}: {} -> {:#x} ({})",
            OpCode::from_raw(op).map_or("unknown", OpCode::name),
            done.retval,
            done.errno
        );

        call.complete(done.retval, done.errno);
        self.notify.notify();
        self.served += 1;
        true
    }

    /// Serve calls until `stop` is set
    ///
    /// # Returns
    /// Total number of calls served by this server
    pub fn run_until(&mut self, stop: &AtomicBool, idle: &mut IdleBackoff) -> u64 {
        while !stop.load(Ordering::Acquire) {
            if self.poll_once() {
                idle.reset();
            } else {
                idle.idle(&self.notify);
            }
        }
        log::info!("call server stopped after {} calls", self.served);
        self.served
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::FAILED;
    use crate::guest_mem::IdentityMemory;
    use crate::host::LibcHost;
    use crate::mapping::HeapRegion;
    use crate::notify::CondvarNotifier;
    use cell_comms::abi::{Errno, GuestTimeval};
    use cell_comms::call::ARG_COUNT;
    use cell_comms::layout::CALL_WINDOW_SIZE;
    use cell_comms::{Arg, CallClient};
    use std::cell::Cell;

    struct Counting(Cell<u32>);

    impl Notify for Counting {
        fn notify(&self) {}

        fn wait_for_change(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_idle_waits_then_sleeps() {
        let notify = Counting(Cell::new(0));
        let mut idle = IdleBackoff::new(Duration::from_secs(60), Duration::from_millis(1));
        idle.idle(&notify);
        idle.idle(&notify);
        assert_eq!(notify.0.get(), 2);
        assert!(!idle.is_sleeping());

        let mut idle = IdleBackoff::new(Duration::ZERO, Duration::from_millis(1));
        idle.idle(&notify);
        assert_eq!(notify.0.get(), 2);
        assert!(idle.is_sleeping());
        idle.reset();
        assert!(!idle.is_sleeping());
    }

    #[test]
    fn test_idle_defaults_from_config() {
        let idle = IdleBackoff::default();
        assert_eq!(idle.spin_for, Duration::from_secs(2));
        assert_eq!(idle.sleep, Duration::from_millis(1));
    }

    #[test]
    fn test_publish_ready_is_idempotent() {
        let window = HeapRegion::new(CALL_WINDOW_SIZE).unwrap();
        let region = window.region(0);
        let buf = region.view::<CallBuffer>().unwrap();
        let server = unsafe {
            CallServer::new(buf, LibcHost::new(), IdentityMemory, CondvarNotifier::new(), 0)
        };

        assert!(!buf.is_ready());
        assert!(server.publish_ready());
        assert!(buf.is_ready());
        assert!(!server.publish_ready());
    }

    #[test]
    fn test_empty_channel_serves_nothing() {
        let window = HeapRegion::new(CALL_WINDOW_SIZE).unwrap();
        let region = window.region(0);
        let buf = region.view::<CallBuffer>().unwrap();
        let mut server = unsafe {
            CallServer::new(buf, LibcHost::new(), IdentityMemory, CondvarNotifier::new(), 0)
        };
        server.publish_ready();
        assert!(!server.poll_once());
        assert_eq!(server.served(), 0);
    }

    #[test]
    fn test_client_and_server_threads() {
        let window = HeapRegion::new(CALL_WINDOW_SIZE).unwrap();
        let region = window.region(0);
        let buf = region.view::<CallBuffer>().unwrap();
        let notify = CondvarNotifier::new();
        let stop = AtomicBool::new(false);
        let guest_base = buf as *const CallBuffer as Param;

        let served = crossbeam::scope(|s| {
            let server = s.spawn(|_| {
                let mut server =
                    unsafe { CallServer::new(buf, LibcHost::new(), IdentityMemory, &notify, guest_base) };
                server.publish_ready();
                server.run_until(&stop, &mut IdleBackoff::default())
            });

            let client = CallClient::new(buf, &notify);
            let mut tv = GuestTimeval::default();
            let reply = client
                .call(
                    OpCode::GetTimeOfDay,
                    &[Arg::ptr(&mut tv as *mut GuestTimeval as *const GuestTimeval).unwrap(), Arg::NULL],
                )
                .unwrap();
            assert_eq!(reply.result(), Ok(0));
            assert!(tv.tv_sec > 1_600_000_000);

            let reply = client.call_raw(99, [0; ARG_COUNT]);
            assert_eq!(reply.retval, FAILED);
            assert_eq!(reply.errno, Errno::ENOSYS);

            stop.store(true, Ordering::Release);
            server.join().unwrap()
        })
        .unwrap();

        assert_eq!(served, 2);
    }
}
