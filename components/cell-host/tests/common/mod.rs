//! Shared harness: a libc server on its own thread over heap-backed windows,
//! and a guest libc front end calling into it from the test thread.

#![allow(dead_code)]

use std::ffi::CString;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use cell_comms::guest_libc::{Console, GuestLibc, RpcBackend};
use cell_comms::{CallClient, Param, RegionMap};
use cell_host::mapping::init_comms;
use cell_host::{
    CallServer, CommsRegions, CondvarNotifier, HeapMapper, IdentityMemory, IdleBackoff, LibcHost,
};

/// Console writing to the test's stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn write_bytes(&self, bytes: &[u8]) {
        let _ = std::io::stdout().write_all(bytes);
    }

    fn halt(&self) -> ! {
        panic!("guest program halted");
    }
}

pub type Libc<'a> = GuestLibc<RpcBackend<'a, &'a CondvarNotifier>, StdoutConsole>;

/// Stops the server even when the test body panics
struct StopOnDrop<'a>(&'a AtomicBool);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Run `f` against a live server
///
/// # Returns
/// `f`'s result and the number of calls the server completed
pub fn with_server<R>(f: impl FnOnce(&Libc<'_>) -> R) -> (R, u64) {
    let mapper = HeapMapper::new();
    let map = RegionMap::DEFAULT;
    init_comms(&mapper, &map).expect("Failed to clear windows");
    let regions = CommsRegions::map_all(&mapper, &map).expect("Failed to map windows");
    let buf = regions.call_buffer().expect("Failed to view call buffer");
    let guest_base = regions.call.base() as Param;
    let notify = CondvarNotifier::new();
    let stop = AtomicBool::new(false);

    crossbeam::scope(|s| {
        let server = s.spawn(|_| {
            let mut server =
                unsafe { CallServer::new(buf, LibcHost::new(), IdentityMemory, &notify, guest_base) };
            server.publish_ready();
            server.run_until(&stop, &mut IdleBackoff::default())
        });

        let result = {
            let _stop = StopOnDrop(&stop);
            let libc = GuestLibc::new(RpcBackend::new(CallClient::new(buf, &notify)), StdoutConsole);
            f(&libc)
        };

        let served = server.join().expect("server thread panicked");
        (result, served)
    })
    .expect("test thread panicked")
}

/// NUL-terminated copy of a host path
pub fn cpath(path: &Path) -> CString {
    CString::new(path.as_os_str().as_bytes()).expect("path contains NUL")
}
