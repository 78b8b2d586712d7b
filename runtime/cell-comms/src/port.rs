//! Byte Port - duplex single-byte mailbox
//!
//! Used by the debug stub of the bare-metal cell to talk to a debugger on
//! the host. Each direction is one `{ avail, data }` byte pair with two
//! states: Empty (`avail == 0`) and Full. The sender waits for Empty, writes
//! the data byte and then sets `avail`; the receiver waits for Full, reads
//! the data byte and then clears `avail`.

use core::sync::atomic::{AtomicU8, Ordering};

use static_assertions::const_assert_eq;

use crate::notify::Notify;
use crate::region::SharedLayout;

/// One direction of the port
#[repr(C)]
pub struct Mailbox {
    avail: AtomicU8,
    data: AtomicU8,
}

impl Mailbox {
    pub fn is_full(&self) -> bool {
        self.avail.load(Ordering::Acquire) != 0
    }
}

/// Port layout: host-to-guest mailbox first, then guest-to-host
#[repr(C)]
pub struct BytePort {
    to_guest: Mailbox,
    from_guest: Mailbox,
}

unsafe impl SharedLayout for BytePort {
    const NAME: &'static str = "debug port";
}

const_assert_eq!(core::mem::size_of::<BytePort>(), 4);

/// Which cell an end belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Host,
    Guest,
}

impl BytePort {
    /// Borrow one end of the port
    ///
    /// Each role must be held by at most one end at a time.
    pub fn end<N: Notify>(&self, role: PortRole, notify: N) -> PortEnd<'_, N> {
        let (tx, rx) = match role {
            PortRole::Host => (&self.to_guest, &self.from_guest),
            PortRole::Guest => (&self.from_guest, &self.to_guest),
        };
        PortEnd { tx, rx, notify }
    }

    pub fn host<N: Notify>(&self, notify: N) -> PortEnd<'_, N> {
        self.end(PortRole::Host, notify)
    }

    pub fn guest<N: Notify>(&self, notify: N) -> PortEnd<'_, N> {
        self.end(PortRole::Guest, notify)
    }

    /// Mark both directions Empty
    pub fn reset(&self) {
        self.to_guest.avail.store(0, Ordering::Release);
        self.from_guest.avail.store(0, Ordering::Release);
    }
}

/// One side of the byte port
pub struct PortEnd<'a, N> {
    tx: &'a Mailbox,
    rx: &'a Mailbox,
    notify: N,
}

impl<N: Notify> PortEnd<'_, N> {
    /// Send a byte, waiting while the peer has not taken the previous one
    pub fn send(&self, byte: u8) {
        while !self.try_send(byte) {
            self.notify.wait_for_change();
        }
    }

    /// Send a byte if the outgoing mailbox is Empty
    pub fn try_send(&self, byte: u8) -> bool {
        if self.tx.is_full() {
            return false;
        }
        self.tx.data.store(byte, Ordering::Relaxed);
        // Flag last: the peer reads data only after seeing it.
        self.tx.avail.store(1, Ordering::Release);
        self.notify.notify();
        true
    }

    /// Receive a byte, waiting while the incoming mailbox is Empty
    pub fn recv(&self) -> u8 {
        loop {
            if let Some(byte) = self.try_recv() {
                return byte;
            }
            self.notify.wait_for_change();
        }
    }

    /// Take the incoming byte if the mailbox is Full
    pub fn try_recv(&self) -> Option<u8> {
        if !self.rx.is_full() {
            return None;
        }
        let byte = self.rx.data.load(Ordering::Relaxed);
        self.rx.avail.store(0, Ordering::Release);
        self.notify.notify();
        Some(byte)
    }

    pub fn has_data(&self) -> bool {
        self.rx.is_full()
    }

    pub fn can_send(&self) -> bool {
        !self.tx.is_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{HeapWindow, YieldNotifier};
    use std::vec::Vec;

    #[test]
    fn test_single_byte_states() {
        let window = HeapWindow::new(16);
        let port = window.region().view::<BytePort>().unwrap();
        let host = port.host(YieldNotifier);
        let guest = port.guest(YieldNotifier);

        assert!(host.try_send(b'$'));
        // Full until the guest takes it.
        assert!(!host.try_send(b'x'));
        assert!(guest.has_data());
        assert_eq!(guest.try_recv(), Some(b'$'));
        assert_eq!(guest.try_recv(), None);
        assert!(host.can_send());

        // Directions are independent.
        assert!(guest.try_send(b'+'));
        assert_eq!(host.try_recv(), Some(b'+'));
    }

    #[test]
    fn test_reset_empties_both_directions() {
        let window = HeapWindow::new(16);
        let port = window.region().view::<BytePort>().unwrap();
        let host = port.host(YieldNotifier);
        let guest = port.guest(YieldNotifier);

        host.try_send(1);
        guest.try_send(2);
        port.reset();

        assert!(!host.has_data());
        assert!(!guest.has_data());
    }

    #[test]
    fn test_duplex_stream_between_threads() {
        let window = HeapWindow::new(16);
        let port = window.region().view::<BytePort>().unwrap();
        let request = b"$qSupported#37";
        let response = b"+$PacketSize=4000#00";

        std::thread::scope(|s| {
            s.spawn(|| {
                let guest = port.guest(YieldNotifier);
                let got: Vec<u8> = (0..request.len()).map(|_| guest.recv()).collect();
                assert_eq!(got, request);
                for &b in response {
                    guest.send(b);
                }
            });

            let host = port.host(YieldNotifier);
            for &b in request {
                host.send(b);
            }
            let got: Vec<u8> = (0..response.len()).map(|_| host.recv()).collect();
            assert_eq!(got, response);
        });
    }
}
