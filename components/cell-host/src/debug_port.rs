//! Debug port bridge
//!
//! Connects a debugger on the host (`target remote | cellctl debug-port`)
//! to the debug stub in the bare-metal cell. Bytes from the reader go into
//! the byte port, bytes from the port go to the writer. The host end's
//! notifier raises the stub's interrupt when a byte is sent.
//!
//! Both directions are polled from one loop. After `idle_polls` iterations
//! without traffic the loop sleeps between polls.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::time::Duration;

use cell_comms::port::PortEnd;
use cell_comms::Notify;

use crate::config::DebugPortConfig;

/// Outcome of one bridge iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// At least one byte moved
    Progress,
    Idle,
    /// The reader reached end of input
    Closed,
}

/// Put a descriptor into non-blocking mode
pub fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    // SAFETY: plain fcntl on a descriptor the caller owns.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub struct DebugBridge<'a, R, W, N> {
    port: PortEnd<'a, N>,
    input: R,
    output: W,
    idle: u32,
    idle_polls: u32,
    idle_sleep: Duration,
    send_retry: Duration,
}

impl<'a, R: Read, W: Write, N: Notify> DebugBridge<'a, R, W, N> {
    /// # Arguments
    /// * `port` - host end of the byte port
    /// * `input` - debugger to stub, expected to be non-blocking
    /// * `output` - stub to debugger
    pub fn new(port: PortEnd<'a, N>, input: R, output: W, config: &DebugPortConfig) -> Self {
        Self {
            port,
            input,
            output,
            idle: 0,
            idle_polls: config.idle_polls,
            idle_sleep: Duration::from_micros(config.idle_sleep_us),
            send_retry: Duration::from_micros(config.send_retry_us),
        }
    }

    /// Iterations since the last byte moved
    pub fn idle_count(&self) -> u32 {
        self.idle
    }

    fn send(&self, byte: u8) {
        while !self.port.try_send(byte) {
            std::thread::sleep(self.send_retry);
        }
    }

    /// Move at most one byte in each direction
    ///
    /// # Errors
    /// Read errors other than `WouldBlock`/`Interrupted`, and write errors
    pub fn pump_once(&mut self) -> io::Result<Pump> {
        let mut moved = false;
        self.idle = self.idle.saturating_add(1);

        let mut byte = [0u8; 1];
        match self.input.read(&mut byte) {
            Ok(0) => return Ok(Pump::Closed),
            Ok(_) => {
                self.send(byte[0]);
                moved = true;
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(err) => return Err(err),
        }

        if let Some(byte) = self.port.try_recv() {
            self.output.write_all(&[byte])?;
            self.output.flush()?;
            moved = true;
        }

        if moved {
            self.idle = 0;
            return Ok(Pump::Progress);
        }
        if self.idle > self.idle_polls {
            std::thread::sleep(self.idle_sleep);
        }
        Ok(Pump::Idle)
    }

    /// Bridge until the debugger side closes
    pub fn run(&mut self) -> io::Result<()> {
        while self.pump_once()? != Pump::Closed {}
        log::info!("debugger disconnected");
        Ok(())
    }
}
