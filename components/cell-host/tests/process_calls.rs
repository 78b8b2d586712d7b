//! Process calls: system, forkptyexec and wait
//!
//! Kept apart from the file tests because `wait` reaps any child of the
//! test process; everything here runs inside a single test.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use cell_comms::abi::GuestWinsize;
use cell_comms::Errno;
use common::with_server;

/// Test shell commands and a pseudo-terminal child end to end
#[test]
fn test_process_calls() {
    with_server(|guest| {
        // Wait status, not the bare exit code.
        assert_eq!(guest.system(c"exit 3"), Ok(3 << 8));
        assert_eq!(guest.system(c"true"), Ok(0));

        let winsize = GuestWinsize {
            ws_row: 24,
            ws_col: 80,
            ..GuestWinsize::default()
        };
        let child = guest
            .forkptyexec(&[c"echo $TERM"], &winsize)
            .expect("forkptyexec failed");
        assert!(child.pid > 0);
        assert!(child.master_fd > 2);

        let mut output = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 64];
        while Instant::now() < deadline {
            match guest.read(child.master_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    output.extend_from_slice(&buf[..n]);
                    if output.windows(13).any(|w| w == b"cons25-debian") {
                        break;
                    }
                }
                Err(Errno(code)) if code == libc::EAGAIN as u32 => {
                    thread::sleep(Duration::from_millis(10))
                }
                // EIO once the slave side is gone.
                Err(_) => break,
            }
        }
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("cons25-debian"), "unexpected pty output {text:?}");

        let exit = guest.wait().expect("wait failed");
        assert_eq!(exit.pid, child.pid);
        assert_eq!(exit.status, 0);
        guest.close(child.master_fd).unwrap();

        // No children left.
        assert_eq!(guest.wait().err(), Some(Errno(libc::ECHILD as u32)));

        let too_many = [c"x"; 16];
        assert_eq!(
            guest.forkptyexec(&too_many, &winsize).err(),
            Some(Errno::E2BIG)
        );
    });
}
