//! Guest libc front end
//!
//! Typed libc entry points for the bare-metal side. Every call that needs
//! the host goes through a [`LibcBackend`]: [`RpcBackend`] forwards it over
//! the call channel, [`Unsupported`] fails it with `ENOTSUP` for builds that
//! run without a hypervisor. Standard output and error, `isatty` and `exit`
//! never leave the cell.

use core::ffi::CStr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::abi::{Errno, GuestDirent, GuestOpenFlags, GuestStat, GuestTimeval, GuestWinsize, WireStruct};
use crate::call::{Arg, CallClient, CallReply, OpCode, Param};
use crate::notify::Notify;
use crate::CommsError;

/// Result of a libc call as seen by the bare-metal program
pub type LibcResult<T> = core::result::Result<T, Errno>;

/// Arguments `forkptyexec` forwards, not counting the terminator
pub const MAX_EXEC_ARGS: usize = 15;

impl From<CommsError> for Errno {
    fn from(err: CommsError) -> Self {
        match err {
            CommsError::PointerTooWide { .. } | CommsError::Misaligned { .. } => Errno::EFAULT,
            CommsError::UnknownOp(_) => Errno::ENOSYS,
            _ => Errno::EINVAL,
        }
    }
}

/// Where host-bound calls go
pub trait LibcBackend {
    /// Run `op` on the host and return its raw reply
    ///
    /// # Errors
    /// The backend's own failure; host call failures come back in the reply.
    fn invoke(&self, op: OpCode, args: &[Arg]) -> LibcResult<CallReply>;
}

/// Forwards calls to the host libc server
pub struct RpcBackend<'a, N: Notify> {
    client: CallClient<'a, N>,
}

impl<'a, N: Notify> RpcBackend<'a, N> {
    pub fn new(client: CallClient<'a, N>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &CallClient<'a, N> {
        &self.client
    }
}

impl<N: Notify> LibcBackend for RpcBackend<'_, N> {
    fn invoke(&self, op: OpCode, args: &[Arg]) -> LibcResult<CallReply> {
        log::trace!("libc call {}", op.name());
        Ok(self.client.call(op, args)?)
    }
}

/// Backend of a standalone build: nothing is reachable
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

impl LibcBackend for Unsupported {
    fn invoke(&self, _op: OpCode, _args: &[Arg]) -> LibcResult<CallReply> {
        Err(Errno::ENOTSUP)
    }
}

/// Local console of the bare-metal cell
pub trait Console {
    fn write_bytes(&self, bytes: &[u8]);

    /// Stop the program; never returns
    fn halt(&self) -> !;
}

/// Directory stream handle issued by the host
///
/// Opaque and never zero; it is not a host pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dir(Param);

impl Dir {
    pub fn raw(&self) -> Param {
        self.0
    }
}

/// Status of a child reaped by [`GuestLibc::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: i32,
    pub status: i32,
}

/// Child started by [`GuestLibc::forkptyexec`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyChild {
    pub pid: i32,
    /// Non-blocking pty master descriptor on the host
    pub master_fd: i32,
}

/// libc front end over a backend and a local console
pub struct GuestLibc<B, C> {
    backend: B,
    console: C,
    stdout_enabled: AtomicBool,
}

fn out_ptr<T>(value: &mut T) -> LibcResult<Arg> {
    Ok(Arg::ptr(value as *mut T as *const T)?)
}

fn path_arg(path: &CStr) -> LibcResult<Arg> {
    Ok(Arg::ptr(path.as_ptr())?)
}

fn fd_arg(fd: i32) -> Arg {
    Arg::int(i64::from(fd))
}

impl<B: LibcBackend, C: Console> GuestLibc<B, C> {
    pub fn new(backend: B, console: C) -> Self {
        Self {
            backend,
            console,
            stdout_enabled: AtomicBool::new(true),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Silence standard output and error without failing writes
    pub fn set_stdout_enabled(&self, enabled: bool) {
        self.stdout_enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_console(fd: i32) -> bool {
        fd == 1 || fd == 2
    }

    fn console_write(&self, buf: &[u8]) {
        if !self.stdout_enabled.load(Ordering::Relaxed) {
            return;
        }
        let mut lines = buf.split(|&b| b == b'\n');
        if let Some(first) = lines.next() {
            self.console.write_bytes(first);
        }
        for line in lines {
            self.console.write_bytes(b"\r\n");
            self.console.write_bytes(line);
        }
    }

    /// Invoke and apply the negative-return convention
    fn invoke_int(&self, op: OpCode, args: &[Arg]) -> LibcResult<Param> {
        self.backend.invoke(op, args)?.result()
    }

    fn invoke_unit(&self, op: OpCode, args: &[Arg]) -> LibcResult<()> {
        self.invoke_int(op, args).map(|_| ())
    }

    pub fn write(&self, fd: i32, buf: &[u8]) -> LibcResult<usize> {
        if Self::is_console(fd) {
            self.console_write(buf);
            return Ok(buf.len());
        }
        let n = self.invoke_int(OpCode::Write, &[fd_arg(fd), Arg::buf(buf)?])?;
        Ok(n as usize)
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> LibcResult<usize> {
        if Self::is_console(fd) {
            return Err(Errno::EBADF);
        }
        let n = self.invoke_int(OpCode::Read, &[fd_arg(fd), Arg::buf_mut(buf)?])?;
        Ok(n as usize)
    }

    pub fn lseek(&self, fd: i32, offset: i64, whence: i32) -> LibcResult<i64> {
        let args = [fd_arg(fd), Arg::int(offset), Arg::int(i64::from(whence))];
        let pos = self.invoke_int(OpCode::Lseek, &args)?;
        Ok(pos as i64)
    }

    pub fn fstat(&self, fd: i32) -> LibcResult<GuestStat> {
        let mut st = GuestStat::default();
        self.invoke_unit(OpCode::Fstat, &[fd_arg(fd), out_ptr(&mut st)?])?;
        Ok(st)
    }

    pub fn stat(&self, path: &CStr) -> LibcResult<GuestStat> {
        let mut st = GuestStat::default();
        self.invoke_unit(OpCode::Stat, &[path_arg(path)?, out_ptr(&mut st)?])?;
        Ok(st)
    }

    /// Open a host file
    ///
    /// # Arguments
    /// * `flags` - bare-metal flag bits; the server maps them to the host's
    /// * `mode` - permission bits for `CREAT`
    pub fn open(&self, path: &CStr, flags: GuestOpenFlags, mode: u32) -> LibcResult<i32> {
        let args = [
            path_arg(path)?,
            Arg::Int(Param::from(flags.bits())),
            Arg::Int(Param::from(mode)),
        ];
        let fd = self.invoke_int(OpCode::Open, &args)?;
        Ok(fd as i32)
    }

    pub fn close(&self, fd: i32) -> LibcResult<()> {
        self.invoke_unit(OpCode::Close, &[fd_arg(fd)])
    }

    pub fn unlink(&self, path: &CStr) -> LibcResult<()> {
        self.invoke_unit(OpCode::Unlink, &[path_arg(path)?])
    }

    pub fn opendir(&self, path: &CStr) -> LibcResult<Dir> {
        let reply = self.backend.invoke(OpCode::Opendir, &[path_arg(path)?])?;
        if reply.is_null() {
            return Err(reply.errno);
        }
        Ok(Dir(reply.retval))
    }

    pub fn closedir(&self, dir: Dir) -> LibcResult<()> {
        self.invoke_unit(OpCode::Closedir, &[Arg::Int(dir.0)])
    }

    /// Next entry of a directory stream
    ///
    /// # Returns
    /// `None` at the end of the stream. The entry is decoded from the
    /// translated copy the server placed in the call's scratch area.
    pub fn readdir(&self, dir: &Dir) -> LibcResult<Option<GuestDirent>> {
        let reply = self.backend.invoke(OpCode::Readdir, &[Arg::Int(dir.0)])?;
        if reply.is_null() {
            return match reply.errno {
                Errno(0) => Ok(None),
                errno => Err(errno),
            };
        }
        GuestDirent::read_from(&reply.scratch)
            .map(Some)
            .ok_or(Errno::EFAULT)
    }

    pub fn chdir(&self, path: &CStr) -> LibcResult<()> {
        self.invoke_unit(OpCode::Chdir, &[path_arg(path)?])
    }

    /// Host working directory, written into `buf`
    pub fn getcwd<'b>(&self, buf: &'b mut [u8]) -> LibcResult<&'b CStr> {
        let reply = self.backend.invoke(OpCode::Getcwd, &[Arg::buf_mut(buf)?])?;
        if reply.is_null() {
            return Err(reply.errno);
        }
        CStr::from_bytes_until_nul(buf).map_err(|_| Errno::ERANGE)
    }

    pub fn rename(&self, from: &CStr, to: &CStr) -> LibcResult<()> {
        self.invoke_unit(OpCode::Rename, &[path_arg(from)?, path_arg(to)?])
    }

    pub fn mkdir(&self, path: &CStr, mode: u32) -> LibcResult<()> {
        self.invoke_unit(OpCode::Mkdir, &[path_arg(path)?, Arg::Int(Param::from(mode))])
    }

    pub fn rmdir(&self, path: &CStr) -> LibcResult<()> {
        self.invoke_unit(OpCode::Rmdir, &[path_arg(path)?])
    }

    /// Reap any child of the host process
    pub fn wait(&self) -> LibcResult<ChildExit> {
        let mut status: i32 = 0;
        let pid = self.invoke_int(OpCode::Wait, &[out_ptr(&mut status)?])?;
        Ok(ChildExit {
            pid: pid as i32,
            status,
        })
    }

    /// Start a command on a new host pseudo-terminal
    ///
    /// An empty `argv` starts an interactive shell; a single element is
    /// run through the shell; more elements are executed directly.
    ///
    /// # Errors
    /// `E2BIG` if `argv` has more than [`MAX_EXEC_ARGS`] elements.
    pub fn forkptyexec(&self, argv: &[&CStr], winsize: &GuestWinsize) -> LibcResult<PtyChild> {
        if argv.len() > MAX_EXEC_ARGS {
            return Err(Errno::E2BIG);
        }

        let mut words: [Param; MAX_EXEC_ARGS + 1] = [0; MAX_EXEC_ARGS + 1];
        for (word, arg) in words.iter_mut().zip(argv) {
            *word = match path_arg(arg)? {
                Arg::Ptr(p) => p,
                _ => return Err(Errno::EINVAL),
            };
        }

        let mut ws = *winsize;
        let mut master_fd: i32 = -1;
        let args = [
            out_ptr(&mut master_fd)?,
            out_ptr(&mut ws)?,
            Arg::ptr(words.as_ptr())?,
        ];
        let pid = self.invoke_int(OpCode::ForkPtyExec, &args)?;

        Ok(PtyChild {
            pid: pid as i32,
            master_fd,
        })
    }

    /// Run a shell command on the host and return its wait status
    pub fn system(&self, command: &CStr) -> LibcResult<i32> {
        let status = self.invoke_int(OpCode::System, &[path_arg(command)?])?;
        Ok(status as i32)
    }

    pub fn gettimeofday(&self) -> LibcResult<GuestTimeval> {
        let mut tv = GuestTimeval::default();
        self.invoke_unit(OpCode::GetTimeOfDay, &[out_ptr(&mut tv)?, Arg::NULL])?;
        Ok(tv)
    }

    pub fn isatty(&self, fd: i32) -> bool {
        (0..=2).contains(&fd)
    }

    /// Terminate the bare-metal program
    pub fn exit(&self, status: i32) -> ! {
        let mut digits = [0u8; 12];
        self.console.write_bytes(b"exit ");
        self.console.write_bytes(format_decimal(status, &mut digits));
        self.console.halt()
    }
}

fn format_decimal(value: i32, buf: &mut [u8; 12]) -> &[u8] {
    let mut n = value.unsigned_abs();
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    if value < 0 {
        pos -= 1;
        buf[pos] = b'-';
    }
    &buf[pos..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::DT_REG;
    use crate::call::SCRATCH_SIZE;
    use std::cell::RefCell;
    use std::vec::Vec;

    #[derive(Default)]
    struct TestConsole {
        out: RefCell<Vec<u8>>,
    }

    impl Console for TestConsole {
        fn write_bytes(&self, bytes: &[u8]) {
            self.out.borrow_mut().extend_from_slice(bytes);
        }

        fn halt(&self) -> ! {
            panic!("halted");
        }
    }

    type Handler = fn(OpCode, &[Arg]) -> LibcResult<CallReply>;

    /// Records every forwarded call and answers with `handler`
    struct FakeBackend {
        calls: RefCell<Vec<(OpCode, Vec<Arg>)>>,
        handler: Handler,
    }

    impl FakeBackend {
        fn new(handler: Handler) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                handler,
            }
        }
    }

    impl LibcBackend for FakeBackend {
        fn invoke(&self, op: OpCode, args: &[Arg]) -> LibcResult<CallReply> {
            self.calls.borrow_mut().push((op, args.to_vec()));
            (self.handler)(op, args)
        }
    }

    fn reply(retval: Param, errno: Errno) -> CallReply {
        CallReply {
            retval,
            errno,
            scratch: [0; SCRATCH_SIZE],
        }
    }

    fn ok_reply(_: OpCode, _: &[Arg]) -> LibcResult<CallReply> {
        Ok(reply(7, Errno(0)))
    }

    #[test]
    fn test_console_writes_stay_local() {
        let libc = GuestLibc::new(FakeBackend::new(ok_reply), TestConsole::default());

        assert_eq!(libc.write(1, b"a\nb\n"), Ok(4));
        assert_eq!(libc.write(2, b"c"), Ok(1));
        assert_eq!(&libc.console.out.borrow()[..], b"a\r\nb\r\nc");
        assert!(libc.backend().calls.borrow().is_empty());
        assert_eq!(libc.read(1, &mut [0; 4]), Err(Errno::EBADF));
    }

    #[test]
    fn test_disabled_stdout_swallows_output() {
        let libc = GuestLibc::new(Unsupported, TestConsole::default());
        libc.set_stdout_enabled(false);
        assert_eq!(libc.write(1, b"hidden"), Ok(6));
        assert!(libc.console.out.borrow().is_empty());
    }

    #[test]
    fn test_file_write_is_forwarded() {
        let libc = GuestLibc::new(FakeBackend::new(ok_reply), TestConsole::default());
        let data = b"hello";

        assert_eq!(libc.write(3, data), Ok(7));

        let calls = libc.backend().calls.borrow();
        let (op, args) = &calls[0];
        assert_eq!(*op, OpCode::Write);
        assert_eq!(args[0], Arg::Int(3));
        assert_eq!(
            args[1],
            Arg::Buf {
                ptr: data.as_ptr() as Param,
                len: 5
            }
        );
    }

    #[test]
    fn test_open_passes_guest_flag_bits() {
        let libc = GuestLibc::new(FakeBackend::new(ok_reply), TestConsole::default());
        let flags = GuestOpenFlags::WRONLY | GuestOpenFlags::CREAT | GuestOpenFlags::TRUNC;

        assert_eq!(libc.open(c"/sd/x", flags, 0o644), Ok(7));
        let calls = libc.backend().calls.borrow();
        assert_eq!(calls[0].1[1], Arg::Int(0x601));
        assert_eq!(calls[0].1[2], Arg::Int(0o644));
    }

    #[test]
    fn test_failure_carries_host_errno() {
        fn enoent(_: OpCode, _: &[Arg]) -> LibcResult<CallReply> {
            Ok(reply(Param::MAX, Errno::ENOENT))
        }
        let libc = GuestLibc::new(FakeBackend::new(enoent), TestConsole::default());
        assert_eq!(libc.unlink(c"/missing"), Err(Errno::ENOENT));
        assert_eq!(libc.stat(c"/missing"), Err(Errno::ENOENT));
    }

    #[test]
    fn test_unsupported_backend_fails_everything_remote() {
        let libc = GuestLibc::new(Unsupported, TestConsole::default());
        assert_eq!(
            libc.open(c"/sd/x", GuestOpenFlags::RDONLY, 0),
            Err(Errno::ENOTSUP)
        );
        assert_eq!(libc.opendir(c"/sd"), Err(Errno::ENOTSUP));
        assert_eq!(libc.gettimeofday(), Err(Errno::ENOTSUP));
        // Console still works.
        assert_eq!(libc.write(1, b"ok"), Ok(2));
    }

    #[test]
    fn test_stat_out_param_filled_by_host() {
        fn fill(op: OpCode, args: &[Arg]) -> LibcResult<CallReply> {
            assert_eq!(op, OpCode::Fstat);
            if let Arg::Ptr(addr) = args[1] {
                let st = GuestStat {
                    st_size: 5,
                    st_mode: crate::abi::S_IFREG | 0o644,
                    ..GuestStat::default()
                };
                unsafe { core::ptr::write(addr as usize as *mut GuestStat, st) };
            }
            Ok(reply(0, Errno(0)))
        }
        let libc = GuestLibc::new(FakeBackend::new(fill), TestConsole::default());
        let st = libc.fstat(4).unwrap();
        assert_eq!(st.st_size, 5);
        assert!(st.is_file());
    }

    #[test]
    fn test_readdir_decodes_scratch_and_end_of_stream() {
        fn entries(op: OpCode, args: &[Arg]) -> LibcResult<CallReply> {
            match (op, args[0]) {
                (OpCode::Opendir, _) => Ok(reply(1, Errno(0))),
                (OpCode::Readdir, Arg::Int(1)) => {
                    let mut r = reply(0x488f_c100, Errno(0));
                    r.scratch[0] = DT_REG;
                    r.scratch[1..6].copy_from_slice(b"a.bas");
                    Ok(r)
                }
                _ => Ok(reply(0, Errno(0))),
            }
        }
        let libc = GuestLibc::new(FakeBackend::new(entries), TestConsole::default());

        let dir = libc.opendir(c"/sd").unwrap();
        let entry = libc.readdir(&dir).unwrap().unwrap();
        assert_eq!(entry.d_type, DT_REG);
        assert_eq!(entry.name(), b"a.bas");

        let other = Dir(2);
        assert_eq!(libc.readdir(&other), Ok(None));
    }

    #[test]
    fn test_forkptyexec_argument_limit() {
        let libc = GuestLibc::new(FakeBackend::new(ok_reply), TestConsole::default());
        let argv = [c"x"; MAX_EXEC_ARGS + 1];
        assert_eq!(
            libc.forkptyexec(&argv, &GuestWinsize::default()),
            Err(Errno::E2BIG)
        );
        assert!(libc.backend().calls.borrow().is_empty());

        let child = libc
            .forkptyexec(&[c"ls", c"-l"], &GuestWinsize::default())
            .unwrap();
        assert_eq!(child.pid, 7);
    }

    #[test]
    fn test_format_decimal() {
        let mut buf = [0u8; 12];
        assert_eq!(format_decimal(0, &mut buf), b"0");
        assert_eq!(format_decimal(-42, &mut buf), b"-42");
        assert_eq!(format_decimal(i32::MIN, &mut buf), b"-2147483648");
    }
}
