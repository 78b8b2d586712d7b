//! Call dispatch
//!
//! Turns one dequeued call into a host operation: decode the argument words
//! by the operation's signature, resolve guest pointers, translate flags,
//! run the typed host call and translate its result back into the guest's
//! structures.
//!
//! Result conventions seen by the guest:
//! - integer calls return the value, or all-ones (`-1`) with `errno` set
//! - pointer calls (`opendir`, `readdir`, `getcwd`) return zero on failure
//! - `readdir` returns the guest address of the slot's scratch area, which
//!   holds the translated entry; zero with `errno == 0` ends the stream

use std::ffi::CStr;
use std::mem::size_of;

use cell_comms::abi::{Errno, GuestDirent, GuestStat, GuestTimeval, GuestWinsize, WireStruct};
use cell_comms::call::{decode_args, DecodedArgs, Param, SignedParam, ARG_COUNT, SCRATCH_SIZE};
use cell_comms::guest_libc::MAX_EXEC_ARGS;
use cell_comms::OpCode;

use crate::guest_mem::GuestMemory;
use crate::host::{host_open_flags, HostOs, HostResult};

/// Return word of a failed integer call
pub const FAILED: Param = Param::MAX;

/// Result fields of one completed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub retval: Param,
    pub errno: Errno,
}

impl Completion {
    pub fn ok(retval: Param) -> Self {
        Self {
            retval,
            errno: Errno(0),
        }
    }

    pub fn failed(op: Option<OpCode>, errno: Errno) -> Self {
        let retval = match op {
            Some(op) if returns_pointer(op) => 0,
            _ => FAILED,
        };
        Self { retval, errno }
    }
}

/// Per-call scratch area and the address the guest sees it at
pub struct Scratch<'a> {
    pub bytes: &'a mut [u8; SCRATCH_SIZE],
    pub guest_addr: Param,
}

pub fn returns_pointer(op: OpCode) -> bool {
    matches!(op, OpCode::Opendir | OpCode::Readdir | OpCode::Getcwd)
}

fn fd(word: Param) -> i32 {
    word as SignedParam as i32
}

fn signed(value: i64) -> Param {
    value as SignedParam as Param
}

fn len(word: Param) -> HostResult<usize> {
    usize::try_from(word).map_err(|_| Errno::EINVAL)
}

/// Execute one call
///
/// Never fails: every error becomes a [`Completion`] carrying the error
/// number, including an unknown operation id (`ENOSYS`).
pub fn dispatch<H, M>(
    host: &H,
    mem: &M,
    op_raw: u32,
    words: &[Param; ARG_COUNT],
    scratch: Scratch<'_>,
) -> Completion
where
    H: HostOs + ?Sized,
    M: GuestMemory + ?Sized,
{
    let Some(op) = OpCode::from_raw(op_raw) else {
        log::warn!("unknown libc call {op_raw}");
        return Completion::failed(None, Errno::ENOSYS);
    };

    let args = decode_args(op, words);
    match run(op, &args, host, mem, scratch) {
        Ok(retval) => Completion::ok(retval),
        Err(errno) => Completion::failed(Some(op), errno),
    }
}

fn run<H, M>(
    op: OpCode,
    args: &DecodedArgs,
    host: &H,
    mem: &M,
    scratch: Scratch<'_>,
) -> HostResult<Param>
where
    H: HostOs + ?Sized,
    M: GuestMemory + ?Sized,
{
    let path = |i: usize| mem.cstr(args.word(i));

    match op {
        OpCode::Write => {
            let (ptr, n) = args.buf(1);
            let data = mem.bytes(ptr, len(n)?)?;
            Ok(host.write(fd(args.word(0)), data)? as Param)
        }
        OpCode::Read => {
            let (ptr, n) = args.buf(1);
            let data = mem.bytes_mut(ptr, len(n)?)?;
            Ok(host.read(fd(args.word(0)), data)? as Param)
        }
        OpCode::Lseek => {
            let offset = args.word(1) as SignedParam as i64;
            let pos = host.lseek(fd(args.word(0)), offset, fd(args.word(2)))?;
            Ok(signed(pos))
        }
        OpCode::Fstat => {
            let st = host.fstat(fd(args.word(0)))?;
            mem.write_struct(args.word(1), &GuestStat::from_host(&st))?;
            Ok(0)
        }
        OpCode::Stat => {
            let st = host.stat(path(0)?)?;
            mem.write_struct(args.word(1), &GuestStat::from_host(&st))?;
            Ok(0)
        }
        OpCode::Open => {
            let flags = host_open_flags(args.word(1) as u32);
            let fd = host.open(path(0)?, flags, args.word(2) as u32)?;
            Ok(signed(i64::from(fd)))
        }
        OpCode::Close => host.close(fd(args.word(0))).map(|()| 0),
        OpCode::Unlink => host.unlink(path(0)?).map(|()| 0),
        OpCode::Opendir => host.opendir(path(0)?).map(Param::from),
        OpCode::Closedir => {
            let handle = u32::try_from(args.word(0)).map_err(|_| Errno::EBADF)?;
            host.closedir(handle).map(|()| 0)
        }
        OpCode::Readdir => {
            let handle = u32::try_from(args.word(0)).map_err(|_| Errno::EBADF)?;
            match host.readdir(handle)? {
                Some(entry) => {
                    let dirent = GuestDirent::from_host(&entry.as_dirent());
                    scratch.bytes[..size_of::<GuestDirent>()].copy_from_slice(dirent.as_bytes());
                    Ok(scratch.guest_addr)
                }
                None => Ok(0),
            }
        }
        OpCode::Chdir => host.chdir(path(0)?).map(|()| 0),
        OpCode::Getcwd => {
            let (ptr, n) = args.buf(0);
            let cwd = host.getcwd()?;
            if cwd.len() + 1 > len(n)? {
                return Err(Errno::ERANGE);
            }
            let out = mem.bytes_mut(ptr, cwd.len() + 1)?;
            out[..cwd.len()].copy_from_slice(&cwd);
            out[cwd.len()] = 0;
            Ok(ptr)
        }
        OpCode::Rename => host.rename(path(0)?, path(1)?).map(|()| 0),
        OpCode::Mkdir => host.mkdir(path(0)?, args.word(1) as u32).map(|()| 0),
        OpCode::Rmdir => host.rmdir(path(0)?).map(|()| 0),
        OpCode::Wait => {
            // Checked before reaping, or the exit status would be lost.
            if args.word(0) != 0 {
                mem.range(args.word(0), size_of::<i32>())?;
            }
            let (pid, status) = host.wait()?;
            if args.word(0) != 0 {
                mem.write_i32(args.word(0), status)?;
            }
            Ok(signed(i64::from(pid)))
        }
        OpCode::ForkPtyExec => {
            // A bad master fd pointer must fail before a child exists.
            mem.range(args.word(0), size_of::<i32>())?;
            let winsize = match args.word(1) {
                0 => GuestWinsize::default(),
                ptr => GuestWinsize::read_from(mem.bytes(ptr, size_of::<GuestWinsize>())?)
                    .ok_or(Errno::EFAULT)?,
            };
            let argv = mem
                .pointer_array(args.word(2), MAX_EXEC_ARGS)?
                .into_iter()
                .map(|p| mem.cstr(p))
                .collect::<HostResult<Vec<_>>>()?;

            let (pid, master) = host.forkptyexec(&argv, &winsize)?;
            mem.write_i32(args.word(0), master)?;
            Ok(signed(i64::from(pid)))
        }
        OpCode::System => {
            let status = host.system(path(0)?)?;
            Ok(signed(i64::from(status)))
        }
        OpCode::GetTimeOfDay => {
            let tv = host.gettimeofday()?;
            mem.write_struct(args.word(0), &GuestTimeval::from_host(&tv))?;
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_mem::IdentityMemory;
    use crate::host::{DirHandle, OwnedDirent};
    use cell_comms::abi::{HostFileType, HostStat, HostTimeval, DT_DIR};
    use cell_comms::call::encode_args;
    use cell_comms::Arg;
    use std::cell::RefCell;

    /// Host double recording the last call's arguments
    #[derive(Default)]
    struct FakeHost {
        log: RefCell<Vec<String>>,
        entries: RefCell<Vec<OwnedDirent>>,
    }

    impl FakeHost {
        fn record(&self, entry: String) {
            self.log.borrow_mut().push(entry);
        }
    }

    impl HostOs for FakeHost {
        fn write(&self, fd: i32, buf: &[u8]) -> HostResult<usize> {
            self.record(format!("write {fd} {}", String::from_utf8_lossy(buf)));
            Ok(buf.len())
        }
        fn read(&self, _fd: i32, buf: &mut [u8]) -> HostResult<usize> {
            buf[..2].copy_from_slice(b"hi");
            Ok(2)
        }
        fn lseek(&self, _fd: i32, offset: i64, _whence: i32) -> HostResult<i64> {
            Ok(offset)
        }
        fn fstat(&self, fd: i32) -> HostResult<HostStat> {
            if fd < 0 {
                return Err(Errno::EBADF);
            }
            Ok(HostStat {
                size: 70_000,
                mode: 0o100_644,
                ..HostStat::default()
            })
        }
        fn stat(&self, path: &CStr) -> HostResult<HostStat> {
            self.record(format!("stat {}", path.to_string_lossy()));
            Err(Errno::ENOENT)
        }
        fn open(&self, path: &CStr, flags: i32, mode: u32) -> HostResult<i32> {
            self.record(format!("open {} {flags:#x} {mode:o}", path.to_string_lossy()));
            Ok(5)
        }
        fn close(&self, _fd: i32) -> HostResult<()> {
            Ok(())
        }
        fn unlink(&self, _path: &CStr) -> HostResult<()> {
            Ok(())
        }
        fn opendir(&self, _path: &CStr) -> HostResult<DirHandle> {
            Ok(3)
        }
        fn closedir(&self, _dir: DirHandle) -> HostResult<()> {
            Ok(())
        }
        fn readdir(&self, _dir: DirHandle) -> HostResult<Option<OwnedDirent>> {
            Ok(self.entries.borrow_mut().pop())
        }
        fn getcwd(&self) -> HostResult<Vec<u8>> {
            Ok(b"/sd/work".to_vec())
        }
        fn chdir(&self, _path: &CStr) -> HostResult<()> {
            Ok(())
        }
        fn rename(&self, _from: &CStr, _to: &CStr) -> HostResult<()> {
            Ok(())
        }
        fn mkdir(&self, _path: &CStr, _mode: u32) -> HostResult<()> {
            Ok(())
        }
        fn rmdir(&self, _path: &CStr) -> HostResult<()> {
            Ok(())
        }
        fn wait(&self) -> HostResult<(i32, i32)> {
            Ok((42, 0x100))
        }
        fn forkptyexec(&self, argv: &[&CStr], winsize: &GuestWinsize) -> HostResult<(i32, i32)> {
            let args: Vec<_> = argv.iter().map(|a| a.to_string_lossy().into_owned()).collect();
            self.record(format!("pty {} {}x{}", args.join(","), winsize.ws_col, winsize.ws_row));
            Ok((77, 9))
        }
        fn system(&self, _command: &CStr) -> HostResult<i32> {
            Ok(0)
        }
        fn gettimeofday(&self) -> HostResult<HostTimeval> {
            Ok(HostTimeval {
                sec: 1_700_000_000,
                usec: 250,
            })
        }
    }

    struct Call {
        scratch: [u8; SCRATCH_SIZE],
    }

    impl Call {
        fn new() -> Self {
            Self {
                scratch: [0; SCRATCH_SIZE],
            }
        }

        fn run(&mut self, host: &FakeHost, op: u32, args: &[Arg]) -> Completion {
            let words = encode_args(args).unwrap();
            let guest_addr = self.scratch.as_ptr() as Param;
            let scratch = Scratch {
                bytes: &mut self.scratch,
                guest_addr,
            };
            dispatch(host, &IdentityMemory, op, &words, scratch)
        }
    }

    #[test]
    fn test_unknown_op_is_enosys() {
        let host = FakeHost::default();
        let done = Call::new().run(&host, 20, &[]);
        assert_eq!(done, Completion::failed(None, Errno::ENOSYS));
        assert_eq!(done.retval, FAILED);
    }

    #[test]
    fn test_write_reads_guest_buffer() {
        let host = FakeHost::default();
        let data = b"HELLO";
        let done = Call::new().run(
            &host,
            OpCode::Write.raw(),
            &[Arg::Int(4), Arg::buf(data).unwrap()],
        );
        assert_eq!(done, Completion::ok(5));
        assert_eq!(host.log.borrow()[0], "write 4 HELLO");
    }

    #[test]
    fn test_open_translates_flags() {
        let host = FakeHost::default();
        let path = c"/sd/out.txt";
        // WRONLY | CREAT | TRUNC with bare-metal bit positions
        let done = Call::new().run(
            &host,
            OpCode::Open.raw(),
            &[Arg::ptr(path.as_ptr()).unwrap(), Arg::Int(0x601), Arg::Int(0o644)],
        );
        assert_eq!(done, Completion::ok(5));
        let expected = libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC;
        assert_eq!(host.log.borrow()[0], format!("open /sd/out.txt {expected:#x} 644"));
    }

    #[test]
    fn test_fstat_translates_into_guest_struct() {
        let host = FakeHost::default();
        let mut st = GuestStat::default();
        let done = Call::new().run(
            &host,
            OpCode::Fstat.raw(),
            &[Arg::Int(3), Arg::ptr(&mut st as *mut GuestStat as *const GuestStat).unwrap()],
        );
        assert_eq!(done, Completion::ok(0));
        assert_eq!(st.st_size, 70_000);
        assert!(st.is_file());
    }

    #[test]
    fn test_failed_stat_leaves_guest_struct() {
        let host = FakeHost::default();
        let mut st = GuestStat {
            st_size: -7,
            ..GuestStat::default()
        };
        let done = Call::new().run(
            &host,
            OpCode::Stat.raw(),
            &[
                Arg::ptr(c"/missing".as_ptr()).unwrap(),
                Arg::ptr(&mut st as *mut GuestStat as *const GuestStat).unwrap(),
            ],
        );
        assert_eq!(done.errno, Errno::ENOENT);
        assert_eq!(done.retval as SignedParam, -1);
        assert_eq!(st.st_size, -7);
    }

    #[test]
    fn test_readdir_redirects_to_scratch() {
        let host = FakeHost::default();
        host.entries.borrow_mut().push(OwnedDirent {
            kind: HostFileType::Directory,
            name: b"games".to_vec(),
        });

        let mut call = Call::new();
        let done = call.run(&host, OpCode::Readdir.raw(), &[Arg::Int(3)]);
        assert_eq!(done.retval, call.scratch.as_ptr() as Param);
        let dirent = GuestDirent::read_from(&call.scratch).unwrap();
        assert_eq!(dirent.d_type, DT_DIR);
        assert_eq!(dirent.name(), b"games");

        // End of stream: null with errno 0.
        let done = call.run(&host, OpCode::Readdir.raw(), &[Arg::Int(3)]);
        assert_eq!(done, Completion::ok(0));
    }

    #[test]
    fn test_bad_pointer_is_efault() {
        let host = FakeHost::default();
        let done = Call::new().run(&host, OpCode::Unlink.raw(), &[Arg::NULL]);
        assert_eq!(done.errno, Errno::EFAULT);

        let done = Call::new().run(&host, OpCode::Opendir.raw(), &[Arg::NULL]);
        assert_eq!(done, Completion::failed(Some(OpCode::Opendir), Errno::EFAULT));
        assert_eq!(done.retval, 0);
    }

    #[test]
    fn test_getcwd_range_check() {
        let host = FakeHost::default();
        let mut small = [0u8; 4];
        let done = Call::new().run(&host, OpCode::Getcwd.raw(), &[Arg::buf_mut(&mut small).unwrap()]);
        assert_eq!(done.errno, Errno::ERANGE);
        assert_eq!(done.retval, 0);

        let mut buf = [0xffu8; 32];
        let done = Call::new().run(&host, OpCode::Getcwd.raw(), &[Arg::buf_mut(&mut buf).unwrap()]);
        assert_eq!(done.retval, buf.as_ptr() as Param);
        assert_eq!(&buf[..9], b"/sd/work\0");
    }

    #[test]
    fn test_gettimeofday_and_wait_out_params() {
        let host = FakeHost::default();
        let mut tv = GuestTimeval::default();
        let done = Call::new().run(
            &host,
            OpCode::GetTimeOfDay.raw(),
            &[Arg::ptr(&mut tv as *mut GuestTimeval as *const GuestTimeval).unwrap(), Arg::Int(0)],
        );
        assert_eq!(done, Completion::ok(0));
        assert_eq!(tv.tv_sec, 1_700_000_000);
        assert_eq!(tv.tv_usec, 250);

        let mut status = 0i32;
        let done = Call::new().run(
            &host,
            OpCode::Wait.raw(),
            &[Arg::ptr(&mut status as *mut i32 as *const i32).unwrap()],
        );
        assert_eq!(done, Completion::ok(42));
        assert_eq!(status, 0x100);
    }

    #[test]
    fn test_forkptyexec_reads_argv_and_winsize() {
        let host = FakeHost::default();
        let argv: [Param; 3] = [c"ls".as_ptr() as Param, c"-l".as_ptr() as Param, 0];
        let ws = GuestWinsize {
            ws_row: 25,
            ws_col: 80,
            ..GuestWinsize::default()
        };
        let mut master = -1i32;

        let done = Call::new().run(
            &host,
            OpCode::ForkPtyExec.raw(),
            &[
                Arg::ptr(&mut master as *mut i32 as *const i32).unwrap(),
                Arg::ptr(&ws as *const GuestWinsize).unwrap(),
                Arg::ptr(argv.as_ptr()).unwrap(),
            ],
        );
        assert_eq!(done, Completion::ok(77));
        assert_eq!(master, 9);
        assert_eq!(host.log.borrow()[0], "pty ls,-l 80x25");
    }

    #[test]
    fn test_forkptyexec_bad_master_pointer_spawns_nothing() {
        let host = FakeHost::default();
        let argv: [Param; 2] = [c"ls".as_ptr() as Param, 0];

        let done = Call::new().run(
            &host,
            OpCode::ForkPtyExec.raw(),
            &[Arg::NULL, Arg::NULL, Arg::ptr(argv.as_ptr()).unwrap()],
        );
        assert_eq!(done, Completion::failed(Some(OpCode::ForkPtyExec), Errno::EFAULT));
        assert!(host.log.borrow().is_empty());
    }
}
