//! Host operations
//!
//! [`HostOs`] is the typed surface the dispatcher calls: one method per
//! operation of the call channel, taking host-native arguments and returning
//! host-native results or the host's error number. [`LibcHost`] implements
//! it on the running Linux system through the `libc` crate.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use cell_comms::abi::{
    Errno, GuestOpenFlags, GuestWinsize, HostDirent, HostFileType, HostStat, HostTimeval,
};

pub type HostResult<T> = std::result::Result<T, Errno>;

/// Opaque directory stream id handed to the guest; never zero
pub type DirHandle = u32;

/// Directory entry copied out of the host's stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedDirent {
    pub kind: HostFileType,
    pub name: Vec<u8>,
}

impl OwnedDirent {
    pub fn as_dirent(&self) -> HostDirent<'_> {
        HostDirent {
            kind: self.kind,
            name: &self.name,
        }
    }
}

/// Operations the libc server can perform on behalf of the guest
pub trait HostOs {
    fn write(&self, fd: i32, buf: &[u8]) -> HostResult<usize>;
    fn read(&self, fd: i32, buf: &mut [u8]) -> HostResult<usize>;
    fn lseek(&self, fd: i32, offset: i64, whence: i32) -> HostResult<i64>;
    fn fstat(&self, fd: i32) -> HostResult<HostStat>;
    fn stat(&self, path: &CStr) -> HostResult<HostStat>;
    /// `flags` are already host flag bits
    fn open(&self, path: &CStr, flags: i32, mode: u32) -> HostResult<i32>;
    fn close(&self, fd: i32) -> HostResult<()>;
    fn unlink(&self, path: &CStr) -> HostResult<()>;
    fn opendir(&self, path: &CStr) -> HostResult<DirHandle>;
    fn closedir(&self, dir: DirHandle) -> HostResult<()>;
    /// `Ok(None)` at the end of the stream
    fn readdir(&self, dir: DirHandle) -> HostResult<Option<OwnedDirent>>;
    fn getcwd(&self) -> HostResult<Vec<u8>>;
    fn chdir(&self, path: &CStr) -> HostResult<()>;
    fn rename(&self, from: &CStr, to: &CStr) -> HostResult<()>;
    fn mkdir(&self, path: &CStr, mode: u32) -> HostResult<()>;
    fn rmdir(&self, path: &CStr) -> HostResult<()>;
    /// Reap a child: `(pid, wait status)`
    fn wait(&self) -> HostResult<(i32, i32)>;
    /// Start `argv` on a new pseudo-terminal: `(pid, master fd)`
    fn forkptyexec(&self, argv: &[&CStr], winsize: &GuestWinsize) -> HostResult<(i32, i32)>;
    fn system(&self, command: &CStr) -> HostResult<i32>;
    fn gettimeofday(&self) -> HostResult<HostTimeval>;
}

/// Bare-metal open flag to host open flag
const OPEN_FLAG_TABLE: [(GuestOpenFlags, libc::c_int); 12] = [
    (GuestOpenFlags::WRONLY, libc::O_WRONLY),
    (GuestOpenFlags::RDWR, libc::O_RDWR),
    (GuestOpenFlags::APPEND, libc::O_APPEND),
    (GuestOpenFlags::CREAT, libc::O_CREAT),
    (GuestOpenFlags::TRUNC, libc::O_TRUNC),
    (GuestOpenFlags::EXCL, libc::O_EXCL),
    (GuestOpenFlags::SYNC, libc::O_SYNC),
    (GuestOpenFlags::NONBLOCK, libc::O_NONBLOCK),
    (GuestOpenFlags::NOCTTY, libc::O_NOCTTY),
    (GuestOpenFlags::CLOEXEC, libc::O_CLOEXEC),
    (GuestOpenFlags::NOFOLLOW, libc::O_NOFOLLOW),
    (GuestOpenFlags::DIRECTORY, libc::O_DIRECTORY),
];

/// Translate bare-metal `open()` flags; bits without a host meaning are dropped
pub fn host_open_flags(guest: u32) -> libc::c_int {
    let guest = GuestOpenFlags::from_bits_truncate(guest);
    OPEN_FLAG_TABLE
        .iter()
        .filter(|(g, _)| guest.contains(*g))
        .fold(libc::O_RDONLY, |acc, (_, host)| acc | host)
}

fn last_errno() -> Errno {
    let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    Errno(u32::try_from(code).unwrap_or(Errno::EINVAL.code()))
}

fn cvt(rc: libc::c_int) -> HostResult<libc::c_int> {
    if rc < 0 {
        Err(last_errno())
    } else {
        Ok(rc)
    }
}

fn cvt_size(rc: libc::ssize_t) -> HostResult<usize> {
    usize::try_from(rc).map_err(|_| last_errno())
}

fn clear_errno() {
    // SAFETY: thread-local errno of the calling thread.
    unsafe { *libc::__errno_location() = 0 };
}

/// Room for a host structure the guest never sees directly
fn host_scratch<T>() -> HostResult<Vec<MaybeUninit<T>>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(1).map_err(|_| Errno::ENOMEM)?;
    buf.push(MaybeUninit::uninit());
    Ok(buf)
}

fn host_stat(st: &libc::stat) -> HostStat {
    HostStat {
        dev: st.st_dev as u64,
        ino: st.st_ino as u64,
        mode: st.st_mode as u32,
        nlink: st.st_nlink as u64,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u64,
        size: st.st_size as i64,
        mtime: st.st_mtime as i64,
    }
}

fn file_type(d_type: u8) -> HostFileType {
    match d_type {
        libc::DT_DIR => HostFileType::Directory,
        libc::DT_REG => HostFileType::Regular,
        _ => HostFileType::Other,
    }
}

struct DirStream(*mut libc::DIR);

// Streams are only touched under the table lock.
unsafe impl Send for DirStream {}

/// Environment of a shell started on a pseudo-terminal
const PTY_ENV: [(&str, &str); 3] = [("TERM", "cons25-debian"), ("LANG", "en_US.UTF-8"), ("HOME", "/sd")];

/// [`HostOs`] on the running system
pub struct LibcHost {
    dirs: Mutex<HashMap<DirHandle, DirStream>>,
    next_dir: AtomicU32,
}

impl LibcHost {
    pub fn new() -> Self {
        Self {
            dirs: Mutex::new(HashMap::new()),
            next_dir: AtomicU32::new(1),
        }
    }

    /// Directory streams currently open
    pub fn open_dirs(&self) -> usize {
        self.dirs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn alloc_handle(&self) -> DirHandle {
        loop {
            let handle = self.next_dir.fetch_add(1, Ordering::Relaxed);
            if handle != 0 {
                return handle;
            }
        }
    }

    fn stat_with(&self, f: impl FnOnce(*mut libc::stat) -> libc::c_int) -> HostResult<HostStat> {
        let mut buf = host_scratch::<libc::stat>()?;
        cvt(f(buf[0].as_mut_ptr()))?;
        // SAFETY: the call succeeded and filled the buffer.
        Ok(host_stat(unsafe { buf[0].assume_init_ref() }))
    }

    /// Environment for a pty child, built before forking
    fn pty_env() -> Vec<CString> {
        let mut env: Vec<CString> = std::env::vars_os()
            .filter(|(k, _)| {
                k != "DISPLAY" && !PTY_ENV.iter().any(|(name, _)| k == name)
            })
            .filter_map(|(k, v)| {
                let mut entry = k.into_encoded_bytes();
                entry.push(b'=');
                entry.extend_from_slice(v.as_encoded_bytes());
                CString::new(entry).ok()
            })
            .collect();
        env.extend(
            PTY_ENV
                .iter()
                .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok()),
        );
        env
    }
}

impl Default for LibcHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LibcHost {
    fn drop(&mut self) {
        let dirs = self.dirs.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, stream) in dirs.drain() {
            // SAFETY: stream came from opendir and was not closed.
            unsafe { libc::closedir(stream.0) };
        }
    }
}

impl HostOs for LibcHost {
    fn write(&self, fd: i32, buf: &[u8]) -> HostResult<usize> {
        // SAFETY: buf is a valid slice.
        cvt_size(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
    }

    fn read(&self, fd: i32, buf: &mut [u8]) -> HostResult<usize> {
        // SAFETY: buf is a valid slice.
        cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
    }

    fn lseek(&self, fd: i32, offset: i64, whence: i32) -> HostResult<i64> {
        // SAFETY: plain syscall.
        let pos = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
        if pos < 0 {
            return Err(last_errno());
        }
        Ok(pos as i64)
    }

    fn fstat(&self, fd: i32) -> HostResult<HostStat> {
        // SAFETY: the buffer is a valid `stat`.
        self.stat_with(|st| unsafe { libc::fstat(fd, st) })
    }

    fn stat(&self, path: &CStr) -> HostResult<HostStat> {
        // SAFETY: as for `fstat`; path is NUL-terminated.
        self.stat_with(|st| unsafe { libc::stat(path.as_ptr(), st) })
    }

    fn open(&self, path: &CStr, flags: i32, mode: u32) -> HostResult<i32> {
        // SAFETY: path is NUL-terminated.
        cvt(unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) })
    }

    fn close(&self, fd: i32) -> HostResult<()> {
        // SAFETY: plain syscall.
        cvt(unsafe { libc::close(fd) }).map(drop)
    }

    fn unlink(&self, path: &CStr) -> HostResult<()> {
        // SAFETY: path is NUL-terminated.
        cvt(unsafe { libc::unlink(path.as_ptr()) }).map(drop)
    }

    fn opendir(&self, path: &CStr) -> HostResult<DirHandle> {
        // SAFETY: path is NUL-terminated.
        let stream = unsafe { libc::opendir(path.as_ptr()) };
        if stream.is_null() {
            return Err(last_errno());
        }
        let handle = self.alloc_handle();
        self.dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, DirStream(stream));
        Ok(handle)
    }

    fn closedir(&self, dir: DirHandle) -> HostResult<()> {
        let stream = self
            .dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&dir)
            .ok_or(Errno::EBADF)?;
        // SAFETY: stream came from opendir and is now out of the table.
        cvt(unsafe { libc::closedir(stream.0) }).map(drop)
    }

    fn readdir(&self, dir: DirHandle) -> HostResult<Option<OwnedDirent>> {
        let dirs = self.dirs.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = dirs.get(&dir).ok_or(Errno::EBADF)?;

        clear_errno();
        // SAFETY: stream is open; the table lock serialises access.
        let entry = unsafe { libc::readdir(stream.0) };
        if entry.is_null() {
            return match last_errno() {
                Errno(0) => Ok(None),
                errno => Err(errno),
            };
        }

        // SAFETY: readdir returned a valid entry that lives until the next
        // call on this stream, which the lock prevents.
        let entry = unsafe { &*entry };
        let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) };
        Ok(Some(OwnedDirent {
            kind: file_type(entry.d_type),
            name: name.to_bytes().to_vec(),
        }))
    }

    fn getcwd(&self) -> HostResult<Vec<u8>> {
        std::env::current_dir()
            .map(|p| p.into_os_string().into_encoded_bytes())
            .map_err(|e| e.raw_os_error().map_or(Errno::ENOENT, |c| Errno(c as u32)))
    }

    fn chdir(&self, path: &CStr) -> HostResult<()> {
        // SAFETY: path is NUL-terminated.
        cvt(unsafe { libc::chdir(path.as_ptr()) }).map(drop)
    }

    fn rename(&self, from: &CStr, to: &CStr) -> HostResult<()> {
        // SAFETY: both paths are NUL-terminated.
        cvt(unsafe { libc::rename(from.as_ptr(), to.as_ptr()) }).map(drop)
    }

    fn mkdir(&self, path: &CStr, mode: u32) -> HostResult<()> {
        // SAFETY: path is NUL-terminated.
        cvt(unsafe { libc::mkdir(path.as_ptr(), mode as libc::mode_t) }).map(drop)
    }

    fn rmdir(&self, path: &CStr) -> HostResult<()> {
        // SAFETY: path is NUL-terminated.
        cvt(unsafe { libc::rmdir(path.as_ptr()) }).map(drop)
    }

    fn wait(&self) -> HostResult<(i32, i32)> {
        let mut status = 0;
        // SAFETY: status is a valid out pointer.
        let pid = cvt(unsafe { libc::wait(&mut status) })?;
        Ok((pid, status))
    }

    fn forkptyexec(&self, argv: &[&CStr], winsize: &GuestWinsize) -> HostResult<(i32, i32)> {
        // Everything the child needs is prepared before the fork.
        let env = Self::pty_env();
        let mut envp: Vec<*const libc::c_char> = env.iter().map(|e| e.as_ptr()).collect();
        envp.push(std::ptr::null());

        let shell = c"/bin/sh";
        let mut args: Vec<*const libc::c_char> = match argv {
            [] => vec![c"sh".as_ptr()],
            [command] => vec![c"sh".as_ptr(), c"-c".as_ptr(), command.as_ptr()],
            _ => argv.iter().map(|a| a.as_ptr()).collect(),
        };
        args.push(std::ptr::null());
        let program = if argv.len() > 1 { argv[0] } else { shell };

        let mut ws = libc::winsize {
            ws_row: winsize.ws_row,
            ws_col: winsize.ws_col,
            ws_xpixel: winsize.ws_xpixel,
            ws_ypixel: winsize.ws_ypixel,
        };
        let mut master: libc::c_int = -1;

        // SAFETY: all pointers outlive the call; the child only calls
        // async-signal-safe functions before exec.
        let pid = unsafe {
            libc::forkpty(&mut master, std::ptr::null_mut(), std::ptr::null_mut(), &mut ws)
        };
        if pid < 0 {
            return Err(last_errno());
        }

        if pid == 0 {
            // SAFETY: child process; exec or exit.
            unsafe {
                for sig in 1..=libc::SIGRTMAX() {
                    if sig != libc::SIGKILL && sig != libc::SIGSTOP {
                        libc::signal(sig, libc::SIG_DFL);
                    }
                }
                libc::execvpe(program.as_ptr(), args.as_ptr(), envp.as_ptr());
                libc::_exit(1);
            }
        }

        // SAFETY: master is the pty fd forkpty returned.
        unsafe {
            let flags = libc::fcntl(master, libc::F_GETFL);
            libc::fcntl(master, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        log::info!("started pty child {pid} on fd {master}");
        Ok((pid, master))
    }

    fn system(&self, command: &CStr) -> HostResult<i32> {
        // SAFETY: command is NUL-terminated.
        cvt(unsafe { libc::system(command.as_ptr()) })
    }

    fn gettimeofday(&self) -> HostResult<HostTimeval> {
        let mut tv = host_scratch::<libc::timeval>()?;
        // SAFETY: valid out pointer; no timezone requested.
        cvt(unsafe { libc::gettimeofday(tv[0].as_mut_ptr(), std::ptr::null_mut()) })?;
        // SAFETY: filled by the successful call.
        let tv = unsafe { tv[0].assume_init_ref() };
        Ok(HostTimeval {
            sec: tv.tv_sec as i64,
            usec: tv.tv_usec as i64,
        })
    }
}
