//! Thin safe wrappers over the raw syscalls the executor issues.
//!
//! The fuzzer needs the exact syscall surface (descriptor-relative `*at`
//! calls, raw descriptors it can keep across remount boundaries, errno
//! preserved verbatim for cross-side comparison), so these go through
//! `libc` directly and surface failures as `io::Error::last_os_error()`.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use fsdrift_core::Whence;

fn cstring(path: &Path) -> io::Result<CString> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

fn cstring_str(path: &str) -> io::Result<CString> {
    Ok(CString::new(path)?)
}

pub fn open(path: &Path, flags: i32, mode: u32) -> io::Result<RawFd> {
    let c = cstring(path)?;
    let fd = unsafe { libc::open(c.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub fn openat(dirfd: RawFd, path: &str, flags: i32, mode: u32) -> io::Result<RawFd> {
    let c = cstring_str(path)?;
    let fd = unsafe { libc::openat(dirfd, c.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub fn close(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::close(fd) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn lseek(fd: RawFd, offset: i64, whence: Whence) -> io::Result<i64> {
    let raw = match whence {
        Whence::Start => libc::SEEK_SET,
        Whence::Current => libc::SEEK_CUR,
        Whence::End => libc::SEEK_END,
    };
    let off = unsafe { libc::lseek(fd, offset, raw) };
    if off < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(off)
}

pub fn ftruncate(fd: RawFd, len: i64) -> io::Result<()> {
    if unsafe { libc::ftruncate(fd, len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn truncate(path: &Path, len: i64) -> io::Result<()> {
    let c = cstring(path)?;
    if unsafe { libc::truncate(c.as_ptr(), len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn mkdirat(dirfd: RawFd, path: &str, mode: u32) -> io::Result<()> {
    let c = cstring_str(path)?;
    if unsafe { libc::mkdirat(dirfd, c.as_ptr(), mode as libc::mode_t) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn unlinkat(dirfd: RawFd, path: &str, flags: i32) -> io::Result<()> {
    let c = cstring_str(path)?;
    if unsafe { libc::unlinkat(dirfd, c.as_ptr(), flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Flags for opening a directory handle used as a cwd for `*at` calls.
pub fn cwd_open_flags() -> i32 {
    libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC
}
