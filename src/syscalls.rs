//! The OS boundary: raw system calls the runtime issues on its own behalf
//! (never routed through the target's C runtime, so they can't be
//! intercepted or observed by the instrumented program itself).
//!
//! Calls `nix`/`libc` (ptrace, waitpid, mmap) directly rather than going
//! through a libc wrapper that might itself get instrumented.

use crate::error::{DbiError, DbiResult};
use libc::pid_t;
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::ptr;

/// mmap a fresh, anonymous region for the code cache arena or a per-thread
/// runtime stack. Returns the mapped base address.
pub fn map_anonymous(len: usize, prot: ProtFlags) -> DbiResult<u64> {
    let addr = unsafe {
        nix::sys::mman::mmap(
            ptr::null_mut(),
            len,
            prot,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0,
        )
    }
    .map_err(DbiError::Os)?;
    Ok(addr as u64)
}

pub fn protect(addr: u64, len: usize, prot: ProtFlags) -> DbiResult<()> {
    unsafe { nix::sys::mman::mprotect(addr as *mut libc::c_void, len, prot) }.map_err(DbiError::Os)?;
    Ok(())
}

pub fn unmap(addr: u64, len: usize) -> DbiResult<()> {
    unsafe { nix::sys::mman::munmap(addr as *mut libc::c_void, len) }.map_err(DbiError::Os)?;
    Ok(())
}

/// Attach path: seize control of an already-running thread via ptrace,
/// without the `PTRACE_TRACEME`/exec dance the preload path uses.
pub fn attach(tid: pid_t) -> DbiResult<()> {
    ptrace::attach(Pid::from_raw(tid)).map_err(DbiError::Os)?;
    match waitpid(Pid::from_raw(tid), Some(WaitPidFlag::WSTOPPED)) {
        Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => Ok(()),
        Ok(_) => Ok(()),
        Err(e) => Err(DbiError::Os(e)),
    }
}

/// Detach path: hand the thread back to run natively.
pub fn detach(tid: pid_t) -> DbiResult<()> {
    ptrace::detach(Pid::from_raw(tid), None).map_err(DbiError::Os)?;
    Ok(())
}

/// Suspend an attached thread at an arbitrary point (thread registry's
/// synch-all uses the in-process suspend-point protocol instead when
/// available; this is the fallback for attach-mode threads the runtime
/// doesn't share an address space suspension point with yet).
pub fn suspend(tid: pid_t) -> DbiResult<()> {
    nix::sys::signal::kill(Pid::from_raw(tid), Signal::SIGSTOP).map_err(DbiError::Os)?;
    Ok(())
}

pub fn resume(tid: pid_t) -> DbiResult<()> {
    nix::sys::signal::kill(Pid::from_raw(tid), Signal::SIGCONT).map_err(DbiError::Os)?;
    Ok(())
}

/// Duplicate the calling thread's process, for the fork entry mode. The
/// child must reinitialize its own cache and thread registry exactly once
/// before resuming; the caller distinguishes parent/child on the return
/// value exactly as raw `fork(2)` does.
pub fn fork() -> DbiResult<ForkResult> {
    match unsafe { nix::unistd::fork() }.map_err(DbiError::Os)? {
        nix::unistd::ForkResult::Parent { child } => Ok(ForkResult::Parent { child: child.as_raw() }),
        nix::unistd::ForkResult::Child => Ok(ForkResult::Child),
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ForkResult {
    Parent { child: pid_t },
    Child,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_protect_unmap_round_trip() {
        let len = 4096;
        let addr = map_anonymous(len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE).unwrap();
        assert_ne!(addr, 0);
        protect(addr, len, ProtFlags::PROT_READ).unwrap();
        unmap(addr, len).unwrap();
    }
}
