use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A `signalfd(2)` with a grow-only subscription set.
///
/// Subscribed signals are blocked for the process so they are delivered
/// through the fd instead of a handler.
#[derive(Debug)]
pub(crate) struct SignalFd {
    fd: OwnedFd,
    set: libc::sigset_t,
}

impl SignalFd {
    pub(crate) fn new() -> io::Result<SignalFd> {
        // SAFETY: an all-zero sigset_t is a valid target for sigemptyset.
        let mut set: libc::sigset_t = unsafe { mem::zeroed() };
        syscall!(sigemptyset(&mut set))?;
        let raw = syscall!(signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC))?;
        // SAFETY: `signalfd(2)` returned a valid, owned fd.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(SignalFd { fd, set })
    }

    /// Adds `signo` to the subscription set, blocking it for the process.
    pub(crate) fn subscribe(&mut self, signo: libc::c_int) -> io::Result<()> {
        syscall!(sigaddset(&mut self.set, signo))?;
        syscall!(sigprocmask(libc::SIG_BLOCK, &self.set, std::ptr::null_mut()))?;
        syscall!(signalfd(
            self.fd.as_raw_fd(),
            &self.set,
            libc::SFD_NONBLOCK | libc::SFD_CLOEXEC,
        ))?;
        Ok(())
    }

    /// Reads one pending signal, `None` when the fd is drained.
    pub(crate) fn read(&self) -> Option<libc::signalfd_siginfo> {
        // SAFETY: signalfd_siginfo is plain old data; the kernel writes a
        // whole record or nothing.
        let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut info as *mut _ as *mut libc::c_void,
                mem::size_of::<libc::signalfd_siginfo>(),
            )
        };
        if n == mem::size_of::<libc::signalfd_siginfo>() as isize {
            Some(info)
        } else {
            None
        }
    }
}

impl AsRawFd for SignalFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
