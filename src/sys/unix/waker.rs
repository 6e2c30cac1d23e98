use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Wake pipe backed by `pipe2(2)`.
///
/// Holds both the sending and receiving ends and empties the pipe if
/// writing to it (waking) fails.
#[derive(Debug)]
pub(crate) struct WakePipe {
    sender: File,
    receiver: File,
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<WakePipe> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
        // SAFETY: `pipe2(2)` returned two valid, owned fds.
        let receiver = unsafe { File::from_raw_fd(fds[0]) };
        let sender = unsafe { File::from_raw_fd(fds[1]) };
        Ok(WakePipe { sender, receiver })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        match (&self.sender).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The reading end is full so we'll empty the buffer and try
                // again.
                self.empty();
                self.wake()
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    /// Empties the pipe's buffer after a wake was observed.
    pub(crate) fn drain(&self) {
        self.empty();
    }

    fn empty(&self) {
        let mut buf = [0; 4096];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}

impl AsRawFd for WakePipe {
    fn as_raw_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }
}
