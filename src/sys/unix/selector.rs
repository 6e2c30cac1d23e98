use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{EPOLLET, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::reactor::{Interest, Readiness, Token};

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout,
                // unless the caller explicitly requests that by specifying a
                // zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout,
        ))
        .map(|n_events| {
            // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
            unsafe { events.set_len(n_events as usize) };
            n_events as usize
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())).map(|_| ())
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    let mut kind = EPOLLET;

    if interests.is_readable() {
        kind = kind | EPOLLIN | EPOLLRDHUP;
    }

    if interests.is_writable() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

pub(crate) fn readiness_from_epoll(events: u32) -> Readiness {
    let events = events as libc::c_int;
    let mut readiness = Readiness::EMPTY;

    if events & libc::EPOLLIN != 0 || events & libc::EPOLLPRI != 0 {
        readiness = readiness.with(Readiness::READABLE);
    }
    if events & libc::EPOLLOUT != 0 {
        readiness = readiness.with(Readiness::WRITABLE);
    }
    // Both halves closed, or the read half saw FIN.
    if events & libc::EPOLLHUP != 0
        || (events & libc::EPOLLIN != 0 && events & libc::EPOLLRDHUP != 0)
    {
        readiness = readiness.with(Readiness::READ_CLOSED);
    }
    if events & libc::EPOLLHUP != 0
        || (events & libc::EPOLLOUT != 0 && events & libc::EPOLLERR != 0)
        || events == libc::EPOLLERR
    {
        readiness = readiness.with(Readiness::WRITE_CLOSED);
    }
    if events & libc::EPOLLERR != 0 {
        readiness = readiness.with(Readiness::ERROR);
    }

    readiness
}
