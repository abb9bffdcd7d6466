//! Self-pipe waker (§4.2): the classic async-signal-safe bridge between a
//! trap handler and the synchronous master loop.
//!
//! Rust signal handlers installed through `nix::sys::signal` are plain
//! `extern "C" fn` trap handlers — they cannot safely allocate, lock, or
//! touch most of `std`. The only thing they may do here is `write(2)` a
//! single byte to the pipe's write end. Everything involving the read end —
//! draining, blocking with a timeout — happens on the master thread after
//! `wait()` returns, never inside a handler.

// Layer 1: Standard library imports
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

// Layer 2: Third-party crate imports
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{pipe, read, write};

// Layer 3: Internal module imports
use crate::error::{ForemanError, ForemanResult};

/// Owns the read/write ends of the wakeup pipe. Master-private: forked
/// children never touch it directly (close-on-exec handles the worst case
/// of a child that goes on to `exec`; children that don't exec close both
/// ends explicitly during prefork cleanup, see `worker::fork_child`).
#[derive(Debug)]
pub struct SelfPipe {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
}

impl SelfPipe {
    /// Create a new self-pipe, setting close-on-exec on both ends and
    /// non-blocking mode on the write end (§4.2).
    pub fn init() -> ForemanResult<Self> {
        let (read_fd, write_fd) =
            pipe().map_err(|e| ForemanError::self_pipe_init(format!("pipe(): {e}")))?;

        set_cloexec(&read_fd).map_err(|e| ForemanError::self_pipe_init(e.to_string()))?;
        set_cloexec(&write_fd).map_err(|e| ForemanError::self_pipe_init(e.to_string()))?;
        set_nonblocking(&write_fd).map_err(|e| ForemanError::self_pipe_init(e.to_string()))?;

        Ok(Self { read_fd, write_fd })
    }

    /// Raw fd of the write end, for the signal-safe byte-write helper that
    /// signal handlers call directly (see `signals::write_wake_byte`).
    pub fn write_fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.write_fd.as_raw_fd()
    }

    /// Write a single wakeup byte, non-blocking. `EAGAIN`/`EWOULDBLOCK` and
    /// `EINTR` are benign — either the pipe is already full (the master is
    /// about to wake anyway) or the write was interrupted and can be
    /// skipped, since the goal is only to guarantee at least one wakeup.
    pub fn wake(&self) {
        let _ = write(self.write_fd.as_fd(), &[0u8]);
    }

    /// Block on readability of the read end for up to `timeout`. On wake,
    /// drains every currently available byte without blocking, so a burst of
    /// wakeups during one iteration collapses to a single return.
    pub fn wait(&self, timeout: Duration) -> ForemanResult<bool> {
        let mut fds = [PollFd::new(self.read_fd.as_fd(), PollFlags::POLLIN)];
        let timeout_ms: i32 = timeout.as_millis().min(i32::MAX as u128) as i32;

        let ready = match poll(&mut fds, PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::NONE)) {
            Ok(n) => n > 0,
            Err(Errno::EINTR) => false,
            Err(e) => {
                return Err(ForemanError::self_pipe_init(format!("poll(): {e}")));
            }
        };

        if ready {
            self.drain();
        }

        Ok(ready)
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match read(self.read_fd.as_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(Errno::EAGAIN) | Err(Errno::EWOULDBLOCK) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        // OwnedFd closes on drop; nothing to do, but documented here since
        // §4.2 calls out "closing old descriptors best-effort" on re-init.
    }
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), Errno> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFD)?;
    let mut flags = FdFlag::from_bits_truncate(flags);
    flags.insert(FdFlag::FD_CLOEXEC);
    fcntl(fd.as_fd(), FcntlArg::F_SETFD(flags))?;
    Ok(())
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), Errno> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Async-signal-safe raw write of one byte to `fd`. Used directly by signal
/// handlers (never through `SelfPipe::wake`, which borrows `self` and is not
/// guaranteed callable from a trap context).
pub fn write_wake_byte(fd: RawFd, byte: u8) {
    // SAFETY: `fd` is the self-pipe's write end, kept alive for the process
    // lifetime; `write(2)` itself is async-signal-safe per signal-safety(7).
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let _ = write(borrowed, &[byte]);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code: unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn wake_then_wait_returns_promptly() {
        let pipe = SelfPipe::init().unwrap();
        pipe.wake();
        let woke = pipe.wait(Duration::from_secs(1)).unwrap();
        assert!(woke);
    }

    #[test]
    fn wait_times_out_without_a_wake() {
        let pipe = SelfPipe::init().unwrap();
        let woke = pipe.wait(Duration::from_millis(50)).unwrap();
        assert!(!woke);
    }

    #[test]
    fn multiple_wakes_drain_to_a_single_wakeup() {
        let pipe = SelfPipe::init().unwrap();
        for _ in 0..8 {
            pipe.wake();
        }
        assert!(pipe.wait(Duration::from_secs(1)).unwrap());
        // The drain inside `wait` should have consumed everything already
        // buffered; a fresh wait with no further wake should time out.
        assert!(!pipe.wait(Duration::from_millis(50)).unwrap());
    }

    #[test]
    fn write_wake_byte_is_observable_through_wait() {
        let pipe = SelfPipe::init().unwrap();
        write_wake_byte(pipe.write_fd(), 1);
        assert!(pipe.wait(Duration::from_secs(1)).unwrap());
    }
}
