use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Pipe used purely as an edge-triggered "primary client has exited" signal.
///
/// Nothing is ever written to it. The write end is inherited by the child
/// alone; when the child exits for any reason the kernel closes its last
/// copy, the read end reports hangup, and the session loop wakes. Both ends
/// are created close-on-exec so no other exec can leak them; the child
/// branch re-enables inheritance on its own copy of the write end, so the
/// exec passes exactly one extra descriptor to the client.
#[derive(Debug)]
pub struct DeathPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl DeathPipe {
    /// Create the pipe with both ends atomically flagged close-on-exec.
    pub fn create() -> nix::Result<Self> {
        let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC)?;
        Ok(DeathPipe { read, write })
    }

    /// Descriptor number the write end occupies, as a child will inherit it.
    pub fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Descriptor number of the read end.
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Take the child's side of the pipe between fork and exec.
    ///
    /// Closes the read end (the child never reads) and clears close-on-exec
    /// on the write end so exactly that one descriptor survives into the new
    /// image. Only async-signal-safe calls. The returned fd must be kept
    /// alive until the exec.
    pub(crate) fn into_child(self) -> OwnedFd {
        let DeathPipe { read, write } = self;
        drop(read);
        if let Ok(flags) = fcntl(write.as_fd(), FcntlArg::F_GETFD) {
            let mut flags = FdFlag::from_bits_truncate(flags);
            flags.remove(FdFlag::FD_CLOEXEC);
            let _ = fcntl(write.as_fd(), FcntlArg::F_SETFD(flags));
        }
        write
    }

    /// Keep the parent's side of the pipe after a fork.
    ///
    /// Closes the write end (the parent never writes) and returns the read
    /// end in nonblocking mode, ready for readiness registration.
    pub(crate) fn into_parent(self) -> nix::Result<OwnedFd> {
        let DeathPipe { read, write } = self;
        drop(write);
        set_nonblocking(read.as_fd())?;
        Ok(read)
    }
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}
