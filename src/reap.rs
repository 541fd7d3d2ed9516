use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error};

/// Block until the primary client terminates and translate its status.
///
/// A normal exit maps to the status value itself; death by signal maps to
/// 128 plus the signal number, the shell convention, so scripting around the
/// supervisor composes with ordinary exit-code handling. This is the one
/// intentionally blocking call of the whole design and runs exactly once,
/// after the event loop has stopped.
pub fn reap(pid: Pid) -> i32 {
    loop {
        match waitpid(pid, None) {
            Ok(status) => return translate(status),
            Err(Errno::EINTR) => continue,
            Err(err) => {
                error!(%pid, error = %err, "unable to reap primary client");
                return 0;
            }
        }
    }
}

fn translate(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(pid, code) => {
            debug!(%pid, code, "primary client exited");
            code
        }
        WaitStatus::Signaled(pid, signal, _) => {
            debug!(%pid, %signal, "primary client terminated by signal");
            128 + signal as i32
        }
        // Stopped/Continued require wait flags we never pass.
        _ => 0,
    }
}
