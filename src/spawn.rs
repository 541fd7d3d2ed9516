use crate::pipe::DeathPipe;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::unistd::{self, execvpe, fork, ForkResult, Pid};
use std::collections::BTreeMap;
use std::ffi::{CStr, CString, OsString};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use tracing::debug;

/// Errors that can occur while spawning the primary client.
#[derive(Debug)]
pub enum SpawnError {
    /// No executable was given.
    EmptyCommand,
    /// An argument or environment entry contains an interior NUL byte.
    BadArgument { arg: String },
    /// fork(2) failed; no child exists.
    Fork { source: Errno },
    /// The child is running but the parent could not keep its side of the
    /// death pipe. The pid is carried so the caller can still reap.
    WatchSetup { pid: Pid, source: Errno },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::EmptyCommand => {
                write!(f, "no application given to run")
            }
            SpawnError::BadArgument { arg } => {
                write!(f, "argument {:?} contains a NUL byte", arg)
            }
            SpawnError::Fork { source } => {
                write!(f, "failed to fork primary client: {}", source)
            }
            SpawnError::WatchSetup { pid, source } => {
                write!(
                    f,
                    "failed to keep the death pipe read end for child {}: {}",
                    pid, source
                )
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::Fork { source } | SpawnError::WatchSetup { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Fork the primary client and replace its image with `command`.
///
/// The child starts with a cleared signal mask, the supervisor's stdio, the
/// inherited environment plus `env_overrides`, and exactly one extra
/// descriptor: the death pipe's write end. If the exec itself fails the
/// child reports to stderr and exits 1 instead of returning into supervisor
/// code. The parent gets the child's pid together with the pipe's read end,
/// nonblocking, ready for loop registration; a parent-side failure after the
/// fork still carries the pid so the caller can reap.
pub fn spawn_primary_client(
    command: &[String],
    env_overrides: &[(String, String)],
    pipe: DeathPipe,
) -> Result<(Pid, OwnedFd), SpawnError> {
    if command.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }
    let program = cstring(&command[0])?;
    let argv = command.iter().map(|a| cstring(a)).collect::<Result<Vec<_>, _>>()?;
    let envp = build_env(env_overrides)?;

    // SAFETY: the child branch calls only async-signal-safe functions and
    // never returns; it either execs or _exits.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
            let _write_end = pipe.into_child();
            if let Err(err) = execvpe(&program, &argv, &envp) {
                report_exec_failure(&program, err);
            }
            // SAFETY: _exit is safe to call from the child process.
            unsafe { libc::_exit(1) }
        }
        Ok(ForkResult::Parent { child }) => {
            debug!(pid = %child, command = %command[0], "primary client spawned");
            match pipe.into_parent() {
                Ok(read_end) => Ok((child, read_end)),
                Err(err) => Err(SpawnError::WatchSetup {
                    pid: child,
                    source: err,
                }),
            }
        }
        Err(err) => Err(SpawnError::Fork { source: err }),
    }
}

/// Write the exec diagnostic without allocating; the heap may not be touched
/// between fork and _exit.
fn report_exec_failure(program: &CStr, err: Errno) {
    let stderr = std::io::stderr();
    let _ = unistd::write(&stderr, b"vitrine: failed to execute ");
    let _ = unistd::write(&stderr, program.to_bytes());
    let _ = unistd::write(&stderr, b": ");
    let _ = unistd::write(&stderr, err.desc().as_bytes());
    let _ = unistd::write(&stderr, b"\n");
}

fn cstring(arg: &str) -> Result<CString, SpawnError> {
    CString::new(arg).map_err(|_| SpawnError::BadArgument {
        arg: arg.to_string(),
    })
}

/// The inherited environment with `overrides` merged over it, in execvpe
/// form.
fn build_env(overrides: &[(String, String)]) -> Result<Vec<CString>, SpawnError> {
    let mut vars: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
    for (key, value) in overrides {
        vars.insert(OsString::from(key), OsString::from(value));
    }
    vars.into_iter()
        .map(|(key, value)| {
            let mut entry = key;
            entry.push("=");
            entry.push(&value);
            CString::new(entry.as_os_str().as_bytes()).map_err(|_| SpawnError::BadArgument {
                arg: entry.to_string_lossy().into_owned(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reap::reap;
    use std::io::Read;

    fn spawn_ok(cmd: &[&str]) -> (Pid, OwnedFd) {
        let command: Vec<String> = cmd.iter().map(|s| s.to_string()).collect();
        let pipe = DeathPipe::create().unwrap();
        spawn_primary_client(&command, &[], pipe).unwrap()
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let pipe = DeathPipe::create().unwrap();
        let err = spawn_primary_client(&[], &[], pipe).unwrap_err();
        assert!(matches!(err, SpawnError::EmptyCommand));
    }

    #[test]
    fn test_nul_byte_in_argument_is_rejected() {
        let pipe = DeathPipe::create().unwrap();
        let command = vec!["echo".to_string(), "a\0b".to_string()];
        let err = spawn_primary_client(&command, &[], pipe).unwrap_err();
        assert!(matches!(err, SpawnError::BadArgument { .. }));
    }

    #[test]
    fn test_spawn_and_reap_normal_exit() {
        let (pid, _read_end) = spawn_ok(&["sh", "-c", "exit 3"]);
        assert_eq!(reap(pid), 3);
    }

    #[test]
    fn test_exec_failure_exits_the_child_with_one() {
        let (pid, _read_end) = spawn_ok(&["definitely-not-a-real-binary-vitrine"]);
        assert_eq!(reap(pid), 1);
    }

    #[test]
    fn test_read_end_reports_eof_after_child_exit() {
        let (pid, read_end) = spawn_ok(&["true"]);
        assert_eq!(reap(pid), 0);
        // The child held the last write end; EOF once it is gone.
        let mut file = std::fs::File::from(read_end);
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_child_inherits_the_write_end() {
        let pipe = DeathPipe::create().unwrap();
        let write_fd = pipe.write_fd();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("test -e /proc/self/fd/{}", write_fd),
        ];
        let (pid, _read_end) = spawn_primary_client(&command, &[], pipe).unwrap();
        assert_eq!(reap(pid), 0);
    }

    #[test]
    fn test_env_overrides_reach_the_child() {
        let pipe = DeathPipe::create().unwrap();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "test \"$VITRINE_TEST_MARKER\" = hello".to_string(),
        ];
        let overrides = vec![("VITRINE_TEST_MARKER".to_string(), "hello".to_string())];
        let (pid, _read_end) = spawn_primary_client(&command, &overrides, pipe).unwrap();
        assert_eq!(reap(pid), 0);
    }

    #[test]
    fn test_inherited_environment_reaches_the_child() {
        let (pid, _read_end) = spawn_ok(&["sh", "-c", "test -n \"$PATH\""]);
        assert_eq!(reap(pid), 0);
    }

    #[test]
    fn test_build_env_override_wins_over_inherited() {
        std::env::set_var("VITRINE_BUILD_ENV_TEST", "original");
        let env = build_env(&[("VITRINE_BUILD_ENV_TEST".into(), "override".into())]).unwrap();
        let entry = CString::new("VITRINE_BUILD_ENV_TEST=override").unwrap();
        assert!(env.contains(&entry));
        let stale = CString::new("VITRINE_BUILD_ENV_TEST=original").unwrap();
        assert!(!env.contains(&stale));
    }
}
