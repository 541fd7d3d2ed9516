use nix::unistd::{getegid, geteuid, getgid, getuid};
use tracing::warn;

/// Snapshot of the process's real and effective identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

impl Identity {
    /// Read the identity of the current process.
    pub fn current() -> Self {
        Identity {
            uid: getuid().as_raw(),
            euid: geteuid().as_raw(),
            gid: getgid().as_raw(),
            egid: getegid().as_raw(),
        }
    }
}

/// Identity configurations the supervisor refuses to run under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivilegeError {
    /// Real and effective ids disagree (setuid/setgid-style invocation).
    SetuidLegacy { identity: Identity },
}

impl std::fmt::Display for PrivilegeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrivilegeError::SetuidLegacy { identity } => {
                write!(
                    f,
                    "real and effective identity differ (uid {}/euid {}, gid {}/egid {}), \
                     setuid-style startup is not supported",
                    identity.uid, identity.euid, identity.gid, identity.egid
                )
            }
        }
    }
}

impl std::error::Error for PrivilegeError {}

/// One-shot startup check of the process identity.
///
/// A setuid or setgid invocation is refused outright rather than having its
/// privileges dropped; dropping after the fact has a history of
/// privilege-retention bugs. Running as plain root is allowed but warned
/// about. The check has no side effects beyond diagnostics.
pub fn check() -> Result<(), PrivilegeError> {
    check_identity(Identity::current())
}

fn check_identity(identity: Identity) -> Result<(), PrivilegeError> {
    if identity.uid != identity.euid || identity.gid != identity.egid {
        return Err(PrivilegeError::SetuidLegacy { identity });
    }
    if identity.uid == 0 || identity.gid == 0 {
        warn!("running as root user, this is dangerous");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(uid: u32, euid: u32, gid: u32, egid: u32) -> Identity {
        Identity {
            uid,
            euid,
            gid,
            egid,
        }
    }

    #[test]
    fn test_unprivileged_identity_allowed() {
        assert!(check_identity(identity(1000, 1000, 1000, 1000)).is_ok());
    }

    #[test]
    fn test_consistent_root_allowed() {
        assert!(check_identity(identity(0, 0, 0, 0)).is_ok());
    }

    #[test]
    fn test_setuid_root_denied() {
        let err = check_identity(identity(1000, 0, 1000, 1000)).unwrap_err();
        assert!(matches!(err, PrivilegeError::SetuidLegacy { .. }));
    }

    #[test]
    fn test_setgid_denied() {
        let err = check_identity(identity(1000, 1000, 100, 27)).unwrap_err();
        assert!(matches!(err, PrivilegeError::SetuidLegacy { .. }));
    }

    #[test]
    fn test_dropped_effective_root_denied() {
        // Real root with a non-root effective id is just as inconsistent.
        let err = check_identity(identity(0, 1000, 0, 1000)).unwrap_err();
        assert!(matches!(err, PrivilegeError::SetuidLegacy { .. }));
    }

    #[test]
    fn test_current_process_allowed() {
        // The test runner is never a setuid binary.
        assert!(check().is_ok());
    }
}
