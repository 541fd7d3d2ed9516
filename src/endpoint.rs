use fs2::FileExt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// Largest display number probed when auto-selecting a socket name.
const MAX_DISPLAY: u32 = 32;

/// Errors from bringing up the display endpoint.
#[derive(Debug)]
pub enum EndpointError {
    /// Every candidate socket name in the runtime directory is taken.
    Exhausted { dir: PathBuf },
    /// Could not take the lock guarding a socket name.
    Lock { path: PathBuf, source: io::Error },
    /// Could not bind the socket itself.
    Bind { path: PathBuf, source: io::Error },
}

impl std::fmt::Display for EndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointError::Exhausted { dir } => {
                write!(
                    f,
                    "no free display socket name in {} (tried wayland-0 through wayland-{})",
                    dir.display(),
                    MAX_DISPLAY
                )
            }
            EndpointError::Lock { path, source } => {
                write!(f, "failed to lock {}: {}", path.display(), source)
            }
            EndpointError::Bind { path, source } => {
                write!(f, "failed to bind {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for EndpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EndpointError::Exhausted { .. } => None,
            EndpointError::Lock { source, .. } | EndpointError::Bind { source, .. } => Some(source),
        }
    }
}

/// Advisory lock guarding one display socket name.
///
/// The lock outlives crashes (the kernel releases it with the process), so a
/// free lock with a leftover socket file identifies a stale socket that is
/// safe to reclaim.
#[derive(Debug)]
struct SocketLock {
    _file: File,
    path: PathBuf,
}

impl SocketLock {
    fn take(path: &Path) -> Result<Self, EndpointError> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| EndpointError::Lock {
                path: path.to_path_buf(),
                source: e,
            })?;
        file.try_lock_exclusive().map_err(|e| EndpointError::Lock {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(SocketLock {
            _file: file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for SocketLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %err, "failed to unlink socket lock file");
        }
    }
}

/// The display protocol endpoint handed to the primary client.
///
/// The supervisor's slice of the display side: bind the socket the client
/// will connect to, keep accepted connections alive for the session's
/// lifetime, and release everything at teardown. Protocol handling itself
/// lives outside the supervisor.
#[derive(Debug)]
pub struct DisplayEndpoint {
    listener: UnixListener,
    clients: Vec<UnixStream>,
    socket_name: String,
    socket_path: PathBuf,
    _lock: SocketLock,
}

impl DisplayEndpoint {
    /// Bind the display socket under `runtime_dir`.
    ///
    /// With an explicit `name` the endpoint binds exactly that socket and
    /// fails if it is taken. With `None` it probes `wayland-0` through
    /// `wayland-32` and binds the first free name. A held lock means a live
    /// server owns the name; a free lock with a leftover socket file means a
    /// crashed one, whose socket is removed and reused.
    pub fn bind(runtime_dir: &Path, name: Option<&str>) -> Result<Self, EndpointError> {
        if let Some(name) = name {
            return Self::bind_name(runtime_dir, name);
        }
        for n in 0..=MAX_DISPLAY {
            let name = format!("wayland-{}", n);
            match Self::bind_name(runtime_dir, &name) {
                Ok(endpoint) => return Ok(endpoint),
                Err(err) => {
                    debug!(socket = %name, error = %err, "display socket name unavailable");
                }
            }
        }
        Err(EndpointError::Exhausted {
            dir: runtime_dir.to_path_buf(),
        })
    }

    fn bind_name(runtime_dir: &Path, name: &str) -> Result<Self, EndpointError> {
        let socket_path = runtime_dir.join(name);
        let lock = SocketLock::take(&runtime_dir.join(format!("{}.lock", name)))?;
        if socket_path.exists() {
            debug!(path = %socket_path.display(), "removing stale display socket");
            std::fs::remove_file(&socket_path).map_err(|e| EndpointError::Bind {
                path: socket_path.clone(),
                source: e,
            })?;
        }
        let listener = UnixListener::bind(&socket_path).map_err(|e| EndpointError::Bind {
            path: socket_path.clone(),
            source: e,
        })?;
        Ok(DisplayEndpoint {
            listener,
            clients: Vec::new(),
            socket_name: name.to_string(),
            socket_path,
            _lock: lock,
        })
    }

    /// Name the primary client should be pointed at.
    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    /// Accept the next protocol connection and hold it open.
    pub async fn accept_client(&mut self) {
        match self.listener.accept().await {
            Ok((stream, _addr)) => {
                self.clients.push(stream);
                debug!(clients = self.clients.len(), "protocol client connected");
            }
            Err(err) => warn!(error = %err, "failed to accept protocol client"),
        }
    }

    /// Drop every held client connection.
    pub fn disconnect_clients(&mut self) {
        if !self.clients.is_empty() {
            debug!(clients = self.clients.len(), "disconnecting protocol clients");
        }
        self.clients.clear();
    }

    #[cfg(test)]
    fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Drop for DisplayEndpoint {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            debug!(path = %self.socket_path.display(), error = %err, "failed to unlink display socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_auto_picks_first_free_name() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = DisplayEndpoint::bind(dir.path(), None).unwrap();
        assert_eq!(endpoint.socket_name(), "wayland-0");
        assert!(dir.path().join("wayland-0").exists());
        assert!(dir.path().join("wayland-0.lock").exists());
    }

    #[tokio::test]
    async fn test_bind_auto_skips_names_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let first = DisplayEndpoint::bind(dir.path(), None).unwrap();
        let second = DisplayEndpoint::bind(dir.path(), None).unwrap();
        assert_eq!(first.socket_name(), "wayland-0");
        assert_eq!(second.socket_name(), "wayland-1");
    }

    #[tokio::test]
    async fn test_bind_explicit_name() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = DisplayEndpoint::bind(dir.path(), Some("wayland-7")).unwrap();
        assert_eq!(endpoint.socket_name(), "wayland-7");
        assert!(dir.path().join("wayland-7").exists());
    }

    #[tokio::test]
    async fn test_bind_explicit_name_in_use_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _held = DisplayEndpoint::bind(dir.path(), Some("wayland-3")).unwrap();
        let err = DisplayEndpoint::bind(dir.path(), Some("wayland-3")).unwrap_err();
        assert!(matches!(err, EndpointError::Lock { .. }));
    }

    #[tokio::test]
    async fn test_stale_socket_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        // Leftover socket file with nobody holding the lock.
        std::fs::write(dir.path().join("wayland-0"), b"").unwrap();
        let endpoint = DisplayEndpoint::bind(dir.path(), None).unwrap();
        assert_eq!(endpoint.socket_name(), "wayland-0");
    }

    #[tokio::test]
    async fn test_accept_holds_clients_until_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let mut endpoint = DisplayEndpoint::bind(dir.path(), None).unwrap();
        let path = dir.path().join(endpoint.socket_name());
        let _client = UnixStream::connect(&path).await.unwrap();
        endpoint.accept_client().await;
        assert_eq!(endpoint.client_count(), 1);
        endpoint.disconnect_clients();
        assert_eq!(endpoint.client_count(), 0);
        // Disconnecting again is harmless.
        endpoint.disconnect_clients();
    }

    #[tokio::test]
    async fn test_drop_unlinks_socket_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = DisplayEndpoint::bind(dir.path(), None).unwrap();
        let socket = dir.path().join("wayland-0");
        let lock = dir.path().join("wayland-0.lock");
        assert!(socket.exists() && lock.exists());
        drop(endpoint);
        assert!(!socket.exists());
        assert!(!lock.exists());
        // The name is immediately reusable.
        let endpoint = DisplayEndpoint::bind(dir.path(), None).unwrap();
        assert_eq!(endpoint.socket_name(), "wayland-0");
    }

    #[tokio::test]
    async fn test_exhausted_when_every_name_is_taken() {
        let dir = tempfile::tempdir().unwrap();
        let mut held = Vec::new();
        for _ in 0..=MAX_DISPLAY {
            held.push(DisplayEndpoint::bind(dir.path(), None).unwrap());
        }
        let err = DisplayEndpoint::bind(dir.path(), None).unwrap_err();
        assert!(matches!(err, EndpointError::Exhausted { .. }));
    }
}
