use crate::endpoint::{DisplayEndpoint, EndpointError};
use crate::pipe::DeathPipe;
use crate::privilege;
use crate::reap;
use crate::signals::{SignalBridge, TermSignal};
use crate::spawn::{spawn_primary_client, SpawnError};
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, error, info};

/// Everything a session needs from the outside world.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Primary client argv.
    pub command: Vec<String>,
    /// Directory holding display sockets (XDG_RUNTIME_DIR).
    pub runtime_dir: PathBuf,
    /// Explicit display socket name; auto-selected when unset.
    pub socket_name: Option<String>,
    /// Extra environment for the primary client.
    pub client_env: Vec<(String, String)>,
}

/// The supervising context; exactly one per run.
///
/// Fields are owned and mutated only by the session driver and its loop
/// arms, never from signal context.
struct Session {
    child: Option<Pid>,
    death_watch: Option<AsyncFd<OwnedFd>>,
    signals: Option<SignalBridge>,
    endpoint: Option<DisplayEndpoint>,
    exit_code_from_child: bool,
}

impl Session {
    fn new() -> Self {
        Session {
            child: None,
            death_watch: None,
            signals: None,
            endpoint: None,
            exit_code_from_child: false,
        }
    }

    /// Release loop registrations, clients, and the socket. Safe to call
    /// more than once; teardown must always reach process exit.
    fn teardown(&mut self) {
        self.death_watch = None;
        self.signals = None;
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.disconnect_clients();
        }
    }
}

/// Failures that end a session before the loop can run normally.
#[derive(Debug)]
pub enum SessionError {
    /// Display endpoint could not be brought up.
    Endpoint { source: EndpointError },
    /// Termination-signal handlers could not be installed.
    Signals { source: std::io::Error },
    /// Death pipe creation failed (descriptor exhaustion).
    DeathPipe { source: nix::Error },
    /// The primary client could not be spawned.
    Spawn { source: SpawnError },
    /// The death pipe's read end could not be registered with the loop.
    Watch { source: std::io::Error },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Endpoint { source } => {
                write!(f, "failed to bring up display endpoint: {}", source)
            }
            SessionError::Signals { source } => {
                write!(f, "failed to install signal handlers: {}", source)
            }
            SessionError::DeathPipe { source } => {
                write!(f, "failed to create death pipe: {}", source)
            }
            SessionError::Spawn { source } => {
                write!(f, "failed to spawn primary client: {}", source)
            }
            SessionError::Watch { source } => {
                write!(f, "failed to register death pipe with the event loop: {}", source)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Endpoint { source } => Some(source),
            SessionError::Signals { source } => Some(source),
            SessionError::DeathPipe { source } => Some(source),
            SessionError::Spawn { source } => Some(source),
            SessionError::Watch { source } => Some(source),
        }
    }
}

/// Run one kiosk session to completion and return the process exit code.
///
/// Phases: privilege check, event-loop construction, endpoint and signal
/// and spawn setup, the cooperative loop, then the blocking reap and
/// teardown. The final code is the child's translated status when the death
/// pipe reported its exit, 0 for an operator-requested shutdown, 1 for any
/// startup or spawn failure.
pub fn run(opts: &SessionOptions) -> i32 {
    if let Err(err) = privilege::check() {
        error!(error = %err, "refusing to start");
        return 1;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build event loop");
            return 1;
        }
    };

    let started = Instant::now();
    let mut session = Session::new();

    let mut code = match runtime.block_on(drive(&mut session, opts)) {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "session failed");
            1
        }
    };

    // The one blocking wait of the design, after the loop has stopped. An
    // operator-requested shutdown still waits for the child's own exit.
    if let Some(pid) = session.child {
        let child_code = reap::reap(pid);
        if session.exit_code_from_child {
            code = child_code;
        }
    }

    session.teardown();
    info!(code, duration_secs = started.elapsed().as_secs(), "session finished");
    code
}

/// Bring up collaborators, spawn the primary client, and wait.
async fn drive(session: &mut Session, opts: &SessionOptions) -> Result<(), SessionError> {
    let endpoint = DisplayEndpoint::bind(&opts.runtime_dir, opts.socket_name.as_deref())
        .map_err(|e| SessionError::Endpoint { source: e })?;
    let socket_name = endpoint.socket_name().to_string();
    info!(socket = %socket_name, "display socket ready");
    session.endpoint = Some(endpoint);

    session.signals =
        Some(SignalBridge::install().map_err(|e| SessionError::Signals { source: e })?);

    let pipe = DeathPipe::create().map_err(|e| SessionError::DeathPipe { source: e })?;

    let mut env = opts.client_env.clone();
    env.push(("WAYLAND_DISPLAY".to_string(), socket_name));

    let (pid, read_end) = match spawn_primary_client(&opts.command, &env, pipe) {
        Ok(spawned) => spawned,
        Err(SpawnError::WatchSetup { pid, source }) => {
            // The child exists; record it so the shutdown path reaps it.
            session.child = Some(pid);
            return Err(SessionError::Spawn {
                source: SpawnError::WatchSetup { pid, source },
            });
        }
        Err(err) => return Err(SessionError::Spawn { source: err }),
    };
    session.child = Some(pid);

    session.death_watch = Some(
        AsyncFd::with_interest(read_end, Interest::READABLE | Interest::ERROR)
            .map_err(|e| SessionError::Watch { source: e })?,
    );

    info!(pid = %pid, command = %opts.command[0], "primary client running");
    event_loop(session).await;
    Ok(())
}

/// The cooperative wait. `biased` polls the death pipe ahead of the signal
/// arms on every wakeup, so an observed child exit always decides the exit
/// code even when a termination signal lands in the same instant.
async fn event_loop(session: &mut Session) {
    let Session {
        death_watch,
        signals,
        endpoint,
        exit_code_from_child,
        ..
    } = session;
    loop {
        tokio::select! {
            biased;
            _ = death_closed(death_watch.as_ref()) => {
                *exit_code_from_child = true;
                *death_watch = None;
                debug!("death pipe closed, primary client is gone");
                break;
            }
            sig = next_signal(signals.as_mut()) => {
                info!(signal = sig.name(), "termination signal received, stopping session");
                break;
            }
            _ = accept_next(endpoint.as_mut()) => {}
        }
    }
}

/// Resolves once the death pipe's read end reports hangup or error. Nothing
/// is ever written to the pipe, so any readiness means the write end is
/// gone.
async fn death_closed(watch: Option<&AsyncFd<OwnedFd>>) {
    match watch {
        Some(fd) => {
            let _ = fd.ready(Interest::READABLE | Interest::ERROR).await;
        }
        None => std::future::pending().await,
    }
}

async fn next_signal(bridge: Option<&mut SignalBridge>) -> TermSignal {
    match bridge {
        Some(bridge) => bridge.recv().await,
        None => std::future::pending().await,
    }
}

async fn accept_next(endpoint: Option<&mut DisplayEndpoint>) {
    match endpoint {
        Some(endpoint) => endpoint.accept_client().await,
        None => std::future::pending().await,
    }
}
