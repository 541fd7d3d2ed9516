use tokio::signal::unix::{signal, Signal, SignalKind};

/// Operator-initiated termination signals the supervisor listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    /// SIGINT (Ctrl+C on the controlling terminal).
    Interrupt,
    /// SIGTERM (service manager shutdown).
    Terminate,
}

impl TermSignal {
    pub fn name(self) -> &'static str {
        match self {
            TermSignal::Interrupt => "SIGINT",
            TermSignal::Terminate => "SIGTERM",
        }
    }
}

/// Bridges asynchronous signal delivery into event-loop wakeups.
///
/// The handlers do nothing in signal context; delivery is queued and
/// surfaces as a completed `recv()`, so all shutdown work runs as ordinary
/// loop code. Dropping the bridge disarms both registrations; dropping it
/// twice is a no-op by construction.
pub struct SignalBridge {
    sigint: Signal,
    sigterm: Signal,
}

impl SignalBridge {
    /// Register for SIGINT and SIGTERM.
    pub fn install() -> std::io::Result<Self> {
        Ok(SignalBridge {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next termination signal.
    pub async fn recv(&mut self) -> TermSignal {
        tokio::select! {
            _ = self.sigint.recv() => TermSignal::Interrupt,
            _ = self.sigterm.recv() => TermSignal::Terminate,
        }
    }
}
