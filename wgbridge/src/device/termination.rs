use std::future::Future;
use std::io;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::oneshot;

/// OS signals that request shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
}

/// The event that ends the device run loop
#[derive(Debug)]
pub enum TerminationSignal {
    OsSignal(ShutdownSignal),
    ListenerError(io::Error),
    DeviceDone,
}

impl std::fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationSignal::OsSignal(ShutdownSignal::Terminate) => {
                f.write_str("received SIGTERM")
            }
            TerminationSignal::OsSignal(ShutdownSignal::Interrupt) => {
                f.write_str("received SIGINT")
            }
            TerminationSignal::ListenerError(e) => write!(f, "control socket failed: {}", e),
            TerminationSignal::DeviceDone => f.write_str("device stopped"),
        }
    }
}

/// SIGTERM and SIGINT subscription
pub struct OsSignals {
    terminate: Signal,
    interrupt: Signal,
}

impl OsSignals {
    /// Register the handlers. Signals delivered after this call are queued
    /// until [`OsSignals::recv`] is polled.
    pub fn subscribe() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    pub async fn recv(mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
        }
    }
}

/// Wait for the first of: a shutdown signal, an accept-loop failure, or the
/// device finishing on its own. The other sources are never polled again.
pub async fn wait_for_termination<S, D>(
    shutdown: S,
    accept_error: oneshot::Receiver<io::Error>,
    device_done: D,
) -> TerminationSignal
where
    S: Future<Output = ShutdownSignal>,
    D: Future<Output = ()>,
{
    tokio::select! {
        signal = shutdown => TerminationSignal::OsSignal(signal),
        result = accept_error => match result {
            Ok(e) => TerminationSignal::ListenerError(e),
            Err(_) => TerminationSignal::ListenerError(io::Error::other("accept loop exited")),
        },
        _ = device_done => TerminationSignal::DeviceDone,
    }
}
