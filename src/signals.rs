/// Signal handling for interrupting a run.
///
/// Scanner children run in their own process group, so a Ctrl-C at the
/// terminal never reaches them. SIGINT and SIGTERM set a shutdown flag that
/// the run loop observes; the in-flight scan is killed and the run ends
/// with every recorded sample intact.
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Receiving half: observed by the run loop and the scan waits.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Sending half: flips the shutdown flag.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Create a linked trigger/shutdown pair.
pub fn shutdown_pair() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // send_replace never fails, even with no receivers left.
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested. Pends forever if the trigger
    /// is dropped without firing.
    pub async fn requested(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Install SIGINT and SIGTERM listeners that fire the returned `Shutdown`.
///
/// A second signal after the first is logged and otherwise ignored; the
/// loop is already winding down.
pub fn install() -> std::io::Result<Shutdown> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (trigger, shutdown) = shutdown_pair();

    tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            let name = tokio::select! {
                Some(()) = sigint.recv() => "SIGINT",
                Some(()) = sigterm.recv() => "SIGTERM",
                else => break,
            };
            received += 1;
            if received == 1 {
                tracing::warn!(
                    signal = name,
                    "shutdown requested, stopping after killing the current scan"
                );
                trigger.trigger();
            } else {
                tracing::warn!(signal = name, "shutdown already in progress");
            }
        }
    });

    Ok(shutdown)
}
