//! Shutdown coordination and error aggregation.
//!
//! One process-wide [`Shutdown`] owns a level-triggered cancellation signal and
//! an unbounded error queue. Every listener gets a watcher task that closes it
//! when cancellation fires and then queues a shutdown notice. A single drain
//! task logs queue entries in arrival order. [`Supervisor::join`] waits for the
//! listeners, then the fired watchers, then the drain, in that order.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;

/// A listening handle that can be closed from outside its accept loop.
pub trait Closeable: Send + Sync {
    /// Stop accepting. A pending accept returns [`AcceptError::Closed`](crate::AcceptError::Closed).
    fn close(&self) -> Result<(), RelayError>;
}

/// Receiving side of the cancellation signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether cancellation has already fired.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation fires. Returns immediately if it already has.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // Nobody can cancel any more.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Firing side of the cancellation signal.
#[derive(Debug, Clone)]
pub struct Canceller {
    tx: Arc<watch::Sender<bool>>,
}

impl Canceller {
    /// Fire cancellation. Idempotent; returns `true` for the first call.
    pub fn cancel(&self) -> bool {
        let first = !self.tx.send_replace(true);
        if first {
            info!("Shutdown requested");
        }
        first
    }
}

/// Cloneable handle for queueing runtime errors.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::UnboundedSender<RelayError>,
}

impl ErrorReporter {
    /// Queue `err` for the drain. Never blocks; dropped if the queue is closed.
    pub fn report(&self, err: RelayError) {
        if let Err(mpsc::error::SendError(err)) = self.tx.send(err) {
            debug!(phase = err.phase(), error = %err, "Error reported after drain closed");
        }
    }
}

/// Receiving side of the error queue.
#[derive(Debug)]
pub struct ErrorQueue {
    rx: mpsc::UnboundedReceiver<RelayError>,
}

impl ErrorQueue {
    /// Next queued error, or `None` once every reporter is gone.
    pub async fn recv(&mut self) -> Option<RelayError> {
        self.rx.recv().await
    }
}

/// Create a connected reporter/queue pair.
pub fn error_channel() -> (ErrorReporter, ErrorQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ErrorReporter { tx }, ErrorQueue { rx })
}

/// Process-wide shutdown state.
#[derive(Debug)]
pub struct Shutdown {
    pub canceller: Canceller,
    pub signal: ShutdownSignal,
    pub reporter: ErrorReporter,
    pub queue: ErrorQueue,
}

impl Shutdown {
    /// Fresh cancellation and error channels.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        let (reporter, queue) = error_channel();
        Self {
            canceller: Canceller { tx: Arc::new(tx) },
            signal: ShutdownSignal { rx },
            reporter,
            queue,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a watcher that closes `closer` once cancellation fires and then
/// reports [`RelayError::ListenerShutdown`] for `port`.
pub fn watch(
    signal: ShutdownSignal,
    closer: Arc<dyn Closeable>,
    port: u16,
    reporter: ErrorReporter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        signal.cancelled().await;

        if let Err(e) = closer.close() {
            reporter.report(e);
        }
        debug!(port, "Listener closed by shutdown watcher");
        reporter.report(RelayError::ListenerShutdown { port });
    })
}

/// Handle to a running drain task.
#[derive(Debug)]
pub struct Drain {
    close_tx: oneshot::Sender<()>,
    done_rx: oneshot::Receiver<usize>,
}

impl Drain {
    /// Close the queue, wait for the remaining entries to be logged, and
    /// return the number of entries drained in total.
    pub async fn close_and_wait(self) -> usize {
        let _ = self.close_tx.send(());
        self.done_rx.await.unwrap_or(0)
    }
}

/// Spawn the single consumer of the error queue.
pub fn drain(queue: ErrorQueue) -> Drain {
    let (close_tx, mut close_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();
    let mut rx = queue.rx;

    tokio::spawn(async move {
        let mut drained = 0usize;

        loop {
            tokio::select! {
                biased;
                Some(err) = rx.recv() => {
                    log_entry(&err);
                    drained += 1;
                }
                _ = &mut close_rx => break,
            }
        }

        // Refuse new entries, then flush what is already queued.
        rx.close();
        while let Some(err) = rx.recv().await {
            log_entry(&err);
            drained += 1;
        }

        let _ = done_tx.send(drained);
    });

    Drain { close_tx, done_rx }
}

fn log_entry(err: &RelayError) {
    match err {
        RelayError::ListenerShutdown { port } => {
            warn!(port, phase = err.phase(), "{err}");
        }
        _ => {
            error!(
                phase = err.phase(),
                reason = err.reason_code(),
                error = %err,
                "Relay error"
            );
        }
    }
}

/// Summary returned by [`Supervisor::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Listener tasks joined.
    pub listeners: usize,
    /// Error queue entries logged by the drain.
    pub errors_drained: usize,
}

/// Top-level owner of listener tasks and their watchers.
pub struct Supervisor {
    canceller: Canceller,
    signal: ShutdownSignal,
    reporter: ErrorReporter,
    drain: Drain,
    listeners: Vec<(u16, JoinHandle<()>)>,
    watchers: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Create the shutdown state and start the drain task.
    pub fn new() -> Self {
        let Shutdown {
            canceller,
            signal,
            reporter,
            queue,
        } = Shutdown::new();

        Self {
            canceller,
            signal,
            reporter,
            drain: drain(queue),
            listeners: Vec::new(),
            watchers: Vec::new(),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Sender into the supervisor's error queue.
    pub fn reporter(&self) -> ErrorReporter {
        self.reporter.clone()
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Spawn a listener task along with its shutdown watcher.
    pub fn spawn_listener<F>(&mut self, port: u16, closer: Arc<dyn Closeable>, serve: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.watchers.push(watch(
            self.signal.clone(),
            closer,
            port,
            self.reporter.clone(),
        ));
        self.listeners.push((port, tokio::spawn(serve)));
        debug!(port, "Listener task spawned");
    }

    /// Wait for every listener task, then flush the error queue.
    ///
    /// Watchers that fired are awaited so their notices reach the queue;
    /// watchers that never fired are aborted.
    pub async fn join(self) -> ShutdownReport {
        let mut listeners = 0;
        for (port, handle) in self.listeners {
            if let Err(e) = handle.await {
                error!(port, error = %e, "Listener task failed");
            }
            listeners += 1;
        }

        if self.signal.is_cancelled() {
            for watcher in self.watchers {
                let _ = watcher.await;
            }
        } else {
            for watcher in self.watchers {
                watcher.abort();
            }
        }

        let errors_drained = self.drain.close_and_wait().await;
        info!(listeners, errors_drained, "Shutdown complete");

        ShutdownReport {
            listeners,
            errors_drained,
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
