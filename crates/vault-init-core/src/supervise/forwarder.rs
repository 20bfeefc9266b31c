//! Child output forwarding.
//!
//! A [`Forwarder`] drains one child output pipe line by line and fans each
//! line out to the process logger (tagged with the stream label) and any
//! caller-supplied sinks. Empty lines are suppressed. Lines reach each sink
//! in arrival order; ordering across sinks is not synchronized.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which child stream a forwarder is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLabel {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Fan-out pump over one owned readable end of a child pipe.
pub struct Forwarder {
    reader: Option<Box<dyn AsyncRead + Send + Unpin>>,
    sinks: Vec<mpsc::Sender<String>>,
    stream: StreamLabel,
    cancel: CancellationToken,
    done_rx: Option<oneshot::Receiver<()>>,
}

impl Forwarder {
    /// Construct a forwarder over an owned reader.
    #[must_use]
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, stream: StreamLabel) -> Self {
        Self {
            reader: Some(Box::new(reader)),
            sinks: Vec::new(),
            stream,
            cancel: CancellationToken::new(),
            done_rx: None,
        }
    }

    /// Register an additional sink. Must be called before
    /// [`start`](Forwarder::start); later registrations are ignored.
    pub fn tee(&mut self, sink: mpsc::Sender<String>) {
        if self.reader.is_some() {
            self.sinks.push(sink);
        }
    }

    /// Begin forwarding concurrently. Returns immediately; calling it more
    /// than once is a no-op.
    pub fn start(&mut self, parent: CancellationToken) {
        let Some(reader) = self.reader.take() else {
            return;
        };

        self.cancel = parent.child_token();
        let (done_tx, done_rx) = oneshot::channel();
        self.done_rx = Some(done_rx);

        tokio::spawn(pump(
            reader,
            self.stream,
            std::mem::take(&mut self.sinks),
            self.cancel.clone(),
            done_tx,
        ));
    }

    /// Wait until the reader reached EOF or errored, then cancel the
    /// forwarder. Close is propagated to the sinks by dropping their
    /// senders. Idempotent.
    pub async fn wait_close(&mut self) {
        if let Some(done_rx) = self.done_rx.take() {
            let _ = done_rx.await;
        }

        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("stream", &self.stream)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

async fn pump(
    reader: Box<dyn AsyncRead + Send + Unpin>,
    stream: StreamLabel,
    sinks: Vec<mpsc::Sender<String>>,
    cancel: CancellationToken,
    done_tx: oneshot::Sender<()>,
) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(stream = %stream, "child output forwarder exiting");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }

                        match stream {
                            StreamLabel::Stdout => info!(stream = %stream, "{line}"),
                            StreamLabel::Stderr => warn!(stream = %stream, "{line}"),
                        }

                        for sink in &sinks {
                            // A closed sink is the embedder's business, not
                            // a reason to stop the others.
                            let _ = sink.send(line.clone()).await;
                        }
                    }
                    Ok(None) => {
                        debug!(stream = %stream, "child output closed");
                        break;
                    }
                    Err(err) => {
                        debug!(stream = %stream, error = %err, "error reading child output");
                        break;
                    }
                }
            }
        }
    }

    let _ = done_tx.send(());
    // Dropping the sink senders here propagates close to every sink.
}
