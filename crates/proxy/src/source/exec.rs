//! Exec source: a shared-subprocess coordinator.
//!
//! Concurrent scrapers of one exec source are batched onto a single
//! subprocess execution. A long-lived executor task owns the waiter set and
//! the subprocess lifecycle; scrapers talk to it over a command channel and
//! receive the batch outcome on a one-shot channel. Because the executor
//! processes its mailbox sequentially and distributes results without
//! suspending, a scraper arriving once distribution has begun lands in the
//! next batch, and the subprocess is killed as soon as the waiter count
//! drops to zero.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reverse_exporter_config::ExecExporterConfig;
use reverse_exporter_expfmt::{self as expfmt, Format, MetricFamily};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::ScrapeError;

/// The outcome of one subprocess execution, multicast to every waiter of
/// the batch.
struct BatchResult {
    families: Vec<MetricFamily>,
    error: Option<ScrapeError>,
}

impl BatchResult {
    fn failed(error: ScrapeError) -> Self {
        Self {
            families: Vec::new(),
            error: Some(error),
        }
    }
}

enum WaiterEvent {
    Join {
        id: u64,
        reply: oneshot::Sender<Arc<BatchResult>>,
    },
    Leave {
        id: u64,
    },
}

pub struct ExecSource {
    events: mpsc::UnboundedSender<WaiterEvent>,
    next_waiter: AtomicU64,
}

impl ExecSource {
    /// Creates the source and starts its executor task. The task lives
    /// until the source is dropped.
    pub fn new(config: &ExecExporterConfig) -> Self {
        let (events, mailbox) = mpsc::unbounded_channel();
        tokio::spawn(executor(
            mailbox,
            config.command.clone(),
            config.args.clone(),
        ));
        Self {
            events,
            next_waiter: AtomicU64::new(0),
        }
    }

    /// Joins the current (or next) batch and waits for its outcome, or for
    /// the scope to be cancelled. Every exit path leaves the waiter set
    /// consistent.
    pub async fn scrape(
        &self,
        scope: &CancellationToken,
    ) -> Result<Vec<MetricFamily>, ScrapeError> {
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (reply, outcome) = oneshot::channel();
        if self.events.send(WaiterEvent::Join { id, reply }).is_err() {
            return Err(ScrapeError::ExecStart("executor task is gone".to_string()));
        }

        tokio::select! {
            batch = outcome => match batch {
                Ok(batch) => {
                    debug!("scraper exiting with batch result");
                    match &batch.error {
                        Some(error) => Err(error.clone()),
                        None => Ok(batch.families.clone()),
                    }
                }
                Err(_) => Err(ScrapeError::ExecWait(
                    "executor dropped the batch".to_string(),
                )),
            },
            _ = scope.cancelled() => {
                debug!("scraper exiting due to cancelled scope");
                let _ = self.events.send(WaiterEvent::Leave { id });
                Err(ScrapeError::ScrapeTimeout)
            }
        }
    }
}

/// The executor loop: idle while no waiters, then run one subprocess per
/// batch and multicast its result.
async fn executor(
    mut mailbox: mpsc::UnboundedReceiver<WaiterEvent>,
    command: PathBuf,
    args: Vec<String>,
) {
    debug!(command = %command.display(), "exec source executor started");
    let mut waiters: HashMap<u64, oneshot::Sender<Arc<BatchResult>>> = HashMap::new();
    let mut closed = false;

    loop {
        // Idle until at least one waiter is present.
        while waiters.is_empty() {
            match mailbox.recv().await {
                Some(WaiterEvent::Join { id, reply }) => {
                    waiters.insert(id, reply);
                }
                Some(WaiterEvent::Leave { id }) => {
                    waiters.remove(&id);
                }
                None => return,
            }
        }

        // Running: keep admitting and releasing waiters while the
        // subprocess executes. The batch's scope is cancelled when the
        // waiter count falls back to zero, which kills the subprocess.
        let batch_scope = CancellationToken::new();
        let run = run_once(&command, &args, batch_scope.clone());
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                event = mailbox.recv(), if !closed => match event {
                    Some(WaiterEvent::Join { id, reply }) => {
                        waiters.insert(id, reply);
                    }
                    Some(WaiterEvent::Leave { id }) => {
                        waiters.remove(&id);
                        debug!(waiting_scrapers = waiters.len(), "scraper left batch");
                        if waiters.is_empty() {
                            info!("no more listeners, requesting subprocess exit");
                            batch_scope.cancel();
                        }
                    }
                    None => {
                        closed = true;
                        batch_scope.cancel();
                    }
                },
                result = &mut run => break result,
            }
        };

        // Distribute without suspending: nothing can join between here and
        // the drain, so late arrivals belong to the next batch. The reply
        // channels are one-shot, so sending never blocks.
        debug!(waiting_scrapers = waiters.len(), "emitting results to remaining scrapers");
        let result = Arc::new(result);
        for (_, reply) in waiters.drain() {
            let _ = reply.send(Arc::clone(&result));
        }

        if closed {
            return;
        }
    }
}

/// Runs the command once, consuming stdout to EOF before waiting so a full
/// pipe buffer cannot deadlock the child. Cancelling `scope` kills the
/// subprocess.
async fn run_once(command: &Path, args: &[String], scope: CancellationToken) -> BatchResult {
    debug!("executing metric script");
    let mut child = match Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            error!(error = %err, "error starting metric script");
            return BatchResult::failed(ScrapeError::ExecStart(err.to_string()));
        }
    };
    let Some(mut stdout) = child.stdout.take() else {
        error!("stdout pipe to metric script unavailable");
        return BatchResult::failed(ScrapeError::ExecPipe(
            "stdout pipe unavailable".to_string(),
        ));
    };

    let mut output = Vec::new();
    let read = tokio::select! {
        read = stdout.read_to_end(&mut output) => read,
        _ = scope.cancelled() => {
            info!("no more scrapers, killing subprocess");
            if let Err(err) = child.kill().await {
                error!(error = %err, "error during subprocess kill");
            }
            return BatchResult::failed(ScrapeError::ExecWait(
                "metric script killed before completion".to_string(),
            ));
        }
    };
    if let Err(err) = read {
        error!(error = %err, "error reading from metric script");
        let _ = child.kill().await;
        return BatchResult::failed(ScrapeError::ExecPipe(err.to_string()));
    }

    match child.wait().await {
        Ok(status) if status.success() => {}
        Ok(status) => {
            error!(%status, "metric script exited with error");
            return BatchResult::failed(ScrapeError::ExecWait(format!(
                "metric script exited with {status}"
            )));
        }
        Err(err) => {
            error!(error = %err, "error waiting for metric script");
            return BatchResult::failed(ScrapeError::ExecWait(err.to_string()));
        }
    }
    debug!("subprocess finished");

    match expfmt::decode(&output, Format::Text) {
        Ok(families) => BatchResult {
            families,
            error: None,
        },
        Err(err) => {
            error!(error = %err, "metric decoding from script output failed");
            BatchResult::failed(ScrapeError::Decode(err.to_string()))
        }
    }
}
