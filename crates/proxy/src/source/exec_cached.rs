//! Caching exec source: runs a script on a fixed interval and serves the
//! last successful result.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use reverse_exporter_config::CachedExecExporterConfig;
use reverse_exporter_expfmt::{self as expfmt, Format, MetricFamily};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error};

use tokio_util::sync::CancellationToken;

use crate::error::ScrapeError;

pub struct CachedExecSource {
    cache: Arc<RwLock<Vec<MetricFamily>>>,
    ready: watch::Receiver<bool>,
}

impl CachedExecSource {
    /// Creates the source and starts its interval scheduler task.
    pub fn new(config: &CachedExecExporterConfig) -> Self {
        let cache = Arc::new(RwLock::new(Vec::new()));
        let (ready_tx, ready) = watch::channel(false);
        tokio::spawn(refresher(
            config.command.clone(),
            config.args.clone(),
            config.exec_interval,
            Arc::clone(&cache),
            ready_tx,
        ));
        Self { cache, ready }
    }

    /// Returns the cached families, blocking until the first successful run
    /// has populated the cache or the scope is cancelled.
    pub async fn scrape(
        &self,
        scope: &CancellationToken,
    ) -> Result<Vec<MetricFamily>, ScrapeError> {
        let mut ready = self.ready.clone();
        tokio::select! {
            first = ready.wait_for(|populated| *populated) => {
                if first.is_err() {
                    return Err(ScrapeError::ExecWait(
                        "cache refresher task is gone".to_string(),
                    ));
                }
                debug!("returning cached results of scrape");
            }
            _ = scope.cancelled() => return Err(ScrapeError::ScrapeTimeout),
        }
        Ok(self.cache.read().await.clone())
    }
}

/// The interval scheduler: executes the script, and on success replaces the
/// cache under the write lock. A failed run is logged and leaves the
/// previous good result visible. The readiness channel flips exactly once,
/// on the first successful run.
async fn refresher(
    command: PathBuf,
    args: Vec<String>,
    interval: Duration,
    cache: Arc<RwLock<Vec<MetricFamily>>>,
    ready: watch::Sender<bool>,
) {
    debug!(command = %command.display(), "caching exec source started");
    let mut next_exec = Instant::now();
    loop {
        tokio::time::sleep_until(next_exec).await;
        if ready.is_closed() {
            // The source itself is gone.
            return;
        }
        next_exec = Instant::now() + interval;
        debug!("executing metric script on interval");

        match run_once(&command, &args).await {
            Ok(families) => {
                let mut cached = cache.write().await;
                *cached = families;
                let _ = ready.send(true);
            }
            Err(err) => error!(error = %err, "interval metric script run failed"),
        }
    }
}

/// One scheduled execution: decode stdout to EOF, then hard-kill the script.
/// The exit status is deliberately ignored; only pipe, spawn and decode
/// failures count.
async fn run_once(command: &Path, args: &[String]) -> Result<Vec<MetricFamily>, ScrapeError> {
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| ScrapeError::ExecStart(err.to_string()))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ScrapeError::ExecPipe("stdout pipe unavailable".to_string()))?;

    let mut output = Vec::new();
    let read = stdout.read_to_end(&mut output).await;
    if let Err(err) = child.kill().await {
        error!(error = %err, "error sending kill signal to subprocess");
    }
    read.map_err(|err| ScrapeError::ExecPipe(err.to_string()))?;

    expfmt::decode(&output, Format::Text).map_err(|err| ScrapeError::Decode(err.to_string()))
}
