//! Integration tests for the interval-caching exec source.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use reverse_exporter_config::CachedExecExporterConfig;
use reverse_exporter_proxy::{CachedExecSource, ScrapeError};
use reverse_exporter_expfmt::MetricFamily;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TIMESTAMPING_SCRIPT: &str = "#!/bin/sh\n\
cat << EOF\n\
test_metric_time $(date +%s)\n\
EOF\n";

const SLOW_SCRIPT: &str = "#!/bin/sh\nsleep 5\necho \"slow_metric 1\"\n";

// Succeeds on the first run, fails on every following run.
const FAIL_AFTER_FIRST_SCRIPT: &str = "#!/bin/sh\n\
if [ -f \"$1\" ]; then\n\
  exit 1\n\
fi\n\
touch \"$1\"\n\
echo \"sticky_metric 5\"\n";

fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o700)).unwrap();
    path
}

fn cached_config(
    command: PathBuf,
    args: Vec<String>,
    exec_interval: Duration,
) -> CachedExecExporterConfig {
    CachedExecExporterConfig {
        name: "test_cached_exec".to_string(),
        no_rewrite: false,
        labels: HashMap::new(),
        command,
        args,
        exec_interval,
    }
}

fn untyped_value(families: &[MetricFamily]) -> f64 {
    families[0].metric[0].untyped.as_ref().unwrap().value.unwrap()
}

#[tokio::test]
async fn scrapes_under_the_interval_share_a_result() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "timestamping.sh", TIMESTAMPING_SCRIPT);
    let source = CachedExecSource::new(&cached_config(script, Vec::new(), Duration::from_secs(1)));

    let scope = CancellationToken::new();
    let first = source.scrape(&scope).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].name(), "test_metric_time");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = source.scrape(&scope).await.unwrap();
    assert_eq!(
        untyped_value(&first),
        untyped_value(&second),
        "scrapes under the interval must return the cached result"
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let third = source.scrape(&scope).await.unwrap();
    assert!(
        untyped_value(&third) > untyped_value(&second),
        "a scrape after the interval must see a fresh execution"
    );
}

#[tokio::test]
async fn early_scrape_cancellation_reports_timeout() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "slow.sh", SLOW_SCRIPT);
    let source = CachedExecSource::new(&cached_config(script, Vec::new(), Duration::from_secs(30)));

    let scope = CancellationToken::new();
    let canceller = scope.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = source.scrape(&scope).await.unwrap_err();
    assert!(matches!(err, ScrapeError::ScrapeTimeout), "got {err:?}");
}

#[tokio::test]
async fn failed_runs_keep_the_previous_good_result() {
    let dir = TempDir::new().unwrap();
    let flag = dir.path().join("ran-once");
    let script = write_script(&dir, "fail_after_first.sh", FAIL_AFTER_FIRST_SCRIPT);
    let source = CachedExecSource::new(&cached_config(
        script,
        vec![flag.to_string_lossy().into_owned()],
        Duration::from_millis(200),
    ));

    let scope = CancellationToken::new();
    let first = source.scrape(&scope).await.unwrap();
    assert_eq!(untyped_value(&first), 5.0);

    // Several failing interval runs later, the cache is untouched.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let later = source.scrape(&scope).await.unwrap();
    assert_eq!(later, first);
}
