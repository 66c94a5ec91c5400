//! Concurrent health-check aggregation.
//!
//! One probe task per check publishes results on a status channel; a single
//! reporter task owns the aggregate state, folds updates into it and
//! forwards reports, throttled by a minimum report interval. The aggregate
//! status is always the worst currently-known per-check status.

use crate::constants::{
    INDICATOR_KILL_GRACE, WARMUP_INTERVAL_CEILING, WARMUP_POLLS,
};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

// =============================================================================
// Status Types
// =============================================================================

/// Health state of a check or of the whole pod, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
}

impl HealthStatus {
    /// Severity order used by the aggregate: critical > warning > passing.
    const LADDER: [HealthStatus; 3] =
        [HealthStatus::Critical, HealthStatus::Warning, HealthStatus::Passing];

    fn index(self) -> usize {
        match self {
            HealthStatus::Passing => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Critical => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One probe outcome.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub status: HealthStatus,
    pub output: String,
}

impl CheckResult {
    pub fn new(status: HealthStatus, output: impl Into<String>) -> Self {
        Self {
            status,
            output: output.into(),
        }
    }
}

/// The aggregated pod health forwarded to the reporter.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub output: String,
}

// =============================================================================
// Seams
// =============================================================================

/// Runs one probe and yields its outcome. Never fails; failures are
/// critical results.
#[async_trait]
pub trait HealthIndicator: Send + Sync {
    async fn probe(&self) -> CheckResult;
}

/// Receives aggregated reports, typically forwarding them to the registry.
#[async_trait]
pub trait HealthReporter: Send + Sync {
    async fn report(&self, report: &HealthReport) -> crate::error::Result<()>;
}

/// One configured check: a named indicator probed at an interval.
pub struct HealthCheckTask {
    name: String,
    interval: Duration,
    indicator: Arc<dyn HealthIndicator>,
}

impl HealthCheckTask {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        indicator: Arc<dyn HealthIndicator>,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            indicator,
        }
    }
}

// =============================================================================
// Aggregator
// =============================================================================

struct Update {
    index: usize,
    status: HealthStatus,
    output: String,
}

/// Aggregate state owned by the reporter task.
struct Aggregate {
    status: HealthStatus,
    results: Vec<Update>,
    counts: [usize; 3],
}

impl Aggregate {
    fn new(names: &[String]) -> Self {
        Self {
            status: HealthStatus::Critical,
            results: names
                .iter()
                .enumerate()
                .map(|(index, _)| Update {
                    index,
                    status: HealthStatus::Critical,
                    output: "starting".to_string(),
                })
                .collect(),
            counts: [0, 0, names.len()],
        }
    }

    /// Folds one probe result in; true when the aggregate status changed.
    fn update(&mut self, update: Update) -> bool {
        let slot = &mut self.results[update.index];
        if slot.status != update.status {
            self.counts[slot.status.index()] -= 1;
            self.counts[update.status.index()] += 1;
        }
        *slot = update;
        let status = HealthStatus::LADDER
            .into_iter()
            .find(|s| self.counts[s.index()] > 0)
            .unwrap_or(HealthStatus::Passing);
        let changed = status != self.status;
        self.status = status;
        changed
    }

    fn report(&self, names: &[String]) -> HealthReport {
        HealthReport {
            status: self.status,
            output: self.combined_output(names),
        }
    }

    /// A single check reports its output verbatim; multiple checks get a
    /// `name status - output` line each, with nested newlines indented.
    fn combined_output(&self, names: &[String]) -> String {
        match self.results.len() {
            0 => return "running".to_string(),
            1 => return self.results[0].output.clone(),
            _ => {}
        }
        self.results
            .iter()
            .map(|r| {
                if r.output.is_empty() {
                    format!("{} {}", names[r.index], r.status)
                } else {
                    format!("{} {} - {}", names[r.index], r.status, r.output.replace('\n', "\n  "))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Concurrent check runner and report throttle.
///
/// `start` spawns one task per check plus a reporter task; `stop` tears them
/// down and emits exactly one final critical report.
pub struct HealthChecks {
    checks: Vec<HealthCheckTask>,
    reporter: Arc<dyn HealthReporter>,
    min_report_interval: Duration,
    cancel: CancellationToken,
    muted: Arc<AtomicBool>,
    status_tx: Option<mpsc::Sender<Update>>,
    probe_handles: Vec<JoinHandle<()>>,
    reporter_handle: Option<JoinHandle<Aggregate>>,
    names: Vec<String>,
}

impl HealthChecks {
    pub fn new(
        reporter: Arc<dyn HealthReporter>,
        min_report_interval: Duration,
        checks: Vec<HealthCheckTask>,
    ) -> Self {
        let names = checks.iter().map(|c| c.name.clone()).collect();
        Self {
            checks,
            reporter,
            min_report_interval,
            cancel: CancellationToken::new(),
            muted: Arc::new(AtomicBool::new(false)),
            status_tx: None,
            probe_handles: Vec::new(),
            reporter_handle: None,
            names,
        }
    }

    /// Spawns the reporter and all probe tasks. With no checks configured a
    /// single `(passing, running)` report goes out immediately.
    pub async fn start(&mut self) {
        assert!(self.status_tx.is_none(), "health checks already started");
        debug!("starting health checks");

        let mut aggregate = Aggregate::new(&self.names);
        if self.checks.is_empty() {
            aggregate.status = HealthStatus::Passing;
            let report = HealthReport {
                status: HealthStatus::Passing,
                output: "running".to_string(),
            };
            self.emit(&report).await;
        }

        let (tx, rx) = mpsc::channel(self.checks.len().max(1));
        self.status_tx = Some(tx.clone());

        debug!("starting health reporter");
        self.reporter_handle = Some(tokio::spawn(reporter_task(
            aggregate,
            self.names.clone(),
            rx,
            Arc::clone(&self.reporter),
            self.min_report_interval,
            Arc::clone(&self.muted),
        )));

        for (index, check) in self.checks.iter().enumerate() {
            debug!("starting check {:?}", check.name);
            self.probe_handles.push(tokio::spawn(probe_task(
                index,
                check.interval,
                Arc::clone(&check.indicator),
                tx.clone(),
                self.cancel.clone(),
            )));
        }
    }

    /// Cancels every probe, drains the status channel and emits one final
    /// critical report.
    pub async fn stop(&mut self) {
        debug!("stopping health checks");
        self.muted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        for handle in self.probe_handles.drain(..) {
            if let Err(e) = handle.await {
                error!("health check task panicked: {e}");
            }
        }
        // Dropping the last sender ends the reporter's receive loop.
        self.status_tx = None;
        let Some(handle) = self.reporter_handle.take() else {
            return;
        };
        match handle.await {
            Ok(mut aggregate) => {
                aggregate.status = HealthStatus::Critical;
                self.emit(&aggregate.report(&self.names)).await;
            }
            Err(e) => error!("health reporter task panicked: {e}"),
        }
    }

    async fn emit(&self, report: &HealthReport) {
        if let Err(e) = self.reporter.report(report).await {
            error!("health reporter: {e}");
        }
    }
}

async fn reporter_task(
    mut aggregate: Aggregate,
    names: Vec<String>,
    mut rx: mpsc::Receiver<Update>,
    reporter: Arc<dyn HealthReporter>,
    min_report_interval: Duration,
    muted: Arc<AtomicBool>,
) -> Aggregate {
    let periodic = min_report_interval > Duration::ZERO;
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + min_report_interval.max(Duration::from_millis(1)),
        min_report_interval.max(Duration::from_millis(1)),
    );
    loop {
        tokio::select! {
            update = rx.recv() => {
                let Some(update) = update else { break };
                debug!("check {:?} {}", names[update.index], update.status);
                if aggregate.update(update) {
                    ticker.reset();
                    emit(&reporter, &aggregate.report(&names), &muted).await;
                }
            }
            _ = ticker.tick(), if periodic => {
                emit(&reporter, &aggregate.report(&names), &muted).await;
            }
        }
    }
    aggregate
}

async fn emit(reporter: &Arc<dyn HealthReporter>, report: &HealthReport, muted: &AtomicBool) {
    if muted.load(Ordering::SeqCst) {
        return;
    }
    if let Err(e) = reporter.report(report).await {
        error!("health reporter: {e}");
    }
}

/// Probes warm up quickly (up to [`WARMUP_POLLS`] short polls, ending early
/// on the first non-critical result), then settle on their interval. Every
/// poll publishes; cancellation publishes a final critical result.
async fn probe_task(
    index: usize,
    interval: Duration,
    indicator: Arc<dyn HealthIndicator>,
    tx: mpsc::Sender<Update>,
    cancel: CancellationToken,
) {
    let send = |r: CheckResult| {
        let tx = tx.clone();
        async move {
            let _ = tx
                .send(Update {
                    index,
                    status: r.status,
                    output: r.output,
                })
                .await;
        }
    };

    let warmup_interval = interval.min(WARMUP_INTERVAL_CEILING);
    for _ in 0..WARMUP_POLLS {
        tokio::select! {
            _ = tokio::time::sleep(warmup_interval) => {
                let r = indicator.probe().await;
                let ok = r.status != HealthStatus::Critical;
                send(r).await;
                if ok {
                    break;
                }
            }
            _ = cancel.cancelled() => {
                send(CheckResult::new(HealthStatus::Critical, "check terminated")).await;
                return;
            }
        }
    }

    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + interval,
        interval,
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                send(indicator.probe().await).await;
            }
            _ = cancel.cancelled() => {
                send(CheckResult::new(HealthStatus::Critical, "check terminated")).await;
                return;
            }
        }
    }
}

// =============================================================================
// Exec Indicator
// =============================================================================

/// Probe that runs a command (typically `rkt enter …`) and maps its exit
/// status onto a health status, with stderr as the output.
pub struct CommandIndicator {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandIndicator {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        assert!(!argv.is_empty(), "indicator needs a command");
        Self { argv, timeout }
    }
}

#[async_trait]
impl HealthIndicator for CommandIndicator {
    async fn probe(&self) -> CheckResult {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CheckResult::new(
                    HealthStatus::Critical,
                    format!("cannot start health check indicator: {e}"),
                );
            }
        };
        let pid = child.id();
        let mut stderr = child.stderr.take().expect("stderr was requested");

        let outcome = tokio::time::timeout(self.timeout, async {
            let mut output = Vec::new();
            let _ = stderr.read_to_end(&mut output).await;
            let status = child.wait().await;
            (output, status)
        })
        .await;

        match outcome {
            Ok((output, status)) => {
                let output = String::from_utf8_lossy(&output).trim_matches('\n').to_string();
                match status {
                    Ok(s) if s.success() => CheckResult::new(HealthStatus::Passing, output),
                    Ok(s) => {
                        let output = if output.is_empty() { s.to_string() } else { output };
                        CheckResult::new(HealthStatus::Critical, output)
                    }
                    Err(e) => CheckResult::new(HealthStatus::Critical, e.to_string()),
                }
            }
            Err(_) => {
                // The process group catches helpers the indicator spawned.
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGINT);
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
                let tail = tokio::time::timeout(INDICATOR_KILL_GRACE, async {
                    let mut output = Vec::new();
                    let _ = stderr.read_to_end(&mut output).await;
                    let _ = child.wait().await;
                    output
                })
                .await
                .unwrap_or_default();
                let tail = String::from_utf8_lossy(&tail).trim_matches('\n').to_string();
                CheckResult::new(HealthStatus::Critical, format!("indicator timed out - {tail}"))
            }
        }
    }
}
