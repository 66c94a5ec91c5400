//! Integration tests for health-check aggregation.
//!
//! All tests run on paused tokio time, so warm-up polls, check intervals
//! and the min-report ticker advance deterministically.

use async_trait::async_trait;
use rktpod::health::{
    CheckResult, HealthCheckTask, HealthChecks, HealthIndicator, HealthReport, HealthReporter,
    HealthStatus,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Test Doubles
// =============================================================================

/// Indicator that always yields the same result.
struct FixedIndicator {
    status: HealthStatus,
    output: String,
}

#[async_trait]
impl HealthIndicator for FixedIndicator {
    async fn probe(&self) -> CheckResult {
        CheckResult::new(self.status, self.output.clone())
    }
}

/// Reporter that records every report it receives.
#[derive(Default)]
struct RecordingReporter {
    reports: Mutex<Vec<HealthReport>>,
}

impl RecordingReporter {
    fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    fn last(&self) -> HealthReport {
        self.reports.lock().unwrap().last().expect("no report").clone()
    }
}

#[async_trait]
impl HealthReporter for RecordingReporter {
    async fn report(&self, report: &HealthReport) -> rktpod::Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

fn check(name: &str, status: HealthStatus, output: &str) -> HealthCheckTask {
    HealthCheckTask::new(
        name,
        Duration::from_secs(10),
        Arc::new(FixedIndicator {
            status,
            output: output.to_string(),
        }),
    )
}

// =============================================================================
// Empty Checks
// =============================================================================

#[tokio::test(start_paused = true)]
async fn empty_checks_report_running_then_critical() {
    let reporter = Arc::new(RecordingReporter::default());
    let mut checks = HealthChecks::new(reporter.clone(), Duration::from_secs(30), Vec::new());

    checks.start().await;
    assert_eq!(reporter.count(), 1, "start must report exactly once");
    let first = reporter.last();
    assert_eq!(first.status, HealthStatus::Passing);
    assert!(first.output.contains("running"));

    checks.stop().await;
    assert_eq!(reporter.count(), 2, "stop must report exactly once more");
    assert_eq!(reporter.last().status, HealthStatus::Critical);
}

// =============================================================================
// Aggregation Scenarios
// =============================================================================

async fn run_scenario(checks: Vec<HealthCheckTask>) -> (Arc<RecordingReporter>, HealthReport) {
    let reporter = Arc::new(RecordingReporter::default());
    let mut testee = HealthChecks::new(reporter.clone(), Duration::from_secs(30), checks);
    testee.start().await;
    // Warm-up polls finish after 1s; a periodic report fires by 31s.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(reporter.count() > 0, "no report emitted");
    let last = reporter.last();
    testee.stop().await;
    assert_eq!(
        reporter.last().status,
        HealthStatus::Critical,
        "stop must force a critical report"
    );
    (reporter, last)
}

#[tokio::test(start_paused = true)]
async fn all_passing_aggregates_passing() {
    let (_, report) = run_scenario(vec![
        check("ck1", HealthStatus::Passing, "success"),
        check("ck2", HealthStatus::Passing, "success2"),
    ])
    .await;
    assert_eq!(report.status, HealthStatus::Passing);
    assert!(report.output.contains("success"));
}

#[tokio::test(start_paused = true)]
async fn one_warning_aggregates_warning() {
    let (_, report) = run_scenario(vec![
        check("ck1", HealthStatus::Passing, "success1"),
        check("ck2", HealthStatus::Warning, "one warning"),
        check("ck3", HealthStatus::Passing, "success3"),
    ])
    .await;
    assert_eq!(report.status, HealthStatus::Warning);
    assert!(report.output.contains("one warning"));
}

#[tokio::test(start_paused = true)]
async fn one_critical_aggregates_critical() {
    let (_, report) = run_scenario(vec![
        check("ck1", HealthStatus::Passing, "success1"),
        check("ck2", HealthStatus::Critical, "one failed"),
        check("ck3", HealthStatus::Passing, "success3"),
    ])
    .await;
    assert_eq!(report.status, HealthStatus::Critical);
    assert!(report.output.contains("one failed"));
}

#[tokio::test(start_paused = true)]
async fn critical_beats_warning() {
    let (_, report) = run_scenario(vec![
        check("ck1", HealthStatus::Passing, "success1"),
        check("ck2", HealthStatus::Warning, "warn1"),
        check("ck3", HealthStatus::Critical, "critical with warning"),
    ])
    .await;
    assert_eq!(report.status, HealthStatus::Critical);
    assert!(report.output.contains("critical with warning"));
}

#[tokio::test(start_paused = true)]
async fn all_critical_aggregates_critical() {
    let (_, report) = run_scenario(vec![
        check("ck1", HealthStatus::Critical, "failure1"),
        check("ck2", HealthStatus::Critical, "completely failed"),
        check("ck3", HealthStatus::Critical, "failure3"),
    ])
    .await;
    assert_eq!(report.status, HealthStatus::Critical);
    assert!(report.output.contains("completely failed"));
}

// =============================================================================
// Output Format
// =============================================================================

#[tokio::test(start_paused = true)]
async fn single_check_output_is_verbatim() {
    let (_, report) = run_scenario(vec![check("only", HealthStatus::Passing, "all good")]).await;
    assert_eq!(report.output, "all good");
}

#[tokio::test(start_paused = true)]
async fn multiple_checks_get_labelled_lines() {
    let (_, report) = run_scenario(vec![
        check("alpha", HealthStatus::Passing, "a-ok"),
        check("beta", HealthStatus::Warning, "b-warn"),
    ])
    .await;
    let lines: Vec<&str> = report.output.lines().collect();
    assert_eq!(lines[0], "alpha passing - a-ok");
    assert_eq!(lines[1], "beta warning - b-warn");
}

#[tokio::test(start_paused = true)]
async fn empty_check_output_omits_dash() {
    let (_, report) = run_scenario(vec![
        check("alpha", HealthStatus::Passing, ""),
        check("beta", HealthStatus::Passing, "fine"),
    ])
    .await;
    let lines: Vec<&str> = report.output.lines().collect();
    assert_eq!(lines[0], "alpha passing");
    assert_eq!(lines[1], "beta passing - fine");
}

// =============================================================================
// Report Throttling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn quiet_period_reports_on_min_interval() {
    let reporter = Arc::new(RecordingReporter::default());
    let mut testee = HealthChecks::new(
        reporter.clone(),
        Duration::from_secs(30),
        vec![
            check("ck1", HealthStatus::Passing, "success1"),
            check("ck2", HealthStatus::Passing, "success2"),
        ],
    );
    testee.start().await;
    // One status-change report when the aggregate turns passing (~1s),
    // then ticker reports roughly every 30s.
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(reporter.count(), 4, "expected change report + 3 periodic reports");
    assert_eq!(reporter.last().status, HealthStatus::Passing);
    assert!(reporter.last().output.contains("success2"));

    testee.stop().await;
    assert_eq!(reporter.count(), 5, "stop must add exactly one report");
    assert_eq!(reporter.last().status, HealthStatus::Critical);
}

#[tokio::test(start_paused = true)]
async fn zero_min_interval_disables_periodic_reports() {
    let reporter = Arc::new(RecordingReporter::default());
    let mut testee = HealthChecks::new(
        reporter.clone(),
        Duration::ZERO,
        vec![check("ck1", HealthStatus::Passing, "ok")],
    );
    testee.start().await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    // Only the initial critical→passing transition reports.
    assert_eq!(reporter.count(), 1);
    testee.stop().await;
    assert_eq!(reporter.count(), 2);
}
