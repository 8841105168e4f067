//! The cross-test leak detection loop.
//!
//! One resume call per iteration; each answer is either a test boundary,
//! which triggers a collect-snapshot-scan cycle, or run completion. The
//! snapshot from one boundary is dropped before the next resume.

use leakwatch_core::{Error, Result, ScanConfig};
use leakwatch_heap::{LeakFinding, LeakScanner, WatchedType};
use serde_json::Value;
use std::io::Write;
use tracing::{debug, info};

use crate::acquirer;
use crate::harness;
use crate::page::{ExecutionContextId, PageSession};
use crate::reporter::{ReportFormat, Reporter, RunCounters, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Connecting,
    AwaitingPageLoad,
    ArmingHarness,
    Advancing,
    AwaitingBoundary,
    Scanning,
    Complete,
    Failed,
}

/// What a resume call reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// One test finished; more may follow.
    TestEnded,
    /// The whole suite finished.
    RunComplete,
}

impl Boundary {
    fn from_done(done: bool) -> Self {
        if done {
            Boundary::RunComplete
        } else {
            Boundary::TestEnded
        }
    }
}

pub struct Controller<'p, P: PageSession + ?Sized, W: Write> {
    page: &'p P,
    scanner: LeakScanner<WatchedType>,
    reporter: Reporter<W>,
    stop_on_first_leak: bool,
    state: RunState,
    scans: usize,
}

impl<'p, P: PageSession + ?Sized, W: Write> Controller<'p, P, W> {
    pub fn new(page: &'p P, scan: &ScanConfig, out: W, format: ReportFormat) -> Self {
        Self {
            page,
            scanner: LeakScanner::new(WatchedType::from_config(scan)),
            reporter: Reporter::new(out, format, scan.max_path_length),
            stop_on_first_leak: scan.stop_on_first_leak,
            state: RunState::Idle,
            scans: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Number of boundary scans performed so far.
    pub fn scans(&self) -> usize {
        self.scans
    }

    pub fn reporter(&self) -> &Reporter<W> {
        &self.reporter
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "Run state");
        self.state = next;
    }

    /// Drive the suite at `url` to completion. Any error is fatal to the run
    /// and leaves the controller in `Failed`.
    pub async fn run(&mut self, url: &str) -> Result<RunOutcome> {
        match self.drive(url).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.transition(RunState::Failed);
                Err(e)
            }
        }
    }

    async fn drive(&mut self, url: &str) -> Result<RunOutcome> {
        let context = self.connect(url).await?;
        self.arm(context).await?;

        loop {
            match self.advance(context).await? {
                Boundary::RunComplete => break,
                Boundary::TestEnded => {
                    let leaks = self.scan_boundary(context).await?;
                    if leaks > 0 && self.stop_on_first_leak {
                        info!(scans = self.scans, "Stopping at first leak");
                        self.transition(RunState::Complete);
                        return self.reporter.abandon();
                    }
                }
            }
        }

        let counters = self.read_counters(context).await?;
        self.transition(RunState::Complete);
        info!(
            scans = self.scans,
            leaks = self.reporter.leak_count(),
            total = counters.total,
            "Run complete"
        );
        self.reporter.finish(counters)
    }

    /// Register the harness bootstrap, navigate, and wait for the page's
    /// execution context.
    pub async fn connect(&mut self, url: &str) -> Result<ExecutionContextId> {
        self.transition(RunState::Connecting);
        self.page.prepare(harness::BOOTSTRAP).await?;

        self.transition(RunState::AwaitingPageLoad);
        let context = self.page.open(url).await?;
        info!(url = %url, context = context.0, "Connected to page");
        Ok(context)
    }

    /// Check the test runner entry points and hook the harness into them.
    pub async fn arm(&mut self, context: ExecutionContextId) -> Result<()> {
        self.transition(RunState::ArmingHarness);

        let missing = self
            .page
            .evaluate(context, harness::CAPABILITY_CHECK, false)
            .await?
            .into_value("capability check")?;
        let missing: Vec<String> = match missing {
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect(),
            other => {
                return Err(Error::UnexpectedResult {
                    context: "capability check".to_string(),
                    value: other,
                })
            }
        };
        if !missing.is_empty() {
            return Err(Error::MissingCapability(format!(
                "page does not provide {}",
                missing.join(", ")
            )));
        }

        let attached = self
            .page
            .run_script(context, harness::ATTACH, harness::ATTACH_SOURCE_URL)
            .await?
            .into_value("harness install")?;
        if attached != Value::Bool(true) {
            return Err(Error::UnexpectedResult {
                context: "harness install".to_string(),
                value: attached,
            });
        }
        info!("Harness armed");
        Ok(())
    }

    /// Resume the runner and wait for exactly one boundary or completion.
    pub async fn advance(&mut self, context: ExecutionContextId) -> Result<Boundary> {
        self.transition(RunState::Advancing);
        let page = self.page;
        let resumed = page.evaluate(context, harness::RESUME, true);
        self.transition(RunState::AwaitingBoundary);
        let evaluation = resumed.await?;

        if let Some(details) = evaluation.exception {
            return Err(Error::ScriptEvaluation {
                context: "resume".to_string(),
                details,
            });
        }
        let is_boolean = evaluation.result.get("type").and_then(|v| v.as_str()) == Some("boolean");
        match evaluation.result.get("value") {
            Some(Value::Bool(done)) if is_boolean => Ok(Boundary::from_done(*done)),
            _ => Err(Error::UnexpectedResult {
                context: "resume".to_string(),
                value: evaluation.result,
            }),
        }
    }

    /// Collect, snapshot and scan at a test boundary. Returns the number of
    /// findings.
    async fn scan_boundary(&mut self, context: ExecutionContextId) -> Result<usize> {
        self.transition(RunState::Scanning);
        self.scans += 1;

        let test = self.current_test(context).await?;
        let snapshot = acquirer::capture(self.page).await?;
        let findings: Vec<LeakFinding> = self.scanner.scan(&snapshot).collect();
        debug!(
            boundary = self.scans,
            test = test.as_deref().unwrap_or("?"),
            findings = findings.len(),
            "Boundary scanned"
        );
        self.reporter.record(test.as_deref(), &snapshot, findings)
    }

    async fn current_test(&self, context: ExecutionContextId) -> Result<Option<String>> {
        let value = self
            .page
            .evaluate(context, harness::CURRENT_TEST, false)
            .await?
            .into_value("current test")?;
        let module = value.get("module").and_then(|v| v.as_str()).unwrap_or("");
        let name = value.get("name").and_then(|v| v.as_str()).unwrap_or("");
        Ok(match (module.is_empty(), name.is_empty()) {
            (_, true) => None,
            (true, false) => Some(name.to_string()),
            (false, false) => Some(format!("{} > {}", module, name)),
        })
    }

    async fn read_counters(&self, context: ExecutionContextId) -> Result<RunCounters> {
        let value = self
            .page
            .evaluate(context, harness::RUN_COUNTS, false)
            .await?
            .into_value("run counters")?;
        serde_json::from_value(value.clone()).map_err(|_| Error::UnexpectedResult {
            context: "run counters".to_string(),
            value,
        })
    }
}
