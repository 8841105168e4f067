//! Leak diagnostics and the end-of-run summary.

use leakwatch_core::{Error, Result};
use leakwatch_heap::{HeapSnapshot, LeakFinding, Retention};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::warn;

/// Suite tallies as reported by the test runner at run end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub todo: u64,
    pub total: u64,
}

/// An owned record of one finding, detached from its snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakReport {
    /// 1-based index of the test boundary the snapshot was taken at.
    pub boundary: usize,
    pub test: Option<String>,
    pub node_id: u64,
    pub name: String,
    pub self_size: u64,
    pub retained_size: u64,
    /// Root-first rendering of the retaining path; `None` when no path exists.
    pub path: Option<String>,
    pub path_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    /// `None` when the run stopped before the runner reported its tallies.
    pub counters: Option<RunCounters>,
    pub leaks: Vec<LeakReport>,
    pub boundaries: usize,
    pub success: bool,
}

impl RunOutcome {
    pub fn leak_count(&self) -> usize {
        self.leaks.len()
    }
}

pub struct Reporter<W: Write> {
    out: W,
    format: ReportFormat,
    max_path_length: usize,
    leaks: Vec<LeakReport>,
    boundaries: usize,
    finished: bool,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, format: ReportFormat, max_path_length: usize) -> Self {
        Self {
            out,
            format,
            max_path_length,
            leaks: Vec::new(),
            boundaries: 0,
            finished: false,
        }
    }

    pub fn leak_count(&self) -> usize {
        self.leaks.len()
    }

    pub fn leaks(&self) -> &[LeakReport] {
        &self.leaks
    }

    pub fn writer(&self) -> &W {
        &self.out
    }

    /// Record the findings of one boundary's scan. Returns how many there were.
    pub fn record<'s, I>(
        &mut self,
        test: Option<&str>,
        snapshot: &'s HeapSnapshot,
        findings: I,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = LeakFinding<'s>>,
    {
        self.boundaries += 1;
        let mut recorded = 0;
        for finding in findings {
            let report = LeakReport {
                boundary: self.boundaries,
                test: test.map(|t| t.to_string()),
                node_id: finding.node.id(),
                name: finding.node.name().to_string(),
                self_size: finding.node.self_size(),
                retained_size: finding.node.retained_size(),
                path: finding
                    .retention
                    .path()
                    .map(|p| p.render(snapshot, self.max_path_length)),
                path_length: finding.retention.path().map_or(0, |p| p.len()),
            };
            if finding.retention == Retention::Unreachable {
                warn!(
                    node = %finding.node,
                    boundary = self.boundaries,
                    "Watched instance has no path to root"
                );
            } else {
                warn!(
                    node = %finding.node,
                    boundary = self.boundaries,
                    path_length = report.path_length,
                    "Watched instance still retained"
                );
            }
            if self.format == ReportFormat::Text {
                self.write_leak(&report)?;
            }
            self.leaks.push(report);
            recorded += 1;
        }
        Ok(recorded)
    }

    fn write_leak(&mut self, report: &LeakReport) -> Result<()> {
        let test = report
            .test
            .as_deref()
            .map(|t| format!(" \"{}\"", t))
            .unwrap_or_default();
        writeln!(
            self.out,
            "LEAK after test #{}{}: {} @{} (self {} B, retained {} B)",
            report.boundary, test, report.name, report.node_id, report.self_size, report.retained_size
        )?;
        match &report.path {
            Some(path) => writeln!(self.out, "  retained by: {}", path)?,
            None => writeln!(self.out, "  no path to root (unreachable in this snapshot)")?,
        }
        Ok(())
    }

    /// Emit the final tallies. Allowed once per run.
    pub fn finish(&mut self, counters: RunCounters) -> Result<RunOutcome> {
        self.conclude(Some(counters))
    }

    /// Close a run that stopped early; no tallies are reported.
    pub fn abandon(&mut self) -> Result<RunOutcome> {
        self.conclude(None)
    }

    fn conclude(&mut self, counters: Option<RunCounters>) -> Result<RunOutcome> {
        if self.finished {
            return Err(Error::Other("Run results were already reported".to_string()));
        }
        self.finished = true;

        let tests_ok = counters.map_or(true, |c| c.failed == 0);
        let outcome = RunOutcome {
            counters,
            leaks: self.leaks.clone(),
            boundaries: self.boundaries,
            success: self.leaks.is_empty() && tests_ok,
        };

        match self.format {
            ReportFormat::Text => {
                if let Some(c) = counters {
                    writeln!(self.out, "Passed: {}", c.passed)?;
                    writeln!(self.out, "Failed: {}", c.failed)?;
                    writeln!(self.out, "Skipped: {}", c.skipped)?;
                    writeln!(self.out, "Todo: {}", c.todo)?;
                    writeln!(self.out, "Total: {}", c.total)?;
                } else {
                    writeln!(self.out, "Run stopped after test #{}", self.boundaries)?;
                }
                writeln!(self.out, "Leaks: {}", outcome.leaks.len())?;
                writeln!(
                    self.out,
                    "Result: {}",
                    if outcome.success { "PASS" } else { "FAIL" }
                )?;
            }
            ReportFormat::Json => {
                serde_json::to_writer_pretty(&mut self.out, &outcome)?;
                writeln!(self.out)?;
            }
        }
        self.out.flush()?;
        Ok(outcome)
    }
}
