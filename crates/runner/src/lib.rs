pub mod acquirer;
pub mod controller;
pub mod harness;
pub mod page;
pub mod reporter;

#[cfg(test)]
mod testing;

pub use controller::{Boundary, Controller, RunState};
pub use page::{CdpPage, Evaluation, ExecutionContextId, PageSession, SnapshotEvent};
pub use reporter::{LeakReport, ReportFormat, Reporter, RunCounters, RunOutcome};
