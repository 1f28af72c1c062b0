//! Corrupt-counter isolation by bisection.
//!
//! When a combined counter command errors or produces no data, any one of
//! the requested counters may be the culprit. Rather than dropping the
//! whole set, [`detect_corrupt_counters`] halves the list against the
//! host until the failing counters are pinned down individually: a half
//! that probes healthy is never split further, so the common case of one
//! bad counter among many costs O(log n) round trips.
//!
//! The algorithm is a pure function over an immutable slice. All network
//! effects live behind the [`CounterProbe`] trait; [`ShellProbe`] is the
//! live implementation and test suites inject scripted ones. The detector
//! itself never returns an error: a probe that fails for any reason
//! counts its counters as corrupt, and the caller decides what to do with
//! the resulting list.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::registry::HostRegistry;
use crate::shell::WinRs;

/// Verdict of one probe round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The group collected at least one sample for every counter
    Healthy,
    /// The group errored or produced no samples
    Failed,
}

/// Queries a host with a group of counters and reports whether the group
/// collects cleanly.
#[async_trait]
pub trait CounterProbe: Send + Sync {
    /// Probe one counter group. Implementations map their own errors to
    /// [`ProbeOutcome::Failed`]; this call does not fail.
    async fn probe(&self, counters: &[String]) -> ProbeOutcome;
}

/// Isolate the corrupt counters within a list known to fail collectively.
///
/// Returns the failing counters in their original order. A healthy half
/// is pruned without further probes; a failing half is split until single
/// counters confirm or clear themselves. An empty input returns an empty
/// list without probing.
pub async fn detect_corrupt_counters(
    probe: &dyn CounterProbe,
    counters: &[String],
) -> Vec<String> {
    let corrupt = bisect(probe, counters).await;
    if !corrupt.is_empty() {
        debug!(
            requested = counters.len(),
            corrupt = corrupt.len(),
            "Bisection isolated corrupt counters"
        );
    }
    corrupt
}

/// Isolate corrupt counters and merge them into the registry's
/// process-lifetime set for the host, so future command construction can
/// pre-exclude them.
pub async fn detect_and_record(
    probe: &dyn CounterProbe,
    registry: &HostRegistry,
    host: &str,
    counters: &[String],
) -> Vec<String> {
    let corrupt = detect_corrupt_counters(probe, counters).await;
    if !corrupt.is_empty() {
        warn!(
            host = %host,
            corrupt = corrupt.len(),
            "Recording corrupt counters for exclusion"
        );
        registry.add_corrupt_counters(host, corrupt.iter().cloned());
    }
    corrupt
}

fn bisect<'a>(
    probe: &'a dyn CounterProbe,
    counters: &'a [String],
) -> BoxFuture<'a, Vec<String>> {
    Box::pin(async move {
        match counters.len() {
            0 => Vec::new(),
            1 => match probe.probe(counters).await {
                ProbeOutcome::Failed => counters.to_vec(),
                ProbeOutcome::Healthy => Vec::new(),
            },
            len => {
                let (left, right) = counters.split_at(len / 2);
                let mut corrupt = Vec::new();
                for half in [left, right] {
                    // A singleton goes straight to the base-case probe;
                    // probing it as a "group" first would ask twice.
                    if half.len() == 1 {
                        corrupt.extend(bisect(probe, half).await);
                    } else if probe.probe(half).await == ProbeOutcome::Failed {
                        corrupt.extend(bisect(probe, half).await);
                    }
                }
                corrupt
            }
        }
    })
}

// ============================================================================
// Live Probe
// ============================================================================

/// Probe backed by a live shell client. Runs a single-sample `typeperf`
/// for the group and treats a command error, a nonzero exit, or an
/// output with no data rows as a failed probe.
pub struct ShellProbe {
    client: Arc<WinRs>,
}

impl ShellProbe {
    pub fn new(client: Arc<WinRs>) -> Self {
        Self { client }
    }

    fn command_line(counters: &[String]) -> String {
        let mut line = String::from("typeperf -sc 1");
        for counter in counters {
            line.push_str(" \"");
            line.push_str(counter);
            line.push('"');
        }
        line
    }
}

#[async_trait]
impl CounterProbe for ShellProbe {
    async fn probe(&self, counters: &[String]) -> ProbeOutcome {
        let line = Self::command_line(counters);
        match self.client.run_command(&line).await {
            Ok(response) if response.success && has_sample_rows(&response.stdout) => {
                ProbeOutcome::Healthy
            }
            Ok(response) => {
                debug!(
                    host = %self.client.host(),
                    counters = counters.len(),
                    exit_code = response.exit_code,
                    "Counter probe produced no samples"
                );
                ProbeOutcome::Failed
            }
            Err(e) => {
                debug!(
                    host = %self.client.host(),
                    counters = counters.len(),
                    error = %e,
                    "Counter probe errored"
                );
                ProbeOutcome::Failed
            }
        }
    }
}

/// `typeperf` CSV output carries a quoted header row followed by quoted
/// data rows; anything less means no counter delivered a sample.
fn has_sample_rows(stdout: &str) -> bool {
    stdout
        .lines()
        .filter(|line| line.trim_start().starts_with('"'))
        .count()
        >= 2
}
