//! Long-running counter collection sessions.
//!
//! A command line has a bounded length, so a large performance-counter
//! set cannot ride a single `typeperf` invocation. [`CounterSession`]
//! shards the counter list across as many command lines as the length
//! cap requires, runs each shard as an independent long-running command
//! in its own shell, and merges their output streams back into one
//! logical sample stream per receive cycle.
//!
//! The session is a small state machine (STOPPED → STARTING → STARTED →
//! STOPPING → STOPPED). Transitions are serialized; calling an operation
//! in a state that does not permit it returns
//! [`WinRmError::IllegalState`]. A `stop` issued while a start is still
//! fanning out cancels the start, which rolls back the shards it
//! already created.
//!
//! Receive cycles are bounded-failure: consecutive cycles in which no
//! shard delivers (network failures, or clean but empty answers) are
//! counted, and crossing the configured threshold tears the session
//! down with [`WinRmError::SessionExhausted`]. The caller decides when
//! to start fresh; nothing here retries forever.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bisect::{detect_and_record, ShellProbe};
use crate::error::{WinRmError, WinRmResult};
use crate::registry::HostRegistry;
use crate::shell::{LongRunningCommand, WinRs};

// ============================================================================
// Configuration
// ============================================================================

fn default_max_command_len() -> usize {
    2047
}

fn default_max_network_failures() -> u32 {
    3
}

fn default_max_empty_receives() -> u32 {
    3
}

fn default_receive_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_sample_marker() -> String {
    // First CSV cell of a typeperf header row.
    "\"(PDH-CSV".to_string()
}

/// Tuning for a collection session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Longest command line a single shard may render
    #[serde(default = "default_max_command_len")]
    pub max_command_len: usize,
    /// Consecutive failed receive cycles tolerated before the session is
    /// torn down
    #[serde(default = "default_max_network_failures")]
    pub max_network_failures: u32,
    /// Consecutive clean-but-empty receive cycles tolerated before the
    /// session is torn down
    #[serde(default = "default_max_empty_receives")]
    pub max_empty_receives: u32,
    /// Deadline for one receive fan-out across all shards. Must exceed
    /// the transport's request timeout so the HTTP layer fails first.
    #[serde(with = "humantime_serde", default = "default_receive_timeout")]
    pub receive_timeout: Duration,
    /// Line prefix marking a sample boundary in command output. During a
    /// merge, marker lines are kept only from the first shard.
    #[serde(default = "default_sample_marker")]
    pub sample_marker: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_command_len: default_max_command_len(),
            max_network_failures: default_max_network_failures(),
            max_empty_receives: default_max_empty_receives(),
            receive_timeout: default_receive_timeout(),
            sample_marker: default_sample_marker(),
        }
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// Lifecycle state of a collection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginState {
    /// No shards exist; `start` is legal
    Stopped,
    /// `start` is fanning out shard creation
    Starting,
    /// All shards run; `receive` is legal
    Started,
    /// Shards are being signalled and deleted
    Stopping,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginState::Stopped => "STOPPED",
            PluginState::Starting => "STARTING",
            PluginState::Started => "STARTED",
            PluginState::Stopping => "STOPPING",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Command Construction
// ============================================================================

/// Renders the remote command line for one shard of counter paths.
pub trait CommandBuilder: Send + Sync {
    /// Render the command line collecting the given counters.
    fn build(&self, counters: &[String]) -> String;

    /// Reject counter paths the command line cannot carry.
    fn validate(&self, counter: &str) -> WinRmResult<()>;
}

/// Builds `typeperf` invocations: `typeperf -si <interval> "<counter>" …`
/// streaming CSV samples until terminated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeperfBuilder {
    /// Sample interval in seconds
    pub interval_secs: u32,
}

impl TypeperfBuilder {
    pub fn new(interval_secs: u32) -> Self {
        Self { interval_secs }
    }
}

impl CommandBuilder for TypeperfBuilder {
    fn build(&self, counters: &[String]) -> String {
        let mut line = format!("typeperf -si {}", self.interval_secs);
        for counter in counters {
            line.push_str(" \"");
            line.push_str(counter);
            line.push('"');
        }
        line
    }

    fn validate(&self, counter: &str) -> WinRmResult<()> {
        if counter.trim().is_empty() {
            return Err(WinRmError::InvalidParameter(
                "counter path is empty".to_string(),
            ));
        }
        // The path is wrapped in double quotes on the command line, and
        // cmd offers no escape for a quote inside them.
        if counter.contains('"') {
            return Err(WinRmError::InvalidParameter(format!(
                "counter path cannot be quoted for the command line: {counter}"
            )));
        }
        Ok(())
    }
}

/// Greedily pack counters into shards whose rendered command lines stay
/// within `max_command_len`. Counter order is preserved across the shard
/// boundaries.
pub fn plan_shards(
    builder: &dyn CommandBuilder,
    counters: &[String],
    max_command_len: usize,
) -> WinRmResult<Vec<Vec<String>>> {
    let mut shards: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for counter in counters {
        builder.validate(counter)?;
        if builder.build(std::slice::from_ref(counter)).len() > max_command_len {
            return Err(WinRmError::InvalidParameter(format!(
                "counter path does not fit within the {max_command_len}-character command line: {counter}"
            )));
        }
        if !current.is_empty() {
            let mut trial = current.clone();
            trial.push(counter.clone());
            if builder.build(&trial).len() > max_command_len {
                shards.push(std::mem::take(&mut current));
            }
        }
        current.push(counter.clone());
    }
    if !current.is_empty() {
        shards.push(current);
    }
    Ok(shards)
}

fn is_sample_marker(line: &str, marker: &str) -> bool {
    !marker.is_empty() && line.trim_start().starts_with(marker)
}

// ============================================================================
// Session Manager
// ============================================================================

struct Inner {
    counters: Vec<String>,
    shards: Vec<LongRunningCommand>,
    failures: u32,
    empty_receives: u32,
}

/// Manages one group of sharded long-running collection commands.
pub struct CounterSession {
    client: Arc<WinRs>,
    registry: Arc<HostRegistry>,
    builder: Arc<dyn CommandBuilder>,
    config: SessionConfig,
    state: Mutex<PluginState>,
    cancel: Mutex<CancellationToken>,
    inner: tokio::sync::Mutex<Inner>,
}

impl CounterSession {
    pub fn new(
        client: Arc<WinRs>,
        registry: Arc<HostRegistry>,
        builder: Arc<dyn CommandBuilder>,
        counters: Vec<String>,
        config: SessionConfig,
    ) -> Self {
        Self {
            client,
            registry,
            builder,
            config,
            state: Mutex::new(PluginState::Stopped),
            cancel: Mutex::new(CancellationToken::new()),
            inner: tokio::sync::Mutex::new(Inner {
                counters,
                shards: Vec::new(),
                failures: 0,
                empty_receives: 0,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PluginState {
        *self.state.lock()
    }

    /// Host the session collects from.
    pub fn host(&self) -> &str {
        self.client.host()
    }

    /// Number of live shards. Zero unless the session is started.
    pub async fn shard_count(&self) -> usize {
        self.inner.lock().await.shards.len()
    }

    /// Replace the requested counter set. Legal only while stopped; the
    /// shard plan is recomputed on the next start.
    pub async fn update_counters(&self, counters: Vec<String>) -> WinRmResult<()> {
        let mut inner = self.inner.lock().await;
        let state = *self.state.lock();
        if state != PluginState::Stopped {
            return Err(WinRmError::illegal_state(state, "update_counters"));
        }
        inner.counters = counters;
        Ok(())
    }

    /// Start collection: exclude known-corrupt counters, plan shards,
    /// and fan out one long-running command per shard. All shards must
    /// start; a partial start is rolled back and the session returns to
    /// STOPPED.
    pub async fn start(&self) -> WinRmResult<()> {
        {
            let mut state = self.state.lock();
            if *state != PluginState::Stopped {
                return Err(WinRmError::illegal_state(*state, "start"));
            }
            *state = PluginState::Starting;
        }
        let cancel = {
            let mut guard = self.cancel.lock();
            *guard = CancellationToken::new();
            guard.clone()
        };

        let mut inner = self.inner.lock().await;
        match self.start_shards(&mut inner, &cancel).await {
            Ok(()) => {
                let mut state = self.state.lock();
                if *state == PluginState::Starting {
                    *state = PluginState::Started;
                    inner.failures = 0;
                    inner.empty_receives = 0;
                    Ok(())
                } else {
                    // A stop raced in; it drains the shards we stored.
                    Err(WinRmError::illegal_state(*state, "start"))
                }
            }
            Err(e) => {
                let mut state = self.state.lock();
                if *state == PluginState::Starting {
                    *state = PluginState::Stopped;
                }
                Err(e)
            }
        }
    }

    async fn start_shards(
        &self,
        inner: &mut Inner,
        cancel: &CancellationToken,
    ) -> WinRmResult<()> {
        let host = self.client.host();

        let active: Vec<String> = inner
            .counters
            .iter()
            .filter(|counter| !self.registry.is_corrupt(host, counter))
            .cloned()
            .collect();
        let excluded = inner.counters.len() - active.len();
        if excluded > 0 {
            debug!(host = %host, excluded, "Excluding counters known corrupt");
        }
        if active.is_empty() {
            return Err(WinRmError::InvalidParameter(
                "no counters left to collect after excluding known-corrupt paths".to_string(),
            ));
        }

        let plan = plan_shards(self.builder.as_ref(), &active, self.config.max_command_len)?;
        debug!(
            host = %host,
            counters = active.len(),
            shards = plan.len(),
            "Starting collection session"
        );

        if cancel.is_cancelled() {
            return Err(WinRmError::illegal_state(PluginState::Stopping, "start"));
        }

        // Each shard start races the cancellation token, so a stop lands
        // within one poll instead of waiting out the slowest shard.
        let starts = plan.iter().map(|shard| {
            let line = self.builder.build(shard);
            async move {
                tokio::select! {
                    result = self.client.start(&line) => Some(result),
                    () = cancel.cancelled() => None,
                }
            }
        });
        let results = join_all(starts).await;

        let mut shards = Vec::with_capacity(results.len());
        let mut first_error = None;
        let mut cancelled = false;
        for result in results {
            match result {
                Some(Ok(command)) => shards.push(command),
                Some(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                None => cancelled = true,
            }
        }

        if cancelled || cancel.is_cancelled() {
            debug!(
                host = %host,
                started = shards.len(),
                "Session start cancelled; rolling back"
            );
            for shard in &shards {
                self.client.stop(shard).await;
            }
            return Err(WinRmError::illegal_state(PluginState::Stopping, "start"));
        }

        if let Some(e) = first_error {
            warn!(
                host = %host,
                started = shards.len(),
                error = %e,
                "Session start failed; rolling back started shards"
            );
            for shard in &shards {
                self.client.stop(shard).await;
            }
            return Err(e);
        }

        inner.shards = shards;
        Ok(())
    }

    /// One receive cycle: fan a receive across all shards, merge the
    /// lines in shard order, and account the cycle against the failure
    /// budgets.
    ///
    /// Partial success is tolerated: a failed shard is logged and its
    /// data skipped, but the surviving shards' lines are still returned.
    /// Only when no shard delivers for the configured number of
    /// consecutive cycles does the session tear itself down and return
    /// [`WinRmError::SessionExhausted`].
    pub async fn receive(&self) -> WinRmResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        {
            let state = *self.state.lock();
            if state != PluginState::Started {
                return Err(WinRmError::illegal_state(state, "receive"));
            }
        }

        let host = self.client.host().to_string();
        let deadline = self.config.receive_timeout;
        let client = &self.client;
        let receives = inner.shards.iter_mut().map(|shard| async move {
            match tokio::time::timeout(deadline, client.receive(shard)).await {
                Ok(result) => result,
                Err(_) => Err(WinRmError::Timeout {
                    host: client.host().to_string(),
                    after: deadline,
                }),
            }
        });
        let results = join_all(receives).await;

        let marker = self.config.sample_marker.clone();
        let mut merged: Vec<String> = Vec::new();
        let mut successes = 0usize;
        let mut any_output = false;
        let mut last_error: Option<WinRmError> = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(lines) => {
                    successes += 1;
                    if !lines.is_empty() {
                        any_output = true;
                    }
                    if index == 0 {
                        merged.extend(lines);
                    } else {
                        merged.extend(
                            lines
                                .into_iter()
                                .filter(|line| !is_sample_marker(line, &marker)),
                        );
                    }
                }
                Err(e) => {
                    warn!(host = %host, shard = index, error = %e, "Shard receive failed");
                    last_error = Some(e);
                }
            }
        }

        if successes == 0 {
            if let Some(error) = last_error {
                inner.failures += 1;
                debug!(
                    host = %host,
                    consecutive = inner.failures,
                    "Receive cycle failed on every shard"
                );
                if inner.failures >= self.config.max_network_failures {
                    let failures = inner.failures;
                    self.force_stop(&mut inner).await;
                    return Err(WinRmError::SessionExhausted {
                        host,
                        failures,
                        cause: error.to_string(),
                    });
                }
            }
        } else {
            inner.failures = 0;
            if last_error.is_none() && !any_output {
                inner.empty_receives += 1;
                debug!(
                    host = %host,
                    consecutive = inner.empty_receives,
                    "Receive cycle produced no output"
                );
                if inner.empty_receives >= self.config.max_empty_receives {
                    let failures = inner.empty_receives;
                    self.force_stop(&mut inner).await;
                    return Err(WinRmError::SessionExhausted {
                        host,
                        failures,
                        cause: "no shard produced output".to_string(),
                    });
                }
            } else if any_output {
                inner.empty_receives = 0;
            }
        }

        trace!(host = %host, lines = merged.len(), "Receive cycle merged");
        Ok(merged)
    }

    /// Stop collection: terminate every shard and delete its shell.
    ///
    /// Idempotent: stopping a stopped session is a no-op and touches no
    /// network. A stop during STARTING cancels the in-flight start and
    /// unwinds whatever it had created.
    pub async fn stop(&self) {
        let prior = {
            let mut state = self.state.lock();
            match *state {
                PluginState::Stopped | PluginState::Stopping => {
                    debug!(
                        host = %self.client.host(),
                        state = %*state,
                        "Stop requested on inactive session"
                    );
                    return;
                }
                prior => {
                    *state = PluginState::Stopping;
                    prior
                }
            }
        };
        if prior == PluginState::Starting {
            self.cancel.lock().cancel();
        }

        let mut inner = self.inner.lock().await;
        let shards: Vec<LongRunningCommand> = inner.shards.drain(..).collect();
        debug!(
            host = %self.client.host(),
            shards = shards.len(),
            "Stopping session"
        );
        for shard in &shards {
            self.client.stop(shard).await;
        }
        inner.failures = 0;
        inner.empty_receives = 0;
        *self.state.lock() = PluginState::Stopped;
    }

    /// Bisect the session's counter set against the host to isolate
    /// counters the host cannot collect, and record them for exclusion
    /// from future starts.
    ///
    /// Intended after a start fails outright or after receives exhaust
    /// the session: legal only while STOPPED, since the probes run their
    /// own short-lived shells. Returns the corrupt counters found; never
    /// fails on account of the probes themselves.
    pub async fn isolate_corrupt_counters(&self) -> WinRmResult<Vec<String>> {
        let inner = self.inner.lock().await;
        {
            let state = *self.state.lock();
            if state != PluginState::Stopped {
                return Err(WinRmError::illegal_state(state, "isolate_corrupt_counters"));
            }
        }

        let probe = ShellProbe::new(Arc::clone(&self.client));
        let corrupt = detect_and_record(
            &probe,
            &self.registry,
            self.client.host(),
            &inner.counters,
        )
        .await;
        Ok(corrupt)
    }

    /// Tear down after the failure budget is spent. Runs with the inner
    /// lock already held.
    async fn force_stop(&self, inner: &mut Inner) {
        warn!(
            host = %self.client.host(),
            "Session exhausted its failure budget; stopping all shards"
        );
        *self.state.lock() = PluginState::Stopping;
        let shards: Vec<LongRunningCommand> = inner.shards.drain(..).collect();
        for shard in &shards {
            self.client.stop(shard).await;
        }
        inner.failures = 0;
        inner.empty_receives = 0;
        *self.state.lock() = PluginState::Stopped;
    }
}

impl fmt::Debug for CounterSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterSession")
            .field("host", &self.client.host())
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn counters(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!(r"\Processor({i:03})\% Processor Time"))
            .collect()
    }

    #[test]
    fn test_typeperf_command_rendering() {
        let builder = TypeperfBuilder::new(10);
        let line = builder.build(&[
            r"\Memory\Pages/sec".to_string(),
            r"\System\Threads".to_string(),
        ]);
        assert_eq!(
            line,
            r#"typeperf -si 10 "\Memory\Pages/sec" "\System\Threads""#
        );
    }

    #[test]
    fn test_typeperf_rejects_unquotable_paths() {
        let builder = TypeperfBuilder::new(10);
        assert!(builder.validate(r"\Memory\Pages/sec").is_ok());
        assert!(matches!(
            builder.validate(r#"\Bad("instance")\Value"#),
            Err(WinRmError::InvalidParameter(_))
        ));
        assert!(builder.validate("  ").is_err());
    }

    #[test]
    fn test_plan_shards_respects_length_cap() {
        let builder = TypeperfBuilder::new(10);
        let counters = counters(150);
        // Each counter adds ~36 characters; force roughly 3 shards.
        let cap = builder.build(&counters[..60]).len();
        let shards = plan_shards(&builder, &counters, cap).unwrap();

        assert_eq!(shards.len(), 3);
        // No counter is lost or reordered.
        let flattened: Vec<String> = shards.iter().flatten().cloned().collect();
        assert_eq!(flattened, counters);
        // Every rendered line observes the cap.
        for shard in &shards {
            assert!(builder.build(shard).len() <= cap);
        }
    }

    #[test]
    fn test_plan_shards_rejects_oversized_counter() {
        let builder = TypeperfBuilder::new(10);
        let long_path = format!(r"\Category\{}", "x".repeat(300));
        let err = plan_shards(&builder, &[long_path], 100).unwrap_err();
        assert!(matches!(err, WinRmError::InvalidParameter(_)));
    }

    #[test]
    fn test_plan_shards_empty_input() {
        let builder = TypeperfBuilder::new(10);
        assert!(plan_shards(&builder, &[], 2047).unwrap().is_empty());
    }

    #[test]
    fn test_sample_marker_matching() {
        assert!(is_sample_marker(
            r#""(PDH-CSV 4.0)","\\srv1\Memory\Pages/sec""#,
            "\"(PDH-CSV"
        ));
        assert!(!is_sample_marker(
            r#""10/05/2025 10:00:00.123","42.5""#,
            "\"(PDH-CSV"
        ));
        // An empty marker never matches, so nothing is stripped.
        assert!(!is_sample_marker("anything", ""));
    }

    #[test]
    fn test_state_display_matches_wire_names() {
        assert_eq!(PluginState::Stopped.to_string(), "STOPPED");
        assert_eq!(PluginState::Starting.to_string(), "STARTING");
        assert_eq!(PluginState::Started.to_string(), "STARTED");
        assert_eq!(PluginState::Stopping.to_string(), "STOPPING");
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_command_len, 2047);
        assert_eq!(config.max_network_failures, 3);
        assert_eq!(config.max_empty_receives, 3);
        assert_eq!(config.receive_timeout, Duration::from_secs(90));
        assert_eq!(config.sample_marker, "\"(PDH-CSV");
    }

    #[test]
    fn test_session_config_deserializes_with_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_command_len, 2047);

        let config: SessionConfig =
            serde_json::from_str(r#"{"receive_timeout": "2m", "max_empty_receives": 5}"#)
                .unwrap();
        assert_eq!(config.receive_timeout, Duration::from_secs(120));
        assert_eq!(config.max_empty_receives, 5);
    }
}
