//! Process-lifetime memory about remote hosts.
//!
//! Two things are worth remembering across operations: hosts that rejected
//! our credentials or timed out (further traffic to them is pointless until
//! the operator intervenes), and performance counters a host reported as
//! corrupt (re-requesting them would poison whole collection batches).
//!
//! The registry is an explicit shared object, created once by the embedding
//! application and handed to every transport and session via `Arc`. Nothing
//! in this crate keeps global state.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use crate::error::{WinRmError, WinRmResult};

/// Why a host is excluded from further traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// The host answered HTTP 401.
    Unauthorized,
    /// A request to the host timed out.
    Timeout,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Unauthorized => write!(f, "unauthorized"),
            BlockReason::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    /// Hosts excluded from traffic, with the reason and (for timeouts)
    /// the timeout that elapsed.
    blocked: HashMap<String, (BlockReason, Duration)>,
    /// Per-host counter paths known to break collection batches.
    corrupt_counters: HashMap<String, BTreeSet<String>>,
}

/// Shared per-host memory. Cheap to clone the `Arc` it usually lives in;
/// all methods take `&self`.
#[derive(Default)]
pub struct HostRegistry {
    state: RwLock<RegistryState>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a host rejected our credentials.
    pub fn block_unauthorized(&self, host: &str) {
        let mut state = self.state.write();
        state
            .blocked
            .entry(host.to_string())
            .or_insert((BlockReason::Unauthorized, Duration::ZERO));
    }

    /// Record that a request to a host timed out.
    pub fn block_timeout(&self, host: &str, after: Duration) {
        let mut state = self.state.write();
        state
            .blocked
            .entry(host.to_string())
            .or_insert((BlockReason::Timeout, after));
    }

    /// Returns the error to surface for a blocked host, or `Ok(())` when
    /// traffic to the host is still allowed. Transports call this before
    /// every send.
    pub fn check_host(&self, host: &str) -> WinRmResult<()> {
        let state = self.state.read();
        match state.blocked.get(host) {
            None => Ok(()),
            Some((BlockReason::Unauthorized, _)) => Err(WinRmError::Unauthorized {
                host: host.to_string(),
            }),
            Some((BlockReason::Timeout, after)) => Err(WinRmError::Timeout {
                host: host.to_string(),
                after: *after,
            }),
        }
    }

    /// Whether a host is currently blocked.
    pub fn is_blocked(&self, host: &str) -> bool {
        self.state.read().blocked.contains_key(host)
    }

    /// Operator override: forget a block (credentials rotated, host
    /// recovered). Not called by anything in this crate.
    pub fn unblock(&self, host: &str) {
        self.state.write().blocked.remove(host);
    }

    /// Merge counter paths into a host's corrupt set.
    pub fn add_corrupt_counters<I, S>(&self, host: &str, counters: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.write();
        let set = state
            .corrupt_counters
            .entry(host.to_string())
            .or_default();
        for counter in counters {
            set.insert(counter.into());
        }
    }

    /// Counter paths known to be corrupt on a host, in sorted order.
    pub fn corrupt_counters(&self, host: &str) -> Vec<String> {
        self.state
            .read()
            .corrupt_counters
            .get(host)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a specific counter is known corrupt on a host.
    pub fn is_corrupt(&self, host: &str, counter: &str) -> bool {
        self.state
            .read()
            .corrupt_counters
            .get(host)
            .is_some_and(|set| set.contains(counter))
    }

    /// Operator override: clear a host's corrupt set so counters get
    /// revalidated on the next collection start.
    pub fn reset_corrupt_counters(&self, host: &str) {
        self.state.write().corrupt_counters.remove(host);
    }
}

impl fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("HostRegistry")
            .field("blocked", &state.blocked.len())
            .field("hosts_with_corrupt_counters", &state.corrupt_counters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_block_sticks() {
        let registry = HostRegistry::new();
        assert!(registry.check_host("srv1").is_ok());

        registry.block_unauthorized("srv1");
        assert!(matches!(
            registry.check_host("srv1"),
            Err(WinRmError::Unauthorized { host }) if host == "srv1"
        ));
        // Other hosts are unaffected.
        assert!(registry.check_host("srv2").is_ok());
    }

    #[test]
    fn test_first_block_reason_wins() {
        let registry = HostRegistry::new();
        registry.block_timeout("srv1", Duration::from_secs(60));
        registry.block_unauthorized("srv1");
        assert!(matches!(
            registry.check_host("srv1"),
            Err(WinRmError::Timeout { .. })
        ));
    }

    #[test]
    fn test_unblock_restores_traffic() {
        let registry = HostRegistry::new();
        registry.block_unauthorized("srv1");
        registry.unblock("srv1");
        assert!(registry.check_host("srv1").is_ok());
    }

    #[test]
    fn test_corrupt_counters_accumulate_per_host() {
        let registry = HostRegistry::new();
        registry.add_corrupt_counters("srv1", [r"\Memory\Pages/sec"]);
        registry.add_corrupt_counters("srv1", [r"\Processor(_Total)\% User Time"]);
        registry.add_corrupt_counters("srv2", [r"\System\Threads"]);

        assert_eq!(
            registry.corrupt_counters("srv1"),
            vec![
                r"\Memory\Pages/sec".to_string(),
                r"\Processor(_Total)\% User Time".to_string(),
            ]
        );
        assert!(registry.is_corrupt("srv2", r"\System\Threads"));
        assert!(!registry.is_corrupt("srv1", r"\System\Threads"));

        registry.reset_corrupt_counters("srv1");
        assert!(registry.corrupt_counters("srv1").is_empty());
    }
}
