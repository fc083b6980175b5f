//! Shared Monitor Manager
//!
//! One trailing-stop monitor per exchange account, shared by every trader
//! operating on that account. The manager reference-counts owners: the first
//! acquire creates the monitor, later acquires join it, and the monitor is
//! stopped when the last handle releases. The pool's lock is never held
//! across calls into a monitor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;
use tracing::{info, warn};

use crate::monitor::Monitor;
use crate::owner::Owner;
use crate::types::PositionSide;

/// Builds a monitor for the first owner on an account.
pub type MonitorFactory = Box<dyn Fn(Arc<dyn Owner>) -> Arc<dyn Monitor> + Send + Sync>;

/// Error type for shared monitor acquisition.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("owner `{trader}` has an empty account key")]
    EmptyAccountKey { trader: String },
}

struct SharedEntry {
    monitor: Arc<dyn Monitor>,
    owners: HashMap<String, Arc<dyn Owner>>,
}

type EntryPool = Arc<Mutex<HashMap<String, SharedEntry>>>;

/// Pool of trailing-stop monitors keyed by account fingerprint.
pub struct TrailingStopManager {
    factory: MonitorFactory,
    entries: EntryPool,
}

impl TrailingStopManager {
    pub fn new(factory: MonitorFactory) -> Self {
        Self {
            factory,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handle to the shared monitor for the owner's account.
    ///
    /// Creates the monitor on first acquire; later acquires join the existing
    /// one and rebind its owner.
    pub fn acquire(&self, owner: Arc<dyn Owner>) -> Result<SharedMonitorHandle, AcquireError> {
        let account_key = owner.account_key().trim().to_string();
        if account_key.is_empty() {
            warn!(trader = %owner.trader_name(), "Cannot share a monitor without an account key");
            return Err(AcquireError::EmptyAccountKey {
                trader: owner.trader_name(),
            });
        }

        let owner_id = owner.trader_id();
        let (monitor, created) = {
            let mut entries = self.entries.lock().expect("shared manager lock poisoned");
            match entries.get_mut(&account_key) {
                Some(entry) => {
                    entry.owners.insert(owner_id.clone(), Arc::clone(&owner));
                    (Arc::clone(&entry.monitor), false)
                }
                None => {
                    let monitor = (self.factory)(Arc::clone(&owner));
                    let mut owners = HashMap::new();
                    owners.insert(owner_id.clone(), Arc::clone(&owner));
                    entries.insert(
                        account_key.clone(),
                        SharedEntry {
                            monitor: Arc::clone(&monitor),
                            owners,
                        },
                    );
                    (monitor, true)
                }
            }
        };

        if created {
            info!(
                account = %mask_account_key(&account_key),
                trader = %owner.trader_name(),
                "Created shared trailing stop monitor"
            );
        } else {
            info!(
                account = %mask_account_key(&account_key),
                trader = %owner.trader_name(),
                "Joined shared trailing stop monitor"
            );
            monitor.set_owner(Arc::clone(&owner));
        }

        Ok(SharedMonitorHandle {
            entries: Arc::clone(&self.entries),
            account_key,
            owner_id,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().expect("shared manager lock poisoned").len()
    }
}

/// One trader's handle to the shared monitor for an account.
///
/// The monitor keeps running as long as any handle is outstanding. A handle
/// becomes inert after [`SharedMonitorHandle::stop`].
pub struct SharedMonitorHandle {
    entries: EntryPool,
    account_key: String,
    owner_id: String,
    monitor: Mutex<Option<Arc<dyn Monitor>>>,
}

impl std::fmt::Debug for SharedMonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMonitorHandle")
            .field("account_key", &self.account_key)
            .field("owner_id", &self.owner_id)
            .finish()
    }
}

impl SharedMonitorHandle {
    fn monitor(&self) -> Option<Arc<dyn Monitor>> {
        self.monitor
            .lock()
            .expect("shared handle lock poisoned")
            .as_ref()
            .map(Arc::clone)
    }

    /// Start the underlying monitor (idempotent).
    pub fn start(&self) {
        if let Some(monitor) = self.monitor() {
            monitor.start();
        }
    }

    /// Release this owner's reference.
    ///
    /// Stops the monitor when no owners remain; otherwise rebinds the
    /// monitor to the remaining owner with the smallest trader id.
    pub async fn stop(&self) {
        let Some(monitor) = self
            .monitor
            .lock()
            .expect("shared handle lock poisoned")
            .take()
        else {
            return;
        };

        let mut monitor_to_stop: Option<Arc<dyn Monitor>> = None;
        let mut next_owner: Option<Arc<dyn Owner>> = None;
        {
            let mut entries = self.entries.lock().expect("shared manager lock poisoned");
            if let Some(entry) = entries.get_mut(&self.account_key) {
                entry.owners.remove(&self.owner_id);
                if entry.owners.is_empty() {
                    if let Some(entry) = entries.remove(&self.account_key) {
                        monitor_to_stop = Some(entry.monitor);
                    }
                } else {
                    next_owner = entry
                        .owners
                        .iter()
                        .min_by(|a, b| a.0.cmp(b.0))
                        .map(|(_, owner)| Arc::clone(owner));
                }
            }
        }

        if let Some(to_stop) = monitor_to_stop {
            to_stop.stop().await;
            info!(
                account = %mask_account_key(&self.account_key),
                "Stopped shared trailing stop monitor (no owners left)"
            );
        } else if let Some(owner) = next_owner {
            info!(
                account = %mask_account_key(&self.account_key),
                trader = %owner.trader_name(),
                "Rebinding shared monitor owner"
            );
            monitor.set_owner(owner);
        }
    }

    /// Proxy to [`Monitor::clear_position`].
    pub fn clear_position(&self, symbol: &str, side: PositionSide) {
        if let Some(monitor) = self.monitor() {
            monitor.clear_position(symbol, side);
        }
    }

    /// Proxy to [`Monitor::register_initial_stop`].
    pub fn register_initial_stop(&self, symbol: &str, side: PositionSide, stop: f64) {
        if let Some(monitor) = self.monitor() {
            monitor.register_initial_stop(symbol, side, stop);
        }
    }
}

/// Mask an account key for logs (`first4...last4`).
fn mask_account_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return key.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

static GLOBAL_MANAGER: OnceLock<Arc<TrailingStopManager>> = OnceLock::new();

/// Install the process-wide manager. Returns false when one is already
/// installed. Must happen before the first [`global`] acquire; the instance
/// lives for the rest of the process.
pub fn install_global(manager: Arc<TrailingStopManager>) -> bool {
    GLOBAL_MANAGER.set(manager).is_ok()
}

/// The process-wide manager, when one has been installed.
pub fn global() -> Option<Arc<TrailingStopManager>> {
    GLOBAL_MANAGER.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, RawRecord, TradingClient};
    use crate::decision::{DecisionAction, DecisionRecorder, StopLossDecision};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullClient;

    #[async_trait]
    impl TradingClient for NullClient {
        async fn get_positions(&self) -> Result<Vec<RawRecord>, AdapterError> {
            Ok(vec![])
        }
        async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<RawRecord>, AdapterError> {
            Ok(vec![])
        }
        async fn close_long(&self, _symbol: &str, _qty: f64) -> Result<RawRecord, AdapterError> {
            Ok(RawRecord::new())
        }
        async fn close_short(&self, _symbol: &str, _qty: f64) -> Result<RawRecord, AdapterError> {
            Ok(RawRecord::new())
        }
    }

    struct TestOwner {
        id: String,
        account: String,
    }

    #[async_trait]
    impl Owner for TestOwner {
        fn trader_id(&self) -> String {
            self.id.clone()
        }
        fn trader_name(&self) -> String {
            format!("trader-{}", self.id)
        }
        fn account_key(&self) -> String {
            self.account.clone()
        }
        fn trading_client(&self) -> Arc<dyn TradingClient> {
            Arc::new(NullClient)
        }
        async fn execute_stop_loss(
            &self,
            _decision: &StopLossDecision,
            _action: &DecisionAction,
        ) -> Result<(), AdapterError> {
            Ok(())
        }
        fn decision_recorder(&self) -> Option<Arc<dyn DecisionRecorder>> {
            None
        }
    }

    #[derive(Default)]
    struct FakeMonitor {
        starts: AtomicUsize,
        stops: AtomicUsize,
        rebinds: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Monitor for FakeMonitor {
        fn start(self: Arc<Self>) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn set_owner(&self, owner: Arc<dyn Owner>) {
            self.rebinds.lock().unwrap().push(owner.trader_id());
        }
        fn clear_position(&self, _symbol: &str, _side: PositionSide) {}
        fn register_initial_stop(&self, _symbol: &str, _side: PositionSide, _stop: f64) {}
    }

    fn manager_with_fakes() -> (TrailingStopManager, Arc<Mutex<Vec<Arc<FakeMonitor>>>>) {
        let monitors: Arc<Mutex<Vec<Arc<FakeMonitor>>>> = Arc::new(Mutex::new(Vec::new()));
        let created = Arc::clone(&monitors);
        let manager = TrailingStopManager::new(Box::new(move |_owner| {
            let monitor = Arc::new(FakeMonitor::default());
            created.lock().unwrap().push(Arc::clone(&monitor));
            monitor
        }));
        (manager, monitors)
    }

    fn owner(id: &str, account: &str) -> Arc<dyn Owner> {
        Arc::new(TestOwner {
            id: id.to_string(),
            account: account.to_string(),
        })
    }

    #[tokio::test]
    async fn test_same_account_shares_one_monitor() {
        let (manager, monitors) = manager_with_fakes();

        let first = manager.acquire(owner("a", "acct-1")).unwrap();
        let second = manager.acquire(owner("b", "acct-1")).unwrap();
        assert_eq!(monitors.lock().unwrap().len(), 1);
        assert_eq!(manager.entry_count(), 1);

        // the joiner rebinds the owner
        let rebinds = monitors.lock().unwrap()[0].rebinds.lock().unwrap().clone();
        assert_eq!(rebinds, vec!["b".to_string()]);

        first.stop().await;
        second.stop().await;
    }

    #[tokio::test]
    async fn test_distinct_accounts_get_distinct_monitors() {
        let (manager, monitors) = manager_with_fakes();

        let _a = manager.acquire(owner("a", "acct-1")).unwrap();
        let _b = manager.acquire(owner("b", "acct-2")).unwrap();
        assert_eq!(monitors.lock().unwrap().len(), 2);
        assert_eq!(manager.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_last_release_stops_the_monitor() {
        let (manager, monitors) = manager_with_fakes();

        let first = manager.acquire(owner("a", "acct-1")).unwrap();
        let second = manager.acquire(owner("b", "acct-1")).unwrap();
        first.start();

        let monitor = Arc::clone(&monitors.lock().unwrap()[0]);
        assert_eq!(monitor.starts.load(Ordering::SeqCst), 1);

        // first release rebinds, does not stop
        first.stop().await;
        assert_eq!(monitor.stops.load(Ordering::SeqCst), 0);
        assert_eq!(manager.entry_count(), 1);

        // last release stops and drops the entry
        second.stop().await;
        assert_eq!(monitor.stops.load(Ordering::SeqCst), 1);
        assert_eq!(manager.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_release_rebinds_smallest_remaining_owner() {
        let (manager, monitors) = manager_with_fakes();

        let a = manager.acquire(owner("a", "acct-1")).unwrap();
        let _b = manager.acquire(owner("b", "acct-1")).unwrap();
        let _c = manager.acquire(owner("c", "acct-1")).unwrap();

        let monitor = Arc::clone(&monitors.lock().unwrap()[0]);
        monitor.rebinds.lock().unwrap().clear();

        a.stop().await;
        let rebinds = monitor.rebinds.lock().unwrap().clone();
        assert_eq!(rebinds, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_stopped_handle_is_inert() {
        let (manager, monitors) = manager_with_fakes();

        let handle = manager.acquire(owner("a", "acct-1")).unwrap();
        handle.stop().await;

        let monitor = Arc::clone(&monitors.lock().unwrap()[0]);
        assert_eq!(monitor.stops.load(Ordering::SeqCst), 1);

        // further calls are no-ops
        handle.start();
        handle.stop().await;
        handle.register_initial_stop("BTCUSDT", PositionSide::Long, 98.0);
        assert_eq!(monitor.starts.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_account_key_is_rejected() {
        let (manager, _) = manager_with_fakes();
        let err = manager.acquire(owner("a", "  ")).unwrap_err();
        assert!(matches!(err, AcquireError::EmptyAccountKey { .. }));
    }

    #[test]
    fn test_mask_account_key() {
        assert_eq!(mask_account_key("short"), "short");
        assert_eq!(mask_account_key("12345678"), "12345678");
        assert_eq!(mask_account_key("abcdefghijkl"), "abcd...ijkl");
    }
}
