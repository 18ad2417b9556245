//! Tiered reconnect escalation using rust-fsm.
//!
//! ## State Diagram
//!
//! ```text
//!                  ┌──────────┐
//!        ┌────────►│   Idle   │◄──────────────┐
//!        │         └────┬─────┘               │
//!        │ Finished     │ BeginSoft /         │ Succeeded / Failed
//!        │              │ BeginHard /         │
//!        │              │ BeginNuclear        │
//!        │              ▼                     │
//! ┌──────┴──────────────────────┐   ┌─────────┴───────────┐
//! │ ReconnectingSoft / ...Hard  │   │ ReconnectingNuclear │
//! └─────────────────────────────┘   └─────────────────────┘
//! ```
//!
//! Tiers are only entered from `Idle`; a begin input in any other state is
//! an impossible transition and the call returns `false` without side
//! effects. While a tier runs, the client's reconnecting gate is closed, so
//! stores treat the client as unavailable.

use crate::{ConnectionMonitor, ReconnectGuard, SyncClient};
use frontdesk_config_and_utils::SyncTimings;
use parking_lot::Mutex;
use realtime_transport::flags::clear_connection_failure_flags;
use realtime_transport::{FlagStorage, TransportFactory};
use rust_fsm::*;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub reconnect_machine(Idle)

    Idle => {
        BeginSoft => ReconnectingSoft,
        BeginHard => ReconnectingHard,
        BeginNuclear => ReconnectingNuclear
    },
    ReconnectingSoft => {
        Finished => Idle
    },
    ReconnectingHard => {
        Finished => Idle
    },
    ReconnectingNuclear => {
        Succeeded => Idle,
        Failed => Idle
    }
}

pub use reconnect_machine::Input as ReconnectInput;
pub use reconnect_machine::State as ReconnectState;
pub use reconnect_machine::StateMachine as ReconnectMachine;

/// Recovery strategy, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectTier {
    Soft,
    Hard,
    Nuclear,
}

impl ReconnectTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectTier::Soft => "soft",
            ReconnectTier::Hard => "hard",
            ReconnectTier::Nuclear => "nuclear",
        }
    }
}

/// Result of [`ReconnectEscalator::recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    AlreadyConnected,
    Recovered(ReconnectTier),
    /// Another reconnect was running; nothing was done.
    Busy,
    /// Every tier ran and the connection is still down.
    Failed { consecutive_failures: u32 },
}

/// Restores the machine to `Idle` and reopens the gate when a tier ends,
/// including when the tier's future is dropped mid-flight.
struct TierGuard<'a> {
    escalator: &'a ReconnectEscalator,
    exit: ReconnectInput,
    _gate: ReconnectGuard,
}

impl TierGuard<'_> {
    fn succeed(&mut self) {
        self.exit = ReconnectInput::Succeeded;
    }
}

impl Drop for TierGuard<'_> {
    fn drop(&mut self) {
        let _ = self.escalator.machine.lock().consume(&self.exit);
    }
}

/// Three-tier reconnect policy for one [`SyncClient`].
pub struct ReconnectEscalator {
    client: Arc<SyncClient>,
    factory: Option<Arc<dyn TransportFactory>>,
    flags: Arc<dyn FlagStorage>,
    timings: SyncTimings,
    machine: Mutex<ReconnectMachine>,
    attempt: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl ReconnectEscalator {
    /// `factory` is needed only by the nuclear tier; without one that tier
    /// always fails.
    pub fn new(
        client: Arc<SyncClient>,
        factory: Option<Arc<dyn TransportFactory>>,
        flags: Arc<dyn FlagStorage>,
        timings: SyncTimings,
    ) -> Self {
        Self {
            client,
            factory,
            flags,
            timings,
            machine: Mutex::new(ReconnectMachine::new()),
            attempt: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn client(&self) -> &Arc<SyncClient> {
        &self.client
    }

    pub fn state(&self) -> ReconnectState {
        self.machine.lock().state().clone()
    }

    /// Number of nuclear identities created so far.
    pub fn attempts(&self) -> u64 {
        self.attempt.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    fn enter(&self, begin: ReconnectInput, exit: ReconnectInput) -> Option<TierGuard<'_>> {
        let mut machine = self.machine.lock();
        if machine.consume(&begin).is_err() {
            return None;
        }
        let Some(gate) = self.client.try_begin_reconnect() else {
            // Another escalator on the same client owns the gate.
            let _ = machine.consume(&exit);
            return None;
        };
        Some(TierGuard {
            escalator: self,
            exit,
            _gate: gate,
        })
    }

    /// Cycle the transport offline, wait a few hundred milliseconds, then
    /// online. Returns false if a reconnect was already running.
    pub async fn soft_reconnect(&self) -> bool {
        self.cycle(ReconnectTier::Soft, self.timings.soft_reconnect_delay())
            .await
    }

    /// Same cycle with a delay of seconds, for user-triggered retries.
    pub async fn hard_reconnect(&self) -> bool {
        self.cycle(ReconnectTier::Hard, self.timings.hard_reconnect_delay())
            .await
    }

    async fn cycle(&self, tier: ReconnectTier, delay: Duration) -> bool {
        let begin = match tier {
            ReconnectTier::Soft => ReconnectInput::BeginSoft,
            _ => ReconnectInput::BeginHard,
        };
        let Some(_tier) = self.enter(begin, ReconnectInput::Finished) else {
            debug!(tier = tier.as_str(), "Reconnect already in progress");
            return false;
        };
        let Some(lease) = self.client.current() else {
            warn!(tier = tier.as_str(), "No realtime client to reconnect");
            return false;
        };

        info!(tier = tier.as_str(), app_name = %lease.app_name(), "Reconnect started");
        lease.go_offline();
        tokio::time::sleep(delay).await;
        lease.go_online();
        info!(
            tier = tier.as_str(),
            connected = lease.is_connected(),
            "Reconnect cycle finished"
        );
        true
    }

    /// Tear the client down and rebuild it under a fresh identity.
    ///
    /// Steps run in order: go offline, discard the handle, clear persisted
    /// failure flags, connect as `{base}-reconnect-{n}`, then reopen the
    /// gate. Returns false immediately if any reconnect is running, and
    /// false after counting a failure if the new client cannot be created.
    pub async fn nuclear_reconnect(&self) -> bool {
        let Some(mut tier) = self.enter(ReconnectInput::BeginNuclear, ReconnectInput::Failed)
        else {
            warn!("Nuclear reconnect already in progress, ignoring");
            return false;
        };
        warn!(app_name = %self.client.base_app_name(), "Nuclear reconnect started");

        if let Some(lease) = self.client.current() {
            lease.go_offline();
        }
        if let Some(old) = self.client.discard() {
            old.shutdown();
        }
        match clear_connection_failure_flags(self.flags.as_ref()) {
            Ok(removed) => debug!(removed, "Cleared connection failure flags"),
            Err(e) => warn!(error = %e, "Failed to clear connection failure flags"),
        }

        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let app_name = format!("{}-reconnect-{attempt}", self.client.base_app_name());

        let result = match &self.factory {
            Some(factory) => factory.connect(&app_name).await.map_err(|e| e.to_string()),
            None => Err("no transport factory configured".to_string()),
        };
        match result {
            Ok(transport) => {
                let generation = self.client.install(transport);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                tier.succeed();
                info!(app_name = %app_name, attempt, generation, "Nuclear reconnect succeeded");
                true
            }
            Err(error) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    app_name = %app_name,
                    attempt,
                    consecutive_failures = failures,
                    error = %error,
                    "Nuclear reconnect failed"
                );
                false
            }
        }
    }

    /// Run the tiers in order until the connected flag comes back.
    pub async fn recover(&self) -> RecoveryOutcome {
        let monitor = ConnectionMonitor::new(self.client.clone());
        if monitor.is_connected() {
            return RecoveryOutcome::AlreadyConnected;
        }
        let wait = self.timings.connect_timeout();

        if !self.client.is_initialized() {
            if self.nuclear_reconnect().await && monitor.wait_for_connected(wait).await {
                return RecoveryOutcome::Recovered(ReconnectTier::Nuclear);
            }
            return RecoveryOutcome::Failed {
                consecutive_failures: self.consecutive_failures(),
            };
        }

        if !self.soft_reconnect().await {
            return RecoveryOutcome::Busy;
        }
        if monitor.wait_for_connected(wait).await {
            return RecoveryOutcome::Recovered(ReconnectTier::Soft);
        }

        if self.hard_reconnect().await && monitor.wait_for_connected(wait).await {
            return RecoveryOutcome::Recovered(ReconnectTier::Hard);
        }

        if self.nuclear_reconnect().await && monitor.wait_for_connected(wait).await {
            return RecoveryOutcome::Recovered(ReconnectTier::Nuclear);
        }

        RecoveryOutcome::Failed {
            consecutive_failures: self.consecutive_failures(),
        }
    }

    /// Watch the connection in the background and run [`recover`] after a
    /// sustained disconnect or when the app becomes visible while offline.
    /// Gives up after `max_nuclear_failures` consecutive nuclear failures.
    ///
    /// [`recover`]: ReconnectEscalator::recover
    pub fn spawn_watchdog(self: &Arc<Self>) -> Watchdog {
        let (visibility_tx, visibility_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_watchdog(self.clone(), visibility_rx));
        Watchdog {
            task,
            visibility: visibility_tx,
        }
    }
}

/// App visibility as reported by the embedding shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppVisibility {
    Visible,
    Hidden,
}

/// Handle to a running watchdog. Dropping it stops the watchdog.
pub struct Watchdog {
    task: JoinHandle<()>,
    visibility: mpsc::UnboundedSender<AppVisibility>,
}

impl Watchdog {
    pub fn visibility_changed(&self, visibility: AppVisibility) {
        let _ = self.visibility.send(visibility);
    }

    /// True once the watchdog gave up or was stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(self) {}
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Trigger {
    Disconnected,
    BecameVisible,
    Closed,
}

async fn next_trigger(
    connected: &mut watch::Receiver<bool>,
    visibility: &mut mpsc::UnboundedReceiver<AppVisibility>,
    grace: Duration,
) -> Trigger {
    loop {
        if *connected.borrow_and_update() {
            tokio::select! {
                changed = connected.changed() => {
                    // The client behind the subscription went away.
                    if changed.is_err() {
                        return Trigger::Disconnected;
                    }
                }
                event = visibility.recv() => {
                    if event.is_none() {
                        return Trigger::Closed;
                    }
                }
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep(grace) => return Trigger::Disconnected,
                Ok(()) = connected.changed() => {}
                event = visibility.recv() => match event {
                    Some(AppVisibility::Visible) => return Trigger::BecameVisible,
                    Some(AppVisibility::Hidden) => {}
                    None => return Trigger::Closed,
                },
            }
        }
    }
}

async fn run_watchdog(
    escalator: Arc<ReconnectEscalator>,
    mut visibility: mpsc::UnboundedReceiver<AppVisibility>,
) {
    let monitor = ConnectionMonitor::new(escalator.client.clone());
    let grace = escalator.timings.disconnect_grace();
    let max_failures = escalator.timings.max_nuclear_failures;

    loop {
        // Resubscribe every round: a nuclear reconnect replaces the client.
        let (tx, mut connected) = watch::channel(monitor.is_connected());
        let _subscription = monitor.subscribe(move |c| {
            let _ = tx.send(c);
        });

        let trigger = next_trigger(&mut connected, &mut visibility, grace).await;
        let reason = match trigger {
            Trigger::Closed => return,
            Trigger::Disconnected => "sustained_disconnect",
            Trigger::BecameVisible => "became_visible",
        };

        info!(reason, "Watchdog starting recovery");
        match escalator.recover().await {
            RecoveryOutcome::Failed {
                consecutive_failures,
            } if consecutive_failures >= max_failures => {
                error!(
                    consecutive_failures,
                    "Giving up on reconnecting after repeated nuclear failures"
                );
                return;
            }
            outcome => debug!(?outcome, "Watchdog recovery finished"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realtime_transport::{flags, MemoryBackend, Transport};

    #[test]
    fn machine_rejects_reentry() {
        let mut machine = ReconnectMachine::new();
        machine.consume(&ReconnectInput::BeginNuclear).unwrap();
        assert_eq!(*machine.state(), ReconnectState::ReconnectingNuclear);
        assert!(machine.consume(&ReconnectInput::BeginNuclear).is_err());
        assert!(machine.consume(&ReconnectInput::BeginSoft).is_err());
        machine.consume(&ReconnectInput::Failed).unwrap();
        assert_eq!(*machine.state(), ReconnectState::Idle);
    }

    #[test]
    fn soft_tier_only_finishes() {
        let mut machine = ReconnectMachine::new();
        machine.consume(&ReconnectInput::BeginSoft).unwrap();
        assert!(machine.consume(&ReconnectInput::Succeeded).is_err());
        machine.consume(&ReconnectInput::Finished).unwrap();
        assert_eq!(*machine.state(), ReconnectState::Idle);
    }

    async fn setup() -> (Arc<MemoryBackend>, Arc<ReconnectEscalator>) {
        let backend = MemoryBackend::new();
        let client = SyncClient::connect(backend.as_ref(), "frontdesk").await.unwrap();
        let escalator = Arc::new(ReconnectEscalator::new(
            client,
            Some(backend.clone() as Arc<dyn TransportFactory>),
            backend.flags(),
            SyncTimings::default(),
        ));
        (backend, escalator)
    }

    #[tokio::test(start_paused = true)]
    async fn soft_reconnect_cycles_and_gates_stores() {
        let (_backend, escalator) = setup().await;
        let worker = escalator.clone();
        let cycle = tokio::spawn(async move { worker.soft_reconnect().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(escalator.client().is_reconnecting());
        assert_eq!(escalator.state(), ReconnectState::ReconnectingSoft);
        assert!(!escalator.soft_reconnect().await);

        assert!(cycle.await.unwrap());
        assert_eq!(escalator.state(), ReconnectState::Idle);
        assert!(escalator.client().acquire().unwrap().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn soft_reconnect_cannot_beat_failure_flags() {
        let (backend, escalator) = setup().await;
        backend.drop_connection("frontdesk", true);
        backend.restore_connection("frontdesk");

        assert!(escalator.soft_reconnect().await);
        assert!(!escalator.client().acquire().unwrap().is_connected());
    }

    #[tokio::test]
    async fn nuclear_reconnect_rebuilds_under_new_identity() {
        let (backend, escalator) = setup().await;
        backend.drop_connection("frontdesk", true);
        let old = escalator.client().acquire().unwrap();

        assert!(escalator.nuclear_reconnect().await);

        let lease = escalator.client().acquire().unwrap();
        assert_eq!(lease.app_name(), "frontdesk-reconnect-1");
        assert_eq!(lease.generation(), 2);
        assert!(lease.is_connected());
        assert!(!flags::has_connection_failure(backend.flags().as_ref()));
        assert!(escalator.client().validate(&old).is_err());
        assert!(matches!(
            old.get_once(&realtime_transport::layout::sessions()).await,
            Err(realtime_transport::TransportError::Shutdown)
        ));

        assert!(escalator.nuclear_reconnect().await);
        assert_eq!(
            escalator.client().acquire().unwrap().app_name(),
            "frontdesk-reconnect-2"
        );
        assert_eq!(escalator.attempts(), 2);
    }

    #[tokio::test]
    async fn nuclear_failure_is_counted_and_gate_reopens() {
        let (backend, escalator) = setup().await;
        backend.fail_next_connects(2);

        assert!(!escalator.nuclear_reconnect().await);
        assert!(!escalator.nuclear_reconnect().await);
        assert_eq!(escalator.consecutive_failures(), 2);
        assert!(!escalator.client().is_reconnecting());
        assert!(!escalator.client().is_initialized());
        assert_eq!(escalator.state(), ReconnectState::Idle);

        assert!(escalator.nuclear_reconnect().await);
        assert_eq!(escalator.consecutive_failures(), 0);
        assert_eq!(
            escalator.client().acquire().unwrap().app_name(),
            "frontdesk-reconnect-3"
        );
    }

    #[tokio::test]
    async fn nuclear_reconnect_is_not_reentrant() {
        let (backend, escalator) = setup().await;
        backend.set_connect_delay(Some(Duration::from_millis(200)));

        let first = escalator.clone();
        let running = tokio::spawn(async move { first.nuclear_reconnect().await });
        while escalator.state() != ReconnectState::ReconnectingNuclear {
            tokio::task::yield_now().await;
        }

        assert!(!escalator.nuclear_reconnect().await);
        assert_eq!(escalator.attempts(), 1);

        assert!(running.await.unwrap());
        assert_eq!(
            backend.registered_apps(),
            vec!["frontdesk".to_string(), "frontdesk-reconnect-1".to_string()]
        );
        assert_eq!(escalator.client().generation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_escalates_to_nuclear_when_flags_block() {
        let (backend, escalator) = setup().await;
        backend.drop_connection("frontdesk", true);
        backend.restore_connection("frontdesk");

        assert_eq!(
            escalator.recover().await,
            RecoveryOutcome::Recovered(ReconnectTier::Nuclear)
        );
        assert_eq!(escalator.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_uses_soft_tier_when_it_suffices() {
        let (_backend, escalator) = setup().await;
        escalator.client().acquire().unwrap().go_offline();

        assert_eq!(
            escalator.recover().await,
            RecoveryOutcome::Recovered(ReconnectTier::Soft)
        );
        assert_eq!(escalator.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_recovers_from_sustained_disconnect() {
        let (backend, escalator) = setup().await;
        let watchdog = escalator.spawn_watchdog();
        tokio::time::sleep(Duration::from_millis(10)).await;

        backend.drop_connection("frontdesk", true);
        backend.restore_connection("frontdesk");

        for _ in 0..120 {
            if escalator.client().generation() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let lease = escalator.client().acquire().unwrap();
        assert_eq!(lease.app_name(), "frontdesk-reconnect-1");
        assert!(lease.is_connected());
        assert!(!watchdog.is_finished());
        watchdog.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_gives_up_after_repeated_nuclear_failures() {
        let (backend, escalator) = setup().await;
        backend.fail_next_connects(u32::MAX);
        let watchdog = escalator.spawn_watchdog();
        tokio::time::sleep(Duration::from_millis(10)).await;
        backend.drop_connection("frontdesk", true);

        for _ in 0..600 {
            if watchdog.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(watchdog.is_finished());
        assert_eq!(escalator.consecutive_failures(), 3);
    }
}
