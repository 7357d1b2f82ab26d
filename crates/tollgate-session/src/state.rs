//! Session State Machine
//!
//! Observable container for the session lifecycle, the tunnel permission
//! and the engine's liveness flag. One instance is constructed per
//! execution context and shared through `Arc` with every consumer.
//!
//! # Transitions
//!
//! ```text
//!            ┌──────────┐  begin_starting  ┌──────────┐
//!            │ Stopped  │─────────────────▶│ Starting │
//!            └──────────┘                  └────┬─────┘
//!                 ▲                             │ running / error
//!                 │ stopped / error             ▼
//!            ┌────┴─────┐  begin_stopping  ┌──────────┐
//!            │ Stopping │◀─────────────────│ Running  │
//!            └──────────┘                  └──────────┘
//! ```
//!
//! `Starting` and `Stopping` must always be followed by a terminal state.
//! [`PendingTransition`] enforces this: if it is dropped while the machine
//! is still transient, the machine moves to `Error`.
//!
//! # Subscribers
//!
//! Listeners run on a dedicated dispatcher thread, in registration order,
//! once per change. A slow listener delays later notifications but never
//! the caller performing the transition.

use crate::bus::{BusMessage, SessionEvent, StateBus};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use std::thread;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

static NEXT_MACHINE_ID: AtomicU64 = AtomicU64::new(1);

/// Session lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session
    Stopped,
    /// Engine and tunnel are being brought up
    Starting,
    /// Traffic is routed through the local proxy
    Running,
    /// Engine and tunnel are being torn down
    Stopping,
    /// The last operation failed
    Error(String),
}

impl SessionState {
    /// Broadcast name of this state
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Stopped => "STOPPED",
            SessionState::Starting => "STARTING",
            SessionState::Running => "RUNNING",
            SessionState::Stopping => "STOPPING",
            SessionState::Error(_) => "ERROR",
        }
    }

    /// Check if an operation is in flight
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Stopping)
    }

    /// Check if the state is a resting point
    pub fn is_terminal(&self) -> bool {
        !self.is_transient()
    }

    /// Check if the session is up
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    /// Check if the session failed
    pub fn is_error(&self) -> bool {
        matches!(self, SessionState::Error(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Error(msg) => write!(f, "ERROR ({})", msg),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Tunnel-creation consent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionState {
    /// Not checked yet
    #[default]
    Unknown,
    /// The OS allows this app to create a tunnel
    Granted,
    /// Consent was denied or revoked
    Denied,
}

/// Everything a subscriber gets on each change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub permission: PermissionState,
    /// Whether the engine process is alive (supervised separately)
    pub core_running: bool,
    pub error_message: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Stopped,
            permission: PermissionState::Unknown,
            core_running: false,
            error_message: None,
        }
    }
}

/// Platform query for tunnel-creation consent
pub trait PermissionProbe: Send + Sync {
    fn is_granted(&self) -> bool;
}

/// Handle returned by [`SessionStateMachine::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;
type Listeners = Arc<Mutex<Vec<(SubscriptionId, Listener)>>>;

/// Observable session state container
pub struct SessionStateMachine {
    id: u64,
    snapshot: RwLock<SessionSnapshot>,
    listeners: Listeners,
    next_subscription: AtomicU64,
    dispatch_tx: Sender<SessionSnapshot>,
    bus: RwLock<Option<StateBus>>,
    probe: Arc<dyn PermissionProbe>,
}

impl SessionStateMachine {
    /// Create a machine in `Stopped` and start its dispatcher thread
    pub fn new(probe: Arc<dyn PermissionProbe>) -> Self {
        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));
        let (dispatch_tx, dispatch_rx) = unbounded();
        spawn_dispatcher(dispatch_rx, listeners.clone());

        Self {
            id: NEXT_MACHINE_ID.fetch_add(1, Ordering::Relaxed),
            snapshot: RwLock::new(SessionSnapshot::default()),
            listeners,
            next_subscription: AtomicU64::new(1),
            dispatch_tx,
            bus: RwLock::new(None),
            probe,
        }
    }

    /// Identifier used to tag bus announcements
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Announce every subsequent transition on `bus`
    pub fn attach_bus(&self, bus: StateBus) {
        match self.bus.write() {
            Ok(mut slot) => *slot = Some(bus),
            Err(poisoned) => *poisoned.into_inner() = Some(bus),
        }
    }

    /// Latest state
    pub fn current_state(&self) -> SessionState {
        self.snapshot().state
    }

    /// Latest full snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        match self.snapshot.read() {
            Ok(snap) => snap.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Register a listener for every subsequent change
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut listeners = match self.listeners.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.push((id, Arc::new(listener)));
        debug!("Session subscriber {:?} registered ({} total)", id, listeners.len());
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = match self.listeners.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub fn transition_to_starting(&self) {
        self.transition(SessionState::Starting, true);
    }

    pub fn transition_to_running(&self) {
        self.transition(SessionState::Running, true);
    }

    pub fn transition_to_stopping(&self) {
        self.transition(SessionState::Stopping, true);
    }

    pub fn transition_to_stopped(&self) {
        self.transition(SessionState::Stopped, true);
    }

    pub fn transition_to_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("Session error: {}", message);
        self.transition(SessionState::Error(message), true);
    }

    /// Move to `Starting` and return a guard that forces a terminal state
    ///
    /// Joins a start already in flight without a second `Starting`, so
    /// nested layers can each hold their own guard.
    pub fn begin_starting(&self) -> PendingTransition<'_> {
        self.enter(SessionState::Starting);
        PendingTransition {
            machine: self,
            phase: "start",
        }
    }

    /// Move to `Stopping` and return a guard that forces a terminal state
    pub fn begin_stopping(&self) -> PendingTransition<'_> {
        self.enter(SessionState::Stopping);
        PendingTransition {
            machine: self,
            phase: "stop",
        }
    }

    /// Drop the error message; an `Error` state falls back to `Stopped`
    pub fn clear_error(&self) {
        let was_error = self.current_state().is_error();
        if was_error {
            self.transition(SessionState::Stopped, true);
        } else {
            self.update(|snap| snap.error_message = None);
        }
    }

    /// Re-query the OS for tunnel consent
    pub fn check_permission(&self) -> bool {
        let granted = self.probe.is_granted();
        self.set_permission(if granted {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        });
        granted
    }

    /// Record a granted consent flow
    pub fn on_permission_granted(&self) {
        self.set_permission(PermissionState::Granted);
    }

    /// Record a denied consent flow
    pub fn on_permission_denied(&self) {
        self.set_permission(PermissionState::Denied);
    }

    /// Current consent state
    pub fn permission(&self) -> PermissionState {
        self.snapshot().permission
    }

    /// Update the engine liveness flag
    pub fn set_core_running(&self, running: bool) {
        self.update(|snap| snap.core_running = running);
    }

    /// Engine liveness flag
    pub fn core_running(&self) -> bool {
        self.snapshot().core_running
    }

    /// Replay an announced event into this machine without re-announcing
    ///
    /// Returns false for unknown state names.
    pub fn apply_event(&self, event: &SessionEvent) -> bool {
        let state = match event.state.as_str() {
            "STOPPED" => SessionState::Stopped,
            "STARTING" => SessionState::Starting,
            "RUNNING" => SessionState::Running,
            "STOPPING" => SessionState::Stopping,
            "ERROR" => SessionState::Error(
                event
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ),
            other => {
                warn!("Unknown session state in event: {}", other);
                return false;
            }
        };
        self.transition(state, false);
        true
    }

    fn set_permission(&self, permission: PermissionState) {
        self.update(|snap| snap.permission = permission);
    }

    fn transition(&self, state: SessionState, announce: bool) {
        let mut snap = self.write_snapshot();
        self.apply(&mut snap, state, announce);
    }

    fn enter(&self, state: SessionState) {
        let mut snap = self.write_snapshot();
        if snap.state != state {
            self.apply(&mut snap, state, true);
        }
    }

    /// Resolve an in-flight start or stop; false if already resolved
    fn settle(&self, state: SessionState) -> bool {
        let mut snap = self.write_snapshot();
        if !snap.state.is_transient() {
            debug!(
                "Session already {}, not moving to {}",
                snap.state.name(),
                state.name()
            );
            return false;
        }
        if let SessionState::Error(message) = &state {
            error!("Session error: {}", message);
        }
        self.apply(&mut snap, state, true);
        true
    }

    fn write_snapshot(&self) -> RwLockWriteGuard<'_, SessionSnapshot> {
        match self.snapshot.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn apply(&self, snap: &mut SessionSnapshot, state: SessionState, announce: bool) {
        debug!("Session {} -> {}", snap.state.name(), state.name());
        snap.error_message = match &state {
            SessionState::Error(msg) => Some(msg.clone()),
            SessionState::Stopping => snap.error_message.take(),
            _ => None,
        };
        snap.state = state;

        // Queue and announce while still holding the lock so consumers see
        // changes in the order they were made
        self.dispatch(snap);
        if announce {
            self.announce(snap);
        }
    }

    fn update(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        let mut snap = self.write_snapshot();
        let before = snap.clone();
        f(&mut snap);
        if *snap != before {
            self.dispatch(&snap);
        }
    }

    fn dispatch(&self, snap: &SessionSnapshot) {
        if self.dispatch_tx.send(snap.clone()).is_err() {
            warn!("Session dispatcher has stopped");
        }
    }

    fn announce(&self, snap: &SessionSnapshot) {
        let bus = match self.bus.read() {
            Ok(b) => b.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(bus) = bus {
            bus.announce(
                self.id,
                SessionEvent {
                    state: snap.state.name().to_string(),
                    error_message: snap.error_message.clone(),
                },
            );
        }
    }
}

impl fmt::Debug for SessionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStateMachine")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

/// Guard for an in-flight start or stop
///
/// Resolve it with [`running`](Self::running), [`stopped`](Self::stopped)
/// or [`failed`](Self::failed). If it is dropped while the machine is still
/// `Starting`/`Stopping` (early return, `?`, unwinding), the machine moves
/// to `Error`.
///
/// Resolution only applies while the machine is transient. Once any
/// guard, or a deadline, has settled the operation, later resolutions are
/// ignored, so each `Starting`/`Stopping` gets exactly one terminal state.
#[must_use = "dropping the guard immediately forces an Error transition"]
pub struct PendingTransition<'a> {
    machine: &'a SessionStateMachine,
    phase: &'static str,
}

impl PendingTransition<'_> {
    pub fn running(self) {
        self.machine.settle(SessionState::Running);
    }

    pub fn stopped(self) {
        self.machine.settle(SessionState::Stopped);
    }

    pub fn failed(self, message: impl Into<String>) {
        self.machine.settle(SessionState::Error(message.into()));
    }
}

impl Drop for PendingTransition<'_> {
    fn drop(&mut self) {
        self.machine.settle(SessionState::Error(format!(
            "Session {} did not complete",
            self.phase
        )));
    }
}

/// Replay events from `bus` into `machine` until the bus closes
///
/// Events announced by `machine` itself are skipped. The receiver is opened
/// before this returns, so nothing announced afterwards is missed.
pub fn spawn_replicator(bus: &StateBus, machine: Arc<SessionStateMachine>) -> JoinHandle<()> {
    let mut rx: broadcast::Receiver<BusMessage> = bus.receiver();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) if msg.origin == machine.id() => {}
                Ok(msg) => {
                    machine.apply_event(&msg.event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Session replicator lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Session replicator stopped");
    })
}

fn spawn_dispatcher(rx: Receiver<SessionSnapshot>, listeners: Listeners) {
    thread::Builder::new()
        .name("session-dispatch".to_string())
        .spawn(move || {
            info!("Session dispatcher started");
            for snapshot in rx.iter() {
                let current: Vec<Listener> = match listeners.lock() {
                    Ok(l) => l.iter().map(|(_, f)| f.clone()).collect(),
                    Err(poisoned) => poisoned.into_inner().iter().map(|(_, f)| f.clone()).collect(),
                };

                for listener in current {
                    // Isolate subscriber panics from the rest of the fan-out
                    let result = panic::catch_unwind(AssertUnwindSafe(|| listener(&snapshot)));
                    if result.is_err() {
                        error!("Session subscriber panicked on {}", snapshot.state.name());
                    }
                }
            }
            debug!("Session dispatcher stopped");
        })
        .expect("Failed to spawn session dispatcher thread");
}
