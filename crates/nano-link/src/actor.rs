//! Discovery Actor
//!
//! All mutation of the candidate collections happens in this actor. It owns
//! the `DiscoveryManager` and the `WatcherSet` and processes watcher events
//! and client commands one at a time, so an Added can never interleave with
//! a running batch validation.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use nano_detect::{SerialPortEnumerator, SerialPortOpener};
//! use nano_link::{DiscoveryConfig, DiscoveryHandle};
//!
//! # async fn demo() -> Result<(), nano_link::LinkError> {
//! let handle = DiscoveryHandle::spawn(
//!     &DiscoveryConfig::default(),
//!     Arc::new(SerialPortEnumerator::new()),
//!     Arc::new(SerialPortOpener::new()),
//! );
//! let mut events = handle.subscribe();
//! handle.start().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use nano_detect::{
    DeviceEnumerator, PortOpener, TargetProber, WatcherEvent, WatcherId, WatcherSet, WatcherState,
};
use nano_protocol::Selector;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::candidate::{CandidateSnapshot, ConfirmedDevice};
use crate::config::DiscoveryConfig;
use crate::connection::{AccessStatus, ConnectionManager, LifecycleSignal};
use crate::discovery::DiscoveryManager;
use crate::error::LinkError;
use crate::events::LinkEvent;

/// State of one watcher, for status queries
#[derive(Debug, Clone)]
pub struct WatcherSummary {
    pub id: WatcherId,
    pub selector: Selector,
    pub state: WatcherState,
}

/// Commands sent to the discovery actor
#[derive(Debug)]
pub enum DiscoveryCommand {
    /// Start every stopped watcher and begin a discovery cycle
    Start,

    /// Stop every watcher
    Stop,

    /// Host suspend or resume
    Lifecycle(LifecycleSignal),

    /// Serial access permission changed
    AccessChanged(AccessStatus),

    /// Enable or disable reopening the last device when it reappears
    SetAutoReconnect(bool),

    /// Query every known candidate
    QueryCandidates {
        response: oneshot::Sender<Vec<CandidateSnapshot>>,
    },

    /// Query the state of every watcher
    QueryWatchers {
        response: oneshot::Sender<Vec<WatcherSummary>>,
    },

    /// Stop watchers, close the connection and exit
    Shutdown,
}

/// Route one watcher event to the discovery manager
///
/// Events from a superseded delivery cycle are dropped.
pub async fn handle_watcher_event(
    event: WatcherEvent,
    watchers: &mut WatcherSet,
    manager: &mut DiscoveryManager,
) {
    if !watchers.is_current(&event) {
        debug!(
            "Dropping stale event from {:?} generation {}",
            event.watcher(),
            event.generation()
        );
        return;
    }

    match event {
        WatcherEvent::Added { watcher, identity, .. } => {
            manager.on_added(watcher, identity).await;
        }
        WatcherEvent::Removed { watcher, id, .. } => {
            manager.on_removed(watcher, &id).await;
        }
        WatcherEvent::EnumerationCompleted { watcher, generation } => {
            manager.on_watcher_completed(watcher).await;
            if watchers.mark_completed(watcher, generation) {
                manager.on_all_enumeration_complete().await;
            }
        }
    }
}

/// Run the discovery actor until `Shutdown` or until every command sender is
/// dropped
pub async fn run_discovery_actor(
    mut cmd_rx: mpsc::Receiver<DiscoveryCommand>,
    mut watcher_rx: mpsc::Receiver<WatcherEvent>,
    mut watchers: WatcherSet,
    mut manager: DiscoveryManager,
    connection: Arc<ConnectionManager>,
) {
    info!("Discovery actor started with {} watcher(s)", watchers.len());

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    DiscoveryCommand::Start => {
                        if watchers.start_all() > 0 {
                            manager.begin_cycle();
                        }
                    }

                    DiscoveryCommand::Stop => {
                        watchers.stop_all().await;
                        info!("Watchers stopped");
                    }

                    DiscoveryCommand::Lifecycle(signal) => {
                        let changed = connection.handle_lifecycle(signal, &mut watchers).await;
                        if signal == LifecycleSignal::Resume && changed > 0 {
                            manager.begin_cycle();
                        }
                    }

                    DiscoveryCommand::AccessChanged(status) => {
                        connection.handle_access(status).await;
                        if status == AccessStatus::Allowed {
                            manager.on_access_allowed().await;
                        }
                    }

                    DiscoveryCommand::SetAutoReconnect(enabled) => {
                        connection.set_auto_reconnect(enabled).await;
                        debug!("Auto-reconnect {}", if enabled { "enabled" } else { "disabled" });
                    }

                    DiscoveryCommand::QueryCandidates { response } => {
                        let _ = response.send(manager.snapshot());
                    }

                    DiscoveryCommand::QueryWatchers { response } => {
                        let summary = watchers
                            .iter()
                            .map(|w| WatcherSummary {
                                id: w.id(),
                                selector: w.selector().clone(),
                                state: w.state(),
                            })
                            .collect();
                        let _ = response.send(summary);
                    }

                    DiscoveryCommand::Shutdown => {
                        info!("Discovery actor shutting down");
                        break;
                    }
                }
            }

            event = watcher_rx.recv() => {
                let Some(event) = event else { break; };
                handle_watcher_event(event, &mut watchers, &mut manager).await;
            }
        }
    }

    watchers.stop_all().await;
    connection.shutdown().await;
    info!("Discovery actor stopped");
}

/// Client side of a running discovery actor
///
/// Owns the process-wide `ConnectionManager` together with the actor that
/// drives it.
pub struct DiscoveryHandle {
    commands: mpsc::Sender<DiscoveryCommand>,
    events: broadcast::Sender<LinkEvent>,
    confirmed: watch::Receiver<Vec<ConfirmedDevice>>,
    connection: Arc<ConnectionManager>,
    task: JoinHandle<()>,
}

impl DiscoveryHandle {
    /// Build the connection manager, watchers and discovery manager and spawn
    /// the actor; watchers stay stopped until `start()`
    pub fn spawn(
        config: &DiscoveryConfig,
        enumerator: Arc<dyn DeviceEnumerator>,
        opener: Arc<dyn PortOpener>,
    ) -> Self {
        Self::spawn_with_prober(config, enumerator, opener, TargetProber::new())
    }

    /// Like `spawn`, with a prober using custom timeouts
    pub fn spawn_with_prober(
        config: &DiscoveryConfig,
        enumerator: Arc<dyn DeviceEnumerator>,
        opener: Arc<dyn PortOpener>,
        prober: TargetProber,
    ) -> Self {
        let capacity = config.channel_capacity.max(1);
        let (event_tx, _) = broadcast::channel(capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (watcher_tx, watcher_rx) = mpsc::channel(capacity);

        let connection = Arc::new(ConnectionManager::new(
            opener,
            event_tx.clone(),
            config.auto_reconnect,
        ));

        let mut watchers = WatcherSet::new(enumerator, watcher_tx, config.poll_interval());
        for selector in &config.selectors {
            watchers.add(selector.clone());
        }
        if watchers.is_empty() {
            warn!("No selectors configured; discovery will find nothing");
        }

        let manager = DiscoveryManager::new(connection.clone(), config.denylist(), event_tx.clone())
            .with_prober(prober);
        let confirmed = manager.subscribe_confirmed();

        let task = tokio::spawn(run_discovery_actor(
            cmd_rx,
            watcher_rx,
            watchers,
            manager,
            connection.clone(),
        ));

        Self {
            commands: cmd_tx,
            events: event_tx,
            confirmed,
            connection,
            task,
        }
    }

    async fn send(&self, cmd: DiscoveryCommand) -> Result<(), LinkError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| LinkError::ServiceStopped)
    }

    pub async fn start(&self) -> Result<(), LinkError> {
        self.send(DiscoveryCommand::Start).await
    }

    pub async fn stop(&self) -> Result<(), LinkError> {
        self.send(DiscoveryCommand::Stop).await
    }

    /// Forward a host suspend
    pub async fn suspend(&self) -> Result<(), LinkError> {
        self.send(DiscoveryCommand::Lifecycle(LifecycleSignal::Suspend))
            .await
    }

    /// Forward a host resume
    pub async fn resume(&self) -> Result<(), LinkError> {
        self.send(DiscoveryCommand::Lifecycle(LifecycleSignal::Resume))
            .await
    }

    /// Forward a permission change
    pub async fn access_changed(&self, status: AccessStatus) -> Result<(), LinkError> {
        self.send(DiscoveryCommand::AccessChanged(status)).await
    }

    pub async fn set_auto_reconnect(&self, enabled: bool) -> Result<(), LinkError> {
        self.send(DiscoveryCommand::SetAutoReconnect(enabled)).await
    }

    pub async fn candidates(&self) -> Result<Vec<CandidateSnapshot>, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.send(DiscoveryCommand::QueryCandidates { response: tx })
            .await?;
        rx.await.map_err(|_| LinkError::ServiceStopped)
    }

    pub async fn watchers(&self) -> Result<Vec<WatcherSummary>, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.send(DiscoveryCommand::QueryWatchers { response: tx })
            .await?;
        rx.await.map_err(|_| LinkError::ServiceStopped)
    }

    /// Subscribe to discovery and connection events
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Observe the confirmed-device collection
    pub fn confirmed(&self) -> watch::Receiver<Vec<ConfirmedDevice>> {
        self.confirmed.clone()
    }

    /// The connection manager driven by this actor
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Stop the actor and wait for it to finish
    pub async fn shutdown(self) -> Result<(), LinkError> {
        // Already stopped if the send fails; the join below still applies
        let _ = self.commands.send(DiscoveryCommand::Shutdown).await;
        self.task.await.map_err(|e| {
            warn!("Discovery actor failed: {}", e);
            LinkError::ServiceStopped
        })
    }
}
