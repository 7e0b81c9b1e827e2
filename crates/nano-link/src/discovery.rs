//! Discovery manager
//!
//! Consumes watcher events, keeps every candidate with its classification,
//! validates candidates through the connection manager, and publishes the
//! confirmed collection.
//!
//! Validation is deferred while the initial enumeration batch of a cycle is
//! in flight, then run for all tentative candidates in arrival order once
//! every watcher has completed. Candidates added after the batch are
//! validated immediately.
//!
//! A candidate whose port cannot be opened stays tentative. It is retried
//! on the next cycle, when its endpoint is reported again, or when serial
//! access is allowed. Only a failed handshake rejects.
//!
//! When a watcher completes enumeration, candidates it used to report but
//! did not report during the cycle are dropped. Removals that happened
//! while delivery was suspended are recovered this way.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nano_detect::{Denylist, TargetProber, WatcherId};
use nano_protocol::{DeviceId, DeviceIdentity};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::candidate::{CandidateDevice, CandidateSnapshot, ConfirmedDevice, Transition};
use crate::connection::ConnectionManager;
use crate::events::LinkEvent;

/// Owner of the candidate collections
pub struct DiscoveryManager {
    connection: Arc<ConnectionManager>,
    prober: TargetProber,
    denylist: Denylist,
    /// All known candidates in arrival order
    candidates: Vec<CandidateDevice>,
    /// Endpoints each watcher reported during the current cycle
    reported: HashMap<WatcherId, HashSet<DeviceId>>,
    /// Tentative candidates whose port could not be opened this cycle
    deferred: HashSet<DeviceId>,
    batch_pending: bool,
    cycle: u64,
    completed_cycle: u64,
    confirmed: watch::Sender<Vec<ConfirmedDevice>>,
    events: broadcast::Sender<LinkEvent>,
}

impl DiscoveryManager {
    pub fn new(
        connection: Arc<ConnectionManager>,
        denylist: Denylist,
        events: broadcast::Sender<LinkEvent>,
    ) -> Self {
        let (confirmed, _) = watch::channel(Vec::new());
        Self {
            connection,
            prober: TargetProber::new(),
            denylist,
            candidates: Vec::new(),
            reported: HashMap::new(),
            deferred: HashSet::new(),
            batch_pending: false,
            cycle: 0,
            completed_cycle: 0,
            confirmed,
            events,
        }
    }

    /// Use a prober with non-default timeouts
    pub fn with_prober(mut self, prober: TargetProber) -> Self {
        self.prober = prober;
        self
    }

    /// Observe the confirmed collection
    pub fn subscribe_confirmed(&self) -> watch::Receiver<Vec<ConfirmedDevice>> {
        self.confirmed.subscribe()
    }

    /// Currently published confirmed devices
    pub fn confirmed(&self) -> Vec<ConfirmedDevice> {
        self.confirmed.borrow().clone()
    }

    /// Every known candidate, rejected ones included
    pub fn snapshot(&self) -> Vec<CandidateSnapshot> {
        self.candidates.iter().map(CandidateSnapshot::from).collect()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// True while the current cycle's initial batch has not been validated
    pub fn is_batch_pending(&self) -> bool {
        self.batch_pending
    }

    /// Start a new enumeration cycle; Added events are deferred until
    /// `on_all_enumeration_complete`
    pub fn begin_cycle(&mut self) {
        self.cycle += 1;
        self.batch_pending = true;
        self.reported.clear();
        self.deferred.clear();
        debug!("Discovery cycle {} started", self.cycle);
    }

    /// Handle an endpoint reported by `watcher`
    pub async fn on_added(&mut self, watcher: WatcherId, identity: Arc<DeviceIdentity>) {
        if self.denylist.is_denied(&identity) {
            debug!("Ignoring denylisted endpoint {}", identity.id());
            return;
        }
        self.reported
            .entry(watcher)
            .or_default()
            .insert(identity.id().clone());

        if let Some(index) = self.position(identity.id()) {
            let candidate = &mut self.candidates[index];
            candidate.add_watcher(watcher);
            if candidate.is_confirmed() && self.connection.should_reconnect(&identity).await {
                info!("Reconnecting to {}", identity);
                if let Err(e) = self.connection.open(identity).await {
                    debug!("Reconnect failed: {}", e);
                }
            } else if candidate.is_tentative() && !self.batch_pending {
                debug!("Retrying {}", identity.id());
                self.deferred.remove(identity.id());
                self.validate(index).await;
                self.ensure_connected().await;
                self.publish();
            }
            return;
        }

        info!("New candidate {}", identity);
        self.candidates
            .push(CandidateDevice::new(identity.clone(), watcher));
        let _ = self.events.send(LinkEvent::CandidateAdded {
            identity: identity.clone(),
        });

        if self.batch_pending {
            debug!("Deferring validation of {} until enumeration completes", identity.id());
            return;
        }

        let index = self.candidates.len() - 1;
        self.validate(index).await;
        self.ensure_connected().await;
        self.publish();
    }

    /// Handle an endpoint that `watcher` no longer reports
    pub async fn on_removed(&mut self, watcher: WatcherId, id: &DeviceId) {
        let Some(index) = self.position(id) else {
            return;
        };
        if !self.candidates[index].remove_watcher(watcher) {
            debug!("{} still reported by another watcher", id);
            return;
        }

        let candidate = self.candidates.remove(index);
        self.deferred.remove(id);
        info!("Candidate {} removed", candidate.identity());

        let bound = self
            .connection
            .current_identity()
            .await
            .map(|current| current.id() == id)
            .unwrap_or(false);
        if bound {
            self.connection.close().await;
        }

        let _ = self.events.send(LinkEvent::DeviceRemoved { id: id.clone() });
        self.publish();
    }

    /// Drop candidates `watcher` reported before but not during this cycle
    ///
    /// Called for every enumeration-completed event of a running cycle.
    pub async fn on_watcher_completed(&mut self, watcher: WatcherId) {
        let reported = self.reported.remove(&watcher).unwrap_or_default();
        let vanished: Vec<DeviceId> = self
            .candidates
            .iter()
            .filter(|c| c.is_seen_by(watcher) && !reported.contains(c.identity().id()))
            .map(|c| c.identity().id().clone())
            .collect();
        self.reported.insert(watcher, reported);

        for id in vanished {
            debug!("{:?} no longer reports {}", watcher, id);
            self.on_removed(watcher, &id).await;
        }
    }

    /// Retry candidates whose port could not be opened
    pub async fn on_access_allowed(&mut self) {
        if self.batch_pending || self.deferred.is_empty() {
            return;
        }

        let retry: Vec<DeviceId> = self
            .candidates
            .iter()
            .filter(|c| c.is_tentative() && self.deferred.contains(c.identity().id()))
            .map(|c| c.identity().id().clone())
            .collect();
        self.deferred.clear();
        info!("Access allowed, retrying {} candidate(s)", retry.len());

        for id in retry {
            if let Some(index) = self.position(&id) {
                self.validate(index).await;
            }
        }
        self.ensure_connected().await;
        self.publish();
    }

    /// Validate the deferred batch once every watcher completed enumeration
    ///
    /// Fires `DiscoveryComplete` once per cycle; repeated calls are no-ops.
    pub async fn on_all_enumeration_complete(&mut self) {
        if !self.batch_pending {
            debug!("Discovery cycle {} already complete", self.cycle);
            return;
        }

        let pending: Vec<DeviceId> = self
            .candidates
            .iter()
            .filter(|c| c.is_tentative() && !self.deferred.contains(c.identity().id()))
            .map(|c| c.identity().id().clone())
            .collect();
        info!("Validating {} candidate(s)", pending.len());
        let validated = !pending.is_empty();

        for id in pending {
            if let Some(index) = self.position(&id) {
                self.validate(index).await;
            }
        }

        self.batch_pending = false;
        if validated {
            self.ensure_connected().await;
        }
        self.publish();

        if self.completed_cycle != self.cycle {
            self.completed_cycle = self.cycle;
            let confirmed = self.confirmed.borrow().len();
            info!(
                "Discovery cycle {} complete: {} confirmed device(s)",
                self.cycle, confirmed
            );
            let _ = self.events.send(LinkEvent::DiscoveryComplete {
                cycle: self.cycle,
                confirmed,
            });
        }
    }

    fn position(&self, id: &DeviceId) -> Option<usize> {
        self.candidates.iter().position(|c| c.identity().id() == id)
    }

    async fn validate(&mut self, index: usize) {
        let identity = self.candidates[index].identity().clone();
        debug!("Validating {}", identity);

        if let Err(e) = self.connection.open(identity.clone()).await {
            self.defer(index, format!("open failed: {}", e));
            return;
        }

        if let Some(marker) = identity.target_marker() {
            self.confirm(index, format!("target {}", marker));
            return;
        }

        let Some(link) = self.connection.current().await else {
            self.reject(index, "connection lost".to_string());
            return;
        };
        let result = {
            let mut port = link.port.lock().await;
            self.prober.ping(&mut port, &link.cancel).await
        };

        match result {
            Ok(()) => self.confirm(index, "answers ping".to_string()),
            Err(e) => {
                self.reject(index, format!("ping failed: {}", e));
                self.connection.close().await;
            }
        }
    }

    fn confirm(&mut self, index: usize, fragment: String) {
        let candidate = &mut self.candidates[index];
        candidate.describe(fragment);
        if let Err(e) = candidate.transition(Transition::Confirm) {
            warn!("{}: {}", candidate.identity().id(), e);
            return;
        }
        info!("Confirmed {}", candidate.identity());
        let _ = self.events.send(LinkEvent::DeviceConfirmed {
            identity: candidate.identity().clone(),
            description: candidate.description(),
        });
    }

    fn reject(&mut self, index: usize, reason: String) {
        let candidate = &mut self.candidates[index];
        if let Err(e) = candidate.transition(Transition::Reject) {
            warn!("{}: {}", candidate.identity().id(), e);
            return;
        }
        info!("Rejected {}: {}", candidate.identity(), reason);
        let _ = self.events.send(LinkEvent::CandidateRejected {
            identity: candidate.identity().clone(),
            reason,
        });
    }

    fn defer(&mut self, index: usize, reason: String) {
        let identity = self.candidates[index].identity().clone();
        info!("Deferred {}: {}", identity, reason);
        self.deferred.insert(identity.id().clone());
        let _ = self.events.send(LinkEvent::CandidateDeferred { identity, reason });
    }

    /// Keep the connection on a confirmed device after a validation pass
    /// moved or closed it
    async fn ensure_connected(&mut self) {
        if self.connection.is_connected().await {
            return;
        }
        let Some(identity) = self
            .candidates
            .iter()
            .find(|c| c.is_confirmed())
            .map(|c| c.identity().clone())
        else {
            return;
        };
        if let Err(e) = self.connection.open(identity).await {
            debug!("Could not reconnect to a confirmed device: {}", e);
        }
    }

    fn publish(&self) {
        let confirmed: Vec<ConfirmedDevice> = self
            .candidates
            .iter()
            .filter(|c| c.is_confirmed())
            .map(|c| ConfirmedDevice {
                identity: c.identity().clone(),
                description: c.description(),
            })
            .collect();

        self.confirmed.send_if_modified(|current| {
            if *current == confirmed {
                false
            } else {
                *current = confirmed;
                true
            }
        });
    }
}
