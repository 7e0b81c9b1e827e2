//! Device watcher state machine
//!
//! A `DeviceWatcher` tracks one selector. While running it owns a delivery
//! task that polls a `DeviceEnumerator`, diffs snapshots and emits
//! `WatcherEvent`s on an mpsc channel:
//!
//! - `Added` for every endpoint present at start, then for each new one
//! - `Removed` when an endpoint disappears
//! - `EnumerationCompleted` once per delivery cycle, after the initial `Added`s
//!
//! Status moves `Stopped -> Started -> EnumerationCompleted`. Suspension is a
//! separate flag: `suspend()` stops delivery but keeps the status history,
//! `resume()` restarts delivery with a full re-enumeration.
//!
//! Every delivery cycle gets a new generation number. Events carry it so the
//! consumer can drop events from a cycle that was already torn down.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nano_protocol::{DeviceId, DeviceIdentity, Selector};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DetectError;
use crate::scanner::DeviceEnumerator;

/// Identifies a watcher within a `WatcherSet`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(pub u32);

/// Events delivered by a watcher
#[derive(Debug, Clone)]
pub enum WatcherEvent {
    /// An endpoint matching the selector is present
    Added {
        watcher: WatcherId,
        generation: u64,
        identity: Arc<DeviceIdentity>,
    },
    /// A previously reported endpoint is gone
    Removed {
        watcher: WatcherId,
        generation: u64,
        id: DeviceId,
    },
    /// All pre-existing endpoints have been reported
    EnumerationCompleted { watcher: WatcherId, generation: u64 },
}

impl WatcherEvent {
    /// Watcher that produced the event
    pub fn watcher(&self) -> WatcherId {
        match self {
            WatcherEvent::Added { watcher, .. }
            | WatcherEvent::Removed { watcher, .. }
            | WatcherEvent::EnumerationCompleted { watcher, .. } => *watcher,
        }
    }

    /// Delivery cycle the event belongs to
    pub fn generation(&self) -> u64 {
        match self {
            WatcherEvent::Added { generation, .. }
            | WatcherEvent::Removed { generation, .. }
            | WatcherEvent::EnumerationCompleted { generation, .. } => *generation,
        }
    }
}

/// Enumeration progress of a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    Stopped,
    Started,
    EnumerationCompleted,
}

/// Externally visible watcher state
///
/// `Suspended` masks the status while delivery is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Started,
    Suspended,
    EnumerationCompleted,
}

type Snapshot = BTreeMap<DeviceId, Arc<DeviceIdentity>>;

struct Delivery {
    cancel: CancellationToken,
    task: JoinHandle<Snapshot>,
}

/// Watcher for one selector
pub struct DeviceWatcher {
    id: WatcherId,
    selector: Selector,
    enumerator: Arc<dyn DeviceEnumerator>,
    events: mpsc::Sender<WatcherEvent>,
    poll_interval: Duration,
    status: WatcherStatus,
    started: bool,
    suspended: bool,
    generation: u64,
    completed_generation: Option<u64>,
    known: Snapshot,
    delivery: Option<Delivery>,
}

impl std::fmt::Debug for DeviceWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceWatcher")
            .field("id", &self.id)
            .field("selector", &self.selector)
            .field("status", &self.status)
            .field("suspended", &self.suspended)
            .field("generation", &self.generation)
            .finish()
    }
}

impl DeviceWatcher {
    /// Create a stopped watcher
    pub fn new(
        id: WatcherId,
        selector: Selector,
        enumerator: Arc<dyn DeviceEnumerator>,
        events: mpsc::Sender<WatcherEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            selector,
            enumerator,
            events,
            poll_interval,
            status: WatcherStatus::Stopped,
            started: false,
            suspended: false,
            generation: 0,
            completed_generation: None,
            known: Snapshot::new(),
            delivery: None,
        }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn status(&self) -> WatcherStatus {
        self.status
    }

    /// Status with suspension folded in
    pub fn state(&self) -> WatcherState {
        if self.suspended {
            return WatcherState::Suspended;
        }
        match self.status {
            WatcherStatus::Stopped => WatcherState::Stopped,
            WatcherStatus::Started => WatcherState::Started,
            WatcherStatus::EnumerationCompleted => WatcherState::EnumerationCompleted,
        }
    }

    /// True between `start()` and `stop()`, suspended or not
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// True while a delivery task is running
    pub fn is_delivering(&self) -> bool {
        self.delivery.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Begin enumeration and event delivery
    ///
    /// No-op when already started.
    pub fn start(&mut self) -> bool {
        if matches!(
            self.status,
            WatcherStatus::Started | WatcherStatus::EnumerationCompleted
        ) {
            return false;
        }

        info!("Starting watcher {:?} for selector {}", self.id, self.selector);
        self.known.clear();
        self.spawn_delivery(Snapshot::new());
        self.status = WatcherStatus::Started;
        self.started = true;
        true
    }

    /// Stop event delivery
    ///
    /// No-op unless started.
    pub async fn stop(&mut self) -> bool {
        if !matches!(
            self.status,
            WatcherStatus::Started | WatcherStatus::EnumerationCompleted
        ) {
            return false;
        }

        info!("Stopping watcher {:?}", self.id);
        self.halt_delivery().await;
        self.known.clear();
        self.status = WatcherStatus::Stopped;
        self.started = false;
        self.suspended = false;
        true
    }

    /// Pause delivery, keeping status history and the last snapshot
    ///
    /// Returns false when the watcher was not running.
    pub async fn suspend(&mut self) -> bool {
        if !self.started || self.suspended {
            return false;
        }

        debug!("Suspending watcher {:?}", self.id);
        if let Some(snapshot) = self.halt_delivery().await {
            self.known = snapshot;
        }
        self.suspended = true;
        true
    }

    /// Restart delivery after `suspend()`
    ///
    /// Returns false when the watcher was not suspended.
    pub fn resume(&mut self) -> bool {
        if !self.suspended {
            return false;
        }

        debug!("Resuming watcher {:?}", self.id);
        let previous = std::mem::take(&mut self.known);
        self.spawn_delivery(previous);
        self.suspended = false;
        true
    }

    /// True if `event` belongs to the running delivery cycle
    pub fn is_current(&self, event: &WatcherEvent) -> bool {
        self.delivery.is_some() && event.generation() == self.generation
    }

    /// Record an enumeration-completed event
    ///
    /// Returns true the first time the running cycle completes.
    pub fn mark_completed(&mut self, generation: u64) -> bool {
        if self.delivery.is_none()
            || generation != self.generation
            || self.completed_generation == Some(generation)
        {
            return false;
        }
        self.completed_generation = Some(generation);
        self.status = WatcherStatus::EnumerationCompleted;
        true
    }

    fn spawn_delivery(&mut self, previous: Snapshot) {
        self.generation += 1;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_delivery(
            DeliveryContext {
                watcher: self.id,
                generation: self.generation,
                selector: self.selector.clone(),
                enumerator: self.enumerator.clone(),
                events: self.events.clone(),
                poll_interval: self.poll_interval,
                cancel: cancel.clone(),
            },
            previous,
        ));
        self.delivery = Some(Delivery { cancel, task });
    }

    async fn halt_delivery(&mut self) -> Option<Snapshot> {
        let delivery = self.delivery.take()?;
        delivery.cancel.cancel();
        match delivery.task.await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Watcher {:?} delivery task failed: {}", self.id, e);
                None
            }
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        if let Some(delivery) = &self.delivery {
            delivery.cancel.cancel();
        }
    }
}

struct DeliveryContext {
    watcher: WatcherId,
    generation: u64,
    selector: Selector,
    enumerator: Arc<dyn DeviceEnumerator>,
    events: mpsc::Sender<WatcherEvent>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl DeliveryContext {
    async fn enumerate(&self) -> Result<Snapshot, DetectError> {
        let enumerator = self.enumerator.clone();
        let selector = self.selector.clone();
        let identities = tokio::task::spawn_blocking(move || enumerator.enumerate(&selector))
            .await
            .map_err(|e| DetectError::EnumerationFailed(e.to_string()))??;

        Ok(identities
            .into_iter()
            .map(|identity| (identity.id().clone(), Arc::new(identity)))
            .collect())
    }

    /// Send an event unless delivery is being torn down
    async fn emit(&self, event: WatcherEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = self.events.send(event) => result.is_ok(),
        }
    }

    async fn added(&self, identity: &Arc<DeviceIdentity>) -> bool {
        self.emit(WatcherEvent::Added {
            watcher: self.watcher,
            generation: self.generation,
            identity: identity.clone(),
        })
        .await
    }

    async fn removed(&self, id: &DeviceId) -> bool {
        self.emit(WatcherEvent::Removed {
            watcher: self.watcher,
            generation: self.generation,
            id: id.clone(),
        })
        .await
    }
}

/// Delivery loop; returns the last snapshot when cancelled
async fn run_delivery(ctx: DeliveryContext, previous: Snapshot) -> Snapshot {
    let mut ticker = interval(ctx.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Initial enumeration, retried on the poll interval until it succeeds
    let initial = loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return previous,
            _ = ticker.tick() => {}
        }
        match ctx.enumerate().await {
            Ok(snapshot) => break snapshot,
            Err(e) => warn!("Watcher {:?} enumeration failed: {}", ctx.watcher, e),
        }
    };

    // On cancellation return the last fully reported snapshot so a resume
    // repeats whatever was not delivered
    for id in previous.keys().filter(|id| !initial.contains_key(*id)) {
        if !ctx.removed(id).await {
            return previous;
        }
    }
    for identity in initial.values() {
        if !ctx.added(identity).await {
            return previous;
        }
    }
    debug!(
        "Watcher {:?} reported {} pre-existing endpoint(s)",
        ctx.watcher,
        initial.len()
    );
    if !ctx
        .emit(WatcherEvent::EnumerationCompleted {
            watcher: ctx.watcher,
            generation: ctx.generation,
        })
        .await
    {
        return previous;
    }

    let mut known = initial;
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = match ctx.enumerate().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Watcher {:?} enumeration failed: {}", ctx.watcher, e);
                continue;
            }
        };

        for id in known.keys().filter(|id| !current.contains_key(*id)) {
            debug!("Watcher {:?}: {} removed", ctx.watcher, id);
            if !ctx.removed(id).await {
                return known;
            }
        }
        for (id, identity) in current.iter() {
            if !known.contains_key(id) {
                debug!("Watcher {:?}: {} added", ctx.watcher, id);
                if !ctx.added(identity).await {
                    return known;
                }
            }
        }
        known = current;
    }

    known
}

/// All watchers sharing one event channel
///
/// Tracks the global enumeration-complete condition: each watcher counts
/// once per cycle, and the set is complete when the count reaches the
/// number of delivering watchers.
pub struct WatcherSet {
    watchers: Vec<DeviceWatcher>,
    enumerator: Arc<dyn DeviceEnumerator>,
    events: mpsc::Sender<WatcherEvent>,
    poll_interval: Duration,
    completed: usize,
    next_id: u32,
}

impl WatcherSet {
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        events: mpsc::Sender<WatcherEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            watchers: Vec::new(),
            enumerator,
            events,
            poll_interval,
            completed: 0,
            next_id: 1,
        }
    }

    /// Register a watcher for `selector`; an existing one is reused
    pub fn add(&mut self, selector: Selector) -> WatcherId {
        if let Some(existing) = self.watchers.iter().find(|w| w.selector == selector) {
            return existing.id;
        }
        let id = WatcherId(self.next_id);
        self.next_id += 1;
        self.watchers.push(DeviceWatcher::new(
            id,
            selector,
            self.enumerator.clone(),
            self.events.clone(),
            self.poll_interval,
        ));
        id
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    pub fn get(&self, id: WatcherId) -> Option<&DeviceWatcher> {
        self.watchers.iter().find(|w| w.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceWatcher> {
        self.watchers.iter()
    }

    /// True if any watcher is delivering events
    pub fn any_delivering(&self) -> bool {
        self.watchers.iter().any(DeviceWatcher::is_delivering)
    }

    /// Start every stopped watcher; returns how many started
    pub fn start_all(&mut self) -> usize {
        let started = self.watchers.iter_mut().filter_map(|w| w.start().then_some(())).count();
        if started > 0 {
            self.completed = 0;
        }
        started
    }

    /// Stop every watcher
    pub async fn stop_all(&mut self) {
        for watcher in &mut self.watchers {
            watcher.stop().await;
        }
        self.completed = 0;
    }

    /// Suspend every running watcher; returns how many were suspended
    pub async fn suspend_all(&mut self) -> usize {
        let mut suspended = 0;
        for watcher in &mut self.watchers {
            if watcher.suspend().await {
                suspended += 1;
            }
        }
        suspended
    }

    /// Resume exactly the suspended watchers; returns how many resumed
    pub fn resume_all(&mut self) -> usize {
        let resumed = self.watchers.iter_mut().filter_map(|w| w.resume().then_some(())).count();
        if resumed > 0 {
            self.completed = 0;
        }
        resumed
    }

    /// True if `event` comes from a watcher's running cycle
    pub fn is_current(&self, event: &WatcherEvent) -> bool {
        self.get(event.watcher())
            .map(|w| w.is_current(event))
            .unwrap_or(false)
    }

    /// Record a watcher's completion
    ///
    /// Returns true when this completion makes the whole set complete.
    pub fn mark_completed(&mut self, watcher: WatcherId, generation: u64) -> bool {
        let Some(w) = self.watchers.iter_mut().find(|w| w.id == watcher) else {
            return false;
        };
        if !w.mark_completed(generation) {
            return false;
        }
        self.completed += 1;
        let delivering = self.watchers.iter().filter(|w| w.is_delivering()).count();
        debug!(
            "Enumeration completed for {:?} ({}/{})",
            watcher, self.completed, delivering
        );
        self.completed == delivering
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Enumerator whose port list tests can change
    #[derive(Default)]
    struct FakeEnumerator {
        ports: Mutex<Vec<DeviceIdentity>>,
    }

    impl FakeEnumerator {
        fn set(&self, names: &[&str]) {
            *self.ports.lock().unwrap() = names
                .iter()
                .map(|n| {
                    DeviceIdentity::new(
                        format!("SERIAL#{}", n),
                        *n,
                        format!("/dev/{}", n),
                        Selector::new("any"),
                    )
                    .unwrap()
                })
                .collect();
        }
    }

    impl DeviceEnumerator for FakeEnumerator {
        fn enumerate(&self, _selector: &Selector) -> Result<Vec<DeviceIdentity>, DetectError> {
            Ok(self.ports.lock().unwrap().clone())
        }
    }

    fn watcher_with(
        enumerator: Arc<FakeEnumerator>,
    ) -> (DeviceWatcher, mpsc::Receiver<WatcherEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let watcher = DeviceWatcher::new(
            WatcherId(1),
            Selector::new("any"),
            enumerator,
            tx,
            Duration::from_millis(10),
        );
        (watcher, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<WatcherEvent>) -> WatcherEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_initial_enumeration_then_completed() {
        let enumerator = Arc::new(FakeEnumerator::default());
        enumerator.set(&["ttyACM0", "ttyACM1"]);
        let (mut watcher, mut rx) = watcher_with(enumerator);

        assert!(watcher.start());
        assert_eq!(watcher.state(), WatcherState::Started);

        assert!(matches!(next(&mut rx).await, WatcherEvent::Added { .. }));
        assert!(matches!(next(&mut rx).await, WatcherEvent::Added { .. }));
        let done = next(&mut rx).await;
        assert!(matches!(done, WatcherEvent::EnumerationCompleted { .. }));
        assert!(watcher.mark_completed(done.generation()));
        assert!(!watcher.mark_completed(done.generation()));
        assert_eq!(watcher.status(), WatcherStatus::EnumerationCompleted);

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_hot_plug_events() {
        let enumerator = Arc::new(FakeEnumerator::default());
        let (mut watcher, mut rx) = watcher_with(enumerator.clone());
        watcher.start();
        assert!(matches!(
            next(&mut rx).await,
            WatcherEvent::EnumerationCompleted { .. }
        ));

        enumerator.set(&["ttyACM0"]);
        match next(&mut rx).await {
            WatcherEvent::Added { identity, .. } => assert_eq!(identity.port_path(), "/dev/ttyACM0"),
            other => panic!("Expected Added, got {:?}", other),
        }

        enumerator.set(&[]);
        match next(&mut rx).await {
            WatcherEvent::Removed { id, .. } => assert_eq!(id.as_str(), "SERIAL#ttyACM0"),
            other => panic!("Expected Removed, got {:?}", other),
        }

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let enumerator = Arc::new(FakeEnumerator::default());
        let (mut watcher, _rx) = watcher_with(enumerator);

        assert!(!watcher.stop().await);
        assert!(watcher.start());
        assert!(!watcher.start());
        assert!(watcher.is_started());
        assert!(watcher.stop().await);
        assert!(!watcher.stop().await);
        assert_eq!(watcher.state(), WatcherState::Stopped);
        assert!(!watcher.is_started());
    }

    #[tokio::test]
    async fn test_suspend_resume_keeps_status_and_reports_changes() {
        let enumerator = Arc::new(FakeEnumerator::default());
        enumerator.set(&["ttyACM0", "ttyACM1"]);
        let (mut watcher, mut rx) = watcher_with(enumerator.clone());
        watcher.start();
        next(&mut rx).await;
        next(&mut rx).await;
        let done = next(&mut rx).await;
        watcher.mark_completed(done.generation());

        assert!(watcher.suspend().await);
        assert!(!watcher.suspend().await);
        assert_eq!(watcher.state(), WatcherState::Suspended);
        assert_eq!(watcher.status(), WatcherStatus::EnumerationCompleted);
        assert!(!watcher.is_current(&done));

        enumerator.set(&["ttyACM1"]);
        assert!(watcher.resume());
        assert!(!watcher.resume());
        assert_eq!(watcher.state(), WatcherState::EnumerationCompleted);

        match next(&mut rx).await {
            WatcherEvent::Removed { id, generation, .. } => {
                assert_eq!(id.as_str(), "SERIAL#ttyACM0");
                assert_eq!(generation, watcher.generation());
            }
            other => panic!("Expected Removed, got {:?}", other),
        }
        assert!(matches!(next(&mut rx).await, WatcherEvent::Added { .. }));
        assert!(matches!(
            next(&mut rx).await,
            WatcherEvent::EnumerationCompleted { .. }
        ));

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_resume_without_suspend_is_noop() {
        let enumerator = Arc::new(FakeEnumerator::default());
        let (mut watcher, _rx) = watcher_with(enumerator);
        assert!(!watcher.resume());
        assert_eq!(watcher.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_set_completes_when_all_watchers_report() {
        let enumerator = Arc::new(FakeEnumerator::default());
        let (tx, mut rx) = mpsc::channel(64);
        let mut set = WatcherSet::new(enumerator, tx, Duration::from_millis(10));
        let usb = set.add(Selector::new("usb"));
        let pci = set.add(Selector::new("pci"));
        assert_eq!(set.add(Selector::new("usb")), usb);
        assert_eq!(set.start_all(), 2);

        let mut completions = Vec::new();
        while completions.len() < 2 {
            let event = next(&mut rx).await;
            if let WatcherEvent::EnumerationCompleted { .. } = event {
                assert!(set.is_current(&event));
                completions.push(set.mark_completed(event.watcher(), event.generation()));
            }
        }
        assert_eq!(completions, vec![false, true]);
        assert!(set.get(pci).is_some());

        assert_eq!(set.suspend_all().await, 2);
        assert!(!set.any_delivering());
        assert_eq!(set.resume_all(), 2);
        assert!(set.any_delivering());
        set.stop_all().await;
    }
}
