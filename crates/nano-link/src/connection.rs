//! Single active connection to a debug target
//!
//! `ConnectionManager` owns at most one open `TransportHandle`. It is built
//! once by the process composition root and shared as an `Arc`; other
//! components ask it to open or close and never touch the handle directly.
//!
//! The open handle sits behind its own mutex with a per-connection
//! cancellation token, so `close()` only has to cancel the token and drop its
//! reference. In-flight I/O observes `Cancelled` instead of a result.

use std::sync::{Arc, Weak};

use nano_detect::{AccessDenial, PortOpener, TransportHandle, WatcherSet};
use nano_protocol::{DeviceIdentity, LineSettings};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::events::LinkEvent;

/// Host lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Suspend,
    Resume,
}

/// Platform permission status for serial access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessStatus {
    #[default]
    Allowed,
    DeniedByUser,
    DeniedBySystem,
}

impl AccessStatus {
    /// Denial carried by this status, if any
    pub fn denial(self) -> Option<AccessDenial> {
        match self {
            AccessStatus::Allowed => None,
            AccessStatus::DeniedByUser => Some(AccessDenial::ByUser),
            AccessStatus::DeniedBySystem => Some(AccessDenial::BySystem),
        }
    }
}

/// The bound connection as seen by callers
///
/// Cloning shares the same transport; the token is cancelled when the
/// manager closes the connection.
#[derive(Debug, Clone)]
pub struct ActiveLink {
    pub identity: Arc<DeviceIdentity>,
    pub port: Arc<Mutex<TransportHandle>>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct ConnectionState {
    active: Option<ActiveLink>,
    /// Last identity successfully opened, kept after close for auto-reconnect
    remembered: Option<Arc<DeviceIdentity>>,
    auto_reconnect: bool,
    access: AccessStatus,
    lifecycle_registered: bool,
    access_registered: bool,
    /// Handles released by `close()` that in-flight I/O may still hold
    released: Vec<Weak<Mutex<TransportHandle>>>,
}

/// Owner of the single open transport
pub struct ConnectionManager {
    opener: Arc<dyn PortOpener>,
    settings: LineSettings,
    events: broadcast::Sender<LinkEvent>,
    root: CancellationToken,
    state: Mutex<ConnectionState>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager that opens transports through `opener`
    pub fn new(
        opener: Arc<dyn PortOpener>,
        events: broadcast::Sender<LinkEvent>,
        auto_reconnect: bool,
    ) -> Self {
        Self {
            opener,
            settings: LineSettings::debug_target(),
            events,
            root: CancellationToken::new(),
            state: Mutex::new(ConnectionState {
                auto_reconnect,
                ..Default::default()
            }),
        }
    }

    /// Open the transport for `identity`
    ///
    /// Succeeds without reopening when already bound to the same identity.
    /// A different bound identity is closed first.
    pub async fn open(&self, identity: Arc<DeviceIdentity>) -> Result<(), LinkError> {
        let mut state = self.state.lock().await;

        if let Some(active) = &state.active {
            if active.identity.id() == identity.id() {
                debug!("Already connected to {}", identity);
                return Ok(());
            }
        }
        self.close_locked(&mut state);

        if let Some(denial) = state.access.denial() {
            debug!("Not opening {}: access denied {}", identity, denial);
            return Err(LinkError::AccessDenied {
                port: identity.port_path().to_string(),
                denial,
            });
        }

        let handle = match self.opener.open(&identity, &self.settings) {
            Ok(handle) => handle,
            Err(e) => {
                if e.is_expected() {
                    info!("Could not open {}: {}", identity, e);
                } else {
                    warn!("Unexpected failure opening {}: {}", identity, e);
                    let _ = self.events.send(LinkEvent::Error {
                        source: "Connection".into(),
                        message: e.to_string(),
                    });
                }
                return Err(e.into());
            }
        };

        info!("Connected to {}", identity);
        state.active = Some(ActiveLink {
            identity: identity.clone(),
            port: Arc::new(Mutex::new(handle)),
            cancel: self.root.child_token(),
        });
        state.remembered = Some(identity.clone());

        let _ = self.events.send(LinkEvent::DeviceConnected { identity });

        if !state.lifecycle_registered {
            debug!("Registering for lifecycle signals");
            state.lifecycle_registered = true;
        }
        if !state.access_registered {
            debug!("Registering for access changes");
            state.access_registered = true;
        }
        Ok(())
    }

    /// Release the transport; no-op when nothing is open
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        self.close_locked(&mut state);
    }

    fn close_locked(&self, state: &mut ConnectionState) {
        let Some(active) = state.active.take() else {
            return;
        };

        let _ = self.events.send(LinkEvent::DeviceAboutToClose {
            identity: active.identity.clone(),
        });
        active.cancel.cancel();
        state.released.retain(|weak| weak.strong_count() > 0);
        state.released.push(Arc::downgrade(&active.port));
        info!("Closed connection to {}", active.identity);
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    /// The bound connection, if any
    pub async fn current(&self) -> Option<ActiveLink> {
        self.state.lock().await.active.clone()
    }

    /// Identity of the bound connection, if any
    pub async fn current_identity(&self) -> Option<Arc<DeviceIdentity>> {
        self.state
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.identity.clone())
    }

    /// Last identity that was connected, kept after close
    pub async fn remembered(&self) -> Option<Arc<DeviceIdentity>> {
        self.state.lock().await.remembered.clone()
    }

    pub async fn auto_reconnect(&self) -> bool {
        self.state.lock().await.auto_reconnect
    }

    pub async fn set_auto_reconnect(&self, enabled: bool) {
        self.state.lock().await.auto_reconnect = enabled;
    }

    pub async fn access_status(&self) -> AccessStatus {
        self.state.lock().await.access
    }

    /// True when an Added for `identity` should reopen the connection
    pub async fn should_reconnect(&self, identity: &DeviceIdentity) -> bool {
        let state = self.state.lock().await;
        state.active.is_none()
            && state.auto_reconnect
            && state.access == AccessStatus::Allowed
            && state
                .remembered
                .as_ref()
                .map(|r| r.id() == identity.id())
                .unwrap_or(false)
    }

    /// Transport handles still alive, bound or released but held by I/O
    pub async fn open_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.released.retain(|weak| weak.strong_count() > 0);
        state.released.len() + usize::from(state.active.is_some())
    }

    /// Send on the bound transport
    pub async fn send(&self, data: &[u8], limit: Duration) -> Result<usize, LinkError> {
        let link = self.current().await.ok_or(LinkError::NotConnected)?;
        let mut port = link.port.lock().await;
        Ok(port.send(data, limit, &link.cancel).await?)
    }

    /// Receive from the bound transport
    pub async fn receive(&self, max: usize, limit: Duration) -> Result<Vec<u8>, LinkError> {
        let link = self.current().await.ok_or(LinkError::NotConnected)?;
        let mut port = link.port.lock().await;
        Ok(port.receive(max, limit, &link.cancel).await?)
    }

    /// React to a host suspend or resume
    ///
    /// Suspend pauses the running watchers and closes the connection. Resume
    /// restarts only the watchers that were suspended; reconnection then
    /// happens through re-enumeration. Returns how many watchers changed.
    pub async fn handle_lifecycle(&self, signal: LifecycleSignal, watchers: &mut WatcherSet) -> usize {
        if !self.state.lock().await.lifecycle_registered {
            debug!("Ignoring {:?}: lifecycle not registered", signal);
            return 0;
        }

        match signal {
            LifecycleSignal::Suspend => {
                let suspended = watchers.suspend_all().await;
                info!("Suspended {} watcher(s)", suspended);
                self.close().await;
                suspended
            }
            LifecycleSignal::Resume => {
                let resumed = watchers.resume_all();
                if resumed == 0 {
                    debug!("Resume without suspended watchers");
                } else {
                    info!("Resumed {} watcher(s)", resumed);
                }
                resumed
            }
        }
    }

    /// React to a permission change
    ///
    /// Denial closes immediately. Allowed never reopens here; the next Added
    /// event for the remembered device does.
    pub async fn handle_access(&self, status: AccessStatus) {
        let mut state = self.state.lock().await;
        if !state.access_registered {
            debug!("Ignoring access change to {:?}: not registered", status);
            return;
        }

        state.access = status;
        match status.denial() {
            Some(denial) => {
                info!("Serial access denied {}", denial);
                self.close_locked(&mut state);
            }
            None => info!("Serial access allowed"),
        }
    }

    /// Close and cancel everything; used at shutdown
    pub async fn shutdown(&self) {
        self.close().await;
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nano_detect::OpenError;
    use nano_protocol::Selector;

    /// Opener handing out duplex streams; the peers are parked in a list
    #[derive(Default)]
    struct DuplexOpener {
        opens: AtomicUsize,
        peers: std::sync::Mutex<Vec<tokio::io::DuplexStream>>,
        fail_with: std::sync::Mutex<Option<OpenError>>,
    }

    impl PortOpener for DuplexOpener {
        fn open(
            &self,
            identity: &DeviceIdentity,
            settings: &LineSettings,
        ) -> Result<TransportHandle, OpenError> {
            if let Some(e) = self.fail_with.lock().unwrap().clone() {
                return Err(e);
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (ours, theirs) = tokio::io::duplex(64);
            self.peers.lock().unwrap().push(theirs);
            Ok(TransportHandle::new(identity.port_path(), ours, *settings))
        }
    }

    fn identity(port: &str) -> Arc<DeviceIdentity> {
        Arc::new(
            DeviceIdentity::new(
                format!("SERIAL#{}", port),
                port,
                port,
                Selector::new("any"),
            )
            .unwrap(),
        )
    }

    fn manager() -> (Arc<DuplexOpener>, ConnectionManager, broadcast::Receiver<LinkEvent>) {
        let opener = Arc::new(DuplexOpener::default());
        let (tx, rx) = broadcast::channel(32);
        let manager = ConnectionManager::new(opener.clone(), tx, true);
        (opener, manager, rx)
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (opener, manager, mut rx) = manager();
        let a = identity("/dev/ttyACM0");

        manager.open(a.clone()).await.unwrap();
        manager.open(a.clone()).await.unwrap();

        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected().await);
        assert!(matches!(rx.try_recv(), Ok(LinkEvent::DeviceConnected { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_other_identity_closes_first() {
        let (_opener, manager, mut rx) = manager();
        manager.open(identity("/dev/ttyACM0")).await.unwrap();
        manager.open(identity("/dev/ttyACM1")).await.unwrap();

        assert!(matches!(rx.try_recv(), Ok(LinkEvent::DeviceConnected { .. })));
        assert!(matches!(rx.try_recv(), Ok(LinkEvent::DeviceAboutToClose { .. })));
        assert!(matches!(rx.try_recv(), Ok(LinkEvent::DeviceConnected { .. })));
        assert_eq!(manager.open_count().await, 1);
        assert_eq!(
            manager.current_identity().await.unwrap().port_path(),
            "/dev/ttyACM1"
        );
    }

    #[tokio::test]
    async fn test_double_close() {
        let (_opener, manager, mut rx) = manager();
        manager.close().await;
        manager.open(identity("/dev/ttyACM0")).await.unwrap();
        let _ = rx.try_recv();

        manager.close().await;
        manager.close().await;

        assert!(matches!(rx.try_recv(), Ok(LinkEvent::DeviceAboutToClose { .. })));
        assert!(rx.try_recv().is_err());
        assert!(!manager.is_connected().await);
        assert_eq!(manager.open_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let (_opener, manager, _rx) = manager();
        let err = manager
            .send(b"x", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotConnected));
        let err = manager
            .receive(1, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotConnected));
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_receive() {
        let (_opener, manager, _rx) = manager();
        let manager = Arc::new(manager);
        manager.open(identity("/dev/ttyACM0")).await.unwrap();

        let reader = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.receive(32, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(LinkError::Transport(nano_detect::TransportError::Cancelled))
        ));
    }

    #[tokio::test]
    async fn test_open_failure_leaves_no_state() {
        let (opener, manager, _rx) = manager();
        *opener.fail_with.lock().unwrap() = Some(OpenError::Unavailable {
            port: "/dev/ttyACM0".into(),
            reason: "busy".into(),
        });

        let err = manager.open(identity("/dev/ttyACM0")).await.unwrap_err();
        assert!(matches!(err, LinkError::TransportUnavailable { .. }));
        assert!(!manager.is_connected().await);
        assert!(manager.remembered().await.is_none());
    }

    #[tokio::test]
    async fn test_access_denied_closes_and_blocks_open() {
        let (opener, manager, _rx) = manager();
        let a = identity("/dev/ttyACM0");
        manager.open(a.clone()).await.unwrap();

        manager.handle_access(AccessStatus::DeniedByUser).await;
        assert!(!manager.is_connected().await);
        assert!(!manager.should_reconnect(&a).await);

        let err = manager.open(a.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::AccessDenied {
                denial: AccessDenial::ByUser,
                ..
            }
        ));

        manager.handle_access(AccessStatus::Allowed).await;
        assert!(!manager.is_connected().await);
        assert!(manager.should_reconnect(&a).await);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_signals_ignored_before_first_open() {
        let (_opener, manager, _rx) = manager();
        manager.handle_access(AccessStatus::DeniedBySystem).await;
        assert_eq!(manager.access_status().await, AccessStatus::Allowed);
    }

    #[tokio::test]
    async fn test_concurrent_opens_keep_one_handle() {
        let (_opener, manager, _rx) = manager();
        let manager = Arc::new(manager);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let port = format!("/dev/ttyACM{}", i % 4);
                manager.open(identity(&port)).await.unwrap();
                if i % 3 == 0 {
                    manager.close().await;
                }
                manager.open_count().await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap() <= 1);
        }
        assert!(manager.open_count().await <= 1);
    }
}
