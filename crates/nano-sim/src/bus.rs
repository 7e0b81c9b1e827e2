//! Virtual serial bus
//!
//! `VirtualPortBus` stands in for the platform: it enumerates plugged virtual
//! ports like `SerialPortEnumerator` and opens them like `SerialPortOpener`.
//! Opening a port spawns a virtual target on the far end of an in-memory
//! duplex stream, so it must happen inside a Tokio runtime.
//!
//! Tests can hot-plug ports, inject open faults and count live handles.

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use nano_detect::{AccessDenial, DetectError, DeviceEnumerator, OpenError, PortOpener, TransportHandle};
use nano_protocol::{DeviceIdentity, IdentityError, LineSettings, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::target::{run_virtual_target, TargetBehavior};

/// Errors from manipulating the virtual bus
#[derive(Debug, Error)]
pub enum SimError {
    #[error("port {0} is already plugged")]
    AlreadyPlugged(String),

    #[error("port {0} is not plugged")]
    NotPlugged(String),

    #[error("invalid virtual port: {0}")]
    Identity(#[from] IdentityError),
}

/// Configuration of one virtual port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualPortConfig {
    /// Platform device id reported by enumeration
    pub id: String,
    /// Display name
    pub name: String,
    /// Port path used to open it
    pub port: String,
    /// Selector the port is enumerated under
    #[serde(default = "default_selector")]
    pub selector: Selector,
    /// How the target behind the port answers pings
    #[serde(default)]
    pub behavior: TargetBehavior,
}

fn default_selector() -> Selector {
    Selector::new("usb")
}

impl VirtualPortConfig {
    /// USB-style port whose id carries a `NANO_<marker>` serial segment
    pub fn nano_usb(port: &str, marker: &str) -> Self {
        Self {
            id: format!("USB#VID_2E8A&PID_000A#NANO_{}#{}", marker, port),
            name: format!("nano {}", marker),
            port: port.to_string(),
            selector: default_selector(),
            behavior: TargetBehavior::Responsive,
        }
    }

    /// Port with an id that does not self-identify
    pub fn plain(port: &str, behavior: TargetBehavior) -> Self {
        Self {
            id: format!("SERIAL#{}", port),
            name: port.rsplit('/').next().unwrap_or(port).to_string(),
            port: port.to_string(),
            selector: default_selector(),
            behavior,
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Selector::new(selector);
        self
    }
}

/// Failure injected into the next opens of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFault {
    /// Port held by another process
    Busy,
    DeniedByUser,
    DeniedBySystem,
}

struct VirtualPort {
    identity: DeviceIdentity,
    behavior: TargetBehavior,
    fault: Option<OpenFault>,
    pings: Arc<AtomicUsize>,
    opens: usize,
    unplugged: CancellationToken,
}

#[derive(Default)]
struct Counters {
    live: AtomicUsize,
    peak: AtomicUsize,
}

/// Simulated platform serial bus
#[derive(Default)]
pub struct VirtualPortBus {
    ports: Mutex<BTreeMap<String, VirtualPort>>,
    counters: Arc<Counters>,
}

impl VirtualPortBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn ports(&self) -> MutexGuard<'_, BTreeMap<String, VirtualPort>> {
        self.ports.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Plug a port; watchers report it on their next poll
    pub fn plug(&self, config: VirtualPortConfig) -> Result<(), SimError> {
        let identity = DeviceIdentity::new(
            config.id,
            config.name,
            config.port.clone(),
            config.selector,
        )?;
        let mut ports = self.ports();
        if ports.contains_key(&config.port) {
            return Err(SimError::AlreadyPlugged(config.port));
        }
        info!("Plugged virtual port {}", identity);
        ports.insert(
            config.port,
            VirtualPort {
                identity,
                behavior: config.behavior,
                fault: None,
                pings: Arc::new(AtomicUsize::new(0)),
                opens: 0,
                unplugged: CancellationToken::new(),
            },
        );
        Ok(())
    }

    /// Unplug a port; open handles see the stream close
    pub fn unplug(&self, port: &str) -> Result<(), SimError> {
        let removed = self
            .ports()
            .remove(port)
            .ok_or_else(|| SimError::NotPlugged(port.to_string()))?;
        removed.unplugged.cancel();
        info!("Unplugged virtual port {}", port);
        Ok(())
    }

    /// Make future opens of `port` fail, or succeed again with `None`
    pub fn set_fault(&self, port: &str, fault: Option<OpenFault>) -> Result<(), SimError> {
        let mut ports = self.ports();
        let entry = ports
            .get_mut(port)
            .ok_or_else(|| SimError::NotPlugged(port.to_string()))?;
        entry.fault = fault;
        Ok(())
    }

    /// Change how future connections to `port` answer pings
    pub fn set_behavior(&self, port: &str, behavior: TargetBehavior) -> Result<(), SimError> {
        let mut ports = self.ports();
        let entry = ports
            .get_mut(port)
            .ok_or_else(|| SimError::NotPlugged(port.to_string()))?;
        entry.behavior = behavior;
        Ok(())
    }

    /// Pings received by the target on `port`
    pub fn pings(&self, port: &str) -> usize {
        self.ports()
            .get(port)
            .map(|p| p.pings.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Successful opens of `port`
    pub fn opens(&self, port: &str) -> usize {
        self.ports().get(port).map(|p| p.opens).unwrap_or(0)
    }

    /// Handles currently alive across every port
    pub fn live_handles(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously alive handles seen
    pub fn peak_handles(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }
}

impl DeviceEnumerator for VirtualPortBus {
    fn enumerate(&self, selector: &Selector) -> Result<Vec<DeviceIdentity>, DetectError> {
        let any = matches!(selector.as_str(), "any" | "*");
        Ok(self
            .ports()
            .values()
            .filter(|p| any || p.identity.selector() == selector)
            .map(|p| p.identity.clone())
            .collect())
    }
}

impl PortOpener for VirtualPortBus {
    fn open(
        &self,
        identity: &DeviceIdentity,
        settings: &LineSettings,
    ) -> Result<TransportHandle, OpenError> {
        let path = identity.port_path().to_string();
        let mut ports = self.ports();
        let Some(port) = ports.get_mut(&path) else {
            return Err(OpenError::Unavailable {
                port: path,
                reason: "no such device".into(),
            });
        };

        match port.fault {
            Some(OpenFault::Busy) => {
                return Err(OpenError::Unavailable {
                    port: path,
                    reason: "device busy".into(),
                })
            }
            Some(OpenFault::DeniedByUser) => {
                return Err(OpenError::AccessDenied {
                    port: path,
                    denial: AccessDenial::ByUser,
                })
            }
            Some(OpenFault::DeniedBySystem) => {
                return Err(OpenError::AccessDenied {
                    port: path,
                    denial: AccessDenial::BySystem,
                })
            }
            None => {}
        }

        let (host, target) = tokio::io::duplex(1024);
        let pings = port.pings.clone();
        let behavior = port.behavior;
        let unplugged = port.unplugged.clone();
        tokio::spawn(async move {
            if let Err(e) = run_virtual_target(target, behavior, pings, unplugged).await {
                warn!("Virtual target failed: {}", e);
            }
        });
        port.opens += 1;

        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(live, Ordering::SeqCst);
        debug!("Opened virtual port {} ({} live)", path, live);

        let stream = CountedStream {
            inner: host,
            counters: self.counters.clone(),
        };
        Ok(TransportHandle::new(path, stream, *settings))
    }
}

/// Host end of a virtual port; releases its live-handle slot on drop
struct CountedStream {
    inner: DuplexStream,
    counters: Arc<Counters>,
}

impl Drop for CountedStream {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncRead for CountedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nano_detect::TargetProber;

    #[test]
    fn test_enumerate_by_selector() {
        let bus = VirtualPortBus::new();
        bus.plug(VirtualPortConfig::nano_usb("/dev/ttyACM0", "A")).unwrap();
        bus.plug(VirtualPortConfig::plain("/dev/ttyS0", TargetBehavior::Silent).with_selector("pci"))
            .unwrap();

        assert_eq!(bus.enumerate(&Selector::new("usb")).unwrap().len(), 1);
        assert_eq!(bus.enumerate(&Selector::new("pci")).unwrap().len(), 1);
        assert_eq!(bus.enumerate(&Selector::new("any")).unwrap().len(), 2);
        assert!(bus.enumerate(&Selector::new("hid")).unwrap().is_empty());
    }

    #[test]
    fn test_plug_twice_and_unplug_missing() {
        let bus = VirtualPortBus::new();
        bus.plug(VirtualPortConfig::nano_usb("/dev/ttyACM0", "A")).unwrap();
        assert!(matches!(
            bus.plug(VirtualPortConfig::nano_usb("/dev/ttyACM0", "B")),
            Err(SimError::AlreadyPlugged(_))
        ));
        bus.unplug("/dev/ttyACM0").unwrap();
        assert!(matches!(
            bus.unplug("/dev/ttyACM0"),
            Err(SimError::NotPlugged(_))
        ));
    }

    #[tokio::test]
    async fn test_open_ping_and_live_count() {
        let bus = VirtualPortBus::new();
        bus.plug(VirtualPortConfig::plain("/dev/ttyUSB0", TargetBehavior::Responsive))
            .unwrap();
        let identity = bus.enumerate(&Selector::new("usb")).unwrap().remove(0);

        let mut handle = bus.open(&identity, &LineSettings::debug_target()).unwrap();
        assert_eq!(bus.live_handles(), 1);

        TargetProber::new()
            .ping(&mut handle, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bus.pings("/dev/ttyUSB0"), 1);

        drop(handle);
        assert_eq!(bus.live_handles(), 0);
        assert_eq!(bus.peak_handles(), 1);
        assert_eq!(bus.opens("/dev/ttyUSB0"), 1);
    }

    #[tokio::test]
    async fn test_open_faults() {
        let bus = VirtualPortBus::new();
        bus.plug(VirtualPortConfig::plain("/dev/ttyUSB0", TargetBehavior::Responsive))
            .unwrap();
        let identity = bus.enumerate(&Selector::new("usb")).unwrap().remove(0);
        let settings = LineSettings::debug_target();

        bus.set_fault("/dev/ttyUSB0", Some(OpenFault::Busy)).unwrap();
        assert!(matches!(
            bus.open(&identity, &settings),
            Err(OpenError::Unavailable { .. })
        ));

        bus.set_fault("/dev/ttyUSB0", Some(OpenFault::DeniedByUser)).unwrap();
        assert!(matches!(
            bus.open(&identity, &settings),
            Err(OpenError::AccessDenied {
                denial: AccessDenial::ByUser,
                ..
            })
        ));

        bus.set_fault("/dev/ttyUSB0", None).unwrap();
        assert!(bus.open(&identity, &settings).is_ok());

        bus.unplug("/dev/ttyUSB0").unwrap();
        assert!(matches!(
            bus.open(&identity, &settings),
            Err(OpenError::Unavailable { .. })
        ));
    }
}
