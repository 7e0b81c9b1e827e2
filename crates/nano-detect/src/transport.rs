//! Transport access for debug targets
//!
//! A `PortOpener` turns a `DeviceIdentity` into an open `TransportHandle`.
//! The handle is generic over the underlying stream so the same code path
//! serves real serial ports (`tokio_serial::SerialStream`) and in-memory
//! streams (`tokio::io::duplex`) used by the simulator.

use std::io::ErrorKind;
use std::time::Duration;

use nano_protocol::{DataBits, DeviceIdentity, FlowControl, LineSettings, Parity, StopBits};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{OpenError, TransportError};

/// Byte stream a transport handle can own
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Capability that acquires transports from the platform
pub trait PortOpener: Send + Sync {
    /// Open the endpoint behind `identity` with `settings` applied
    fn open(
        &self,
        identity: &DeviceIdentity,
        settings: &LineSettings,
    ) -> Result<TransportHandle, OpenError>;
}

/// One opened serial endpoint
pub struct TransportHandle {
    port: String,
    io: Box<dyn AsyncStream>,
    settings: LineSettings,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("port", &self.port)
            .field("settings", &self.settings)
            .field("io", &"<stream>")
            .finish()
    }
}

impl TransportHandle {
    /// Wrap an already opened stream
    pub fn new<T>(port: impl Into<String>, io: T, settings: LineSettings) -> Self
    where
        T: AsyncStream + 'static,
    {
        Self {
            port: port.into(),
            io: Box::new(io),
            settings,
        }
    }

    /// Port path this handle was opened on
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Line settings applied at open time
    pub fn settings(&self) -> &LineSettings {
        &self.settings
    }

    /// Write all of `data` and flush
    ///
    /// Returns the number of bytes written.
    pub async fn send(
        &mut self,
        data: &[u8],
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, TransportError> {
        let io = &mut self.io;
        let write = async {
            io.write_all(data).await?;
            io.flush().await?;
            Ok::<_, std::io::Error>(data.len())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = timeout(limit, write) => match result {
                Ok(Ok(n)) => {
                    trace!("Sent {} bytes to {}: {:02X?}", n, self.port, data);
                    Ok(n)
                }
                Ok(Err(e)) => Err(TransportError::Io(e)),
                Err(_) => Err(TransportError::Timeout {
                    operation: "send",
                    after: limit,
                }),
            },
        }
    }

    /// Read until `max` bytes arrived or the deadline passes
    ///
    /// A deadline with nothing read is `Timeout`; a deadline after a partial
    /// read returns the partial buffer. End of stream with nothing read is
    /// `Closed`.
    pub async fn receive(
        &mut self,
        max: usize,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + limit;
        let mut received = Vec::with_capacity(max);
        let mut buf = vec![0u8; max];
        let mut timed_out = false;
        let mut eof = false;

        while received.len() < max {
            let remaining = max - received.len();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                result = timeout_at(deadline, self.io.read(&mut buf[..remaining])) => match result {
                    Ok(Ok(0)) => {
                        eof = true;
                        break;
                    }
                    Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
                    Ok(Err(e)) if e.kind() == ErrorKind::WouldBlock => {
                        tokio::task::yield_now().await;
                    }
                    Ok(Err(e)) => return Err(TransportError::Io(e)),
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                },
            }
        }

        trace!(
            "Received {} of {} bytes from {}: {:02X?}",
            received.len(),
            max,
            self.port,
            received
        );

        if received.is_empty() && max > 0 {
            if timed_out {
                return Err(TransportError::Timeout {
                    operation: "receive",
                    after: limit,
                });
            }
            if eof {
                return Err(TransportError::Closed);
            }
        }
        Ok(received)
    }
}

/// Opens real serial ports with `tokio_serial`
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortOpener;

impl SerialPortOpener {
    pub fn new() -> Self {
        Self
    }
}

impl PortOpener for SerialPortOpener {
    fn open(
        &self,
        identity: &DeviceIdentity,
        settings: &LineSettings,
    ) -> Result<TransportHandle, OpenError> {
        let path = identity.port_path();
        debug!("Opening {} at {} baud", path, settings.baud_rate);

        let stream = tokio_serial::new(path, settings.baud_rate)
            .data_bits(data_bits(settings.data_bits))
            .parity(parity(settings.parity))
            .stop_bits(stop_bits(settings.stop_bits))
            .flow_control(flow_control(settings.flow_control))
            .timeout(settings.read_timeout)
            .open_native_async()
            .map_err(|e| OpenError::from_serial(path, &e))?;

        Ok(TransportHandle::new(path, stream, *settings))
    }
}

fn data_bits(bits: DataBits) -> tokio_serial::DataBits {
    match bits {
        DataBits::Seven => tokio_serial::DataBits::Seven,
        DataBits::Eight => tokio_serial::DataBits::Eight,
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    }
}

fn stop_bits(bits: StopBits) -> tokio_serial::StopBits {
    match bits {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
    }
}

fn flow_control(flow: FlowControl) -> tokio_serial::FlowControl {
    match flow {
        FlowControl::None => tokio_serial::FlowControl::None,
        FlowControl::Software => tokio_serial::FlowControl::Software,
        FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
    }
}
