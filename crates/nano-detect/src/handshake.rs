//! Ping handshake for target validation
//!
//! Sends the constant ping header and payload, then waits for a reply of
//! exactly `PING_RESPONSE_LEN` bytes. Only the length is checked; anything
//! that answers a ping with a full frame is treated as a live target.

use std::time::Duration;

use nano_protocol::ping::{RESPONSE_TIMEOUT, SEND_TIMEOUT};
use nano_protocol::{DeviceIdentity, LineSettings, PING_HEADER, PING_PAYLOAD, PING_RESPONSE_LEN};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{OpenError, TransportError, ValidationError};
use crate::transport::{PortOpener, SerialPortOpener, TransportHandle};

/// Timeouts for the ping exchange
#[derive(Debug, Clone)]
pub struct PingConfig {
    /// Bound on each of the two writes
    pub send_timeout: Duration,
    /// Bound on reading the reply
    pub response_timeout: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            send_timeout: SEND_TIMEOUT,
            response_timeout: RESPONSE_TIMEOUT,
        }
    }
}

/// Runs the ping handshake over an open transport
#[derive(Debug, Clone, Default)]
pub struct TargetProber {
    config: PingConfig,
}

impl TargetProber {
    /// Create a prober with default timeouts
    pub fn new() -> Self {
        Self {
            config: PingConfig::default(),
        }
    }

    /// Create a prober with custom timeouts
    pub fn with_config(config: PingConfig) -> Self {
        Self { config }
    }

    /// Ping the target on `port`
    pub async fn ping(
        &self,
        port: &mut TransportHandle,
        cancel: &CancellationToken,
    ) -> Result<(), ValidationError> {
        trace!("Sending ping header to {}", port.port());
        port.send(&PING_HEADER, self.config.send_timeout, cancel)
            .await?;

        trace!("Sending ping payload to {}", port.port());
        port.send(&PING_PAYLOAD, self.config.send_timeout, cancel)
            .await?;

        let reply = match port
            .receive(PING_RESPONSE_LEN, self.config.response_timeout, cancel)
            .await
        {
            Ok(reply) => reply,
            Err(TransportError::Timeout { .. }) => {
                debug!("No ping reply from {}", port.port());
                return Err(ValidationError::Timeout(self.config.response_timeout));
            }
            Err(e) => return Err(e.into()),
        };

        if reply.len() != PING_RESPONSE_LEN {
            debug!(
                "Short ping reply from {}: {} of {} bytes",
                port.port(),
                reply.len(),
                PING_RESPONSE_LEN
            );
            return Err(ValidationError::ShortRead {
                expected: PING_RESPONSE_LEN,
                received: reply.len(),
            });
        }

        debug!("Ping answered by {}", port.port());
        Ok(())
    }
}

/// Failure of a one-shot port probe
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Port could not be opened
    #[error(transparent)]
    Open(#[from] OpenError),

    /// Port opened but did not answer the ping
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Open a port with debug-target settings and ping it once
///
/// Convenience for manual probing; discovery goes through the connection
/// manager instead.
pub async fn ping_port(identity: &DeviceIdentity) -> Result<(), ProbeError> {
    let mut port = SerialPortOpener::new().open(identity, &LineSettings::debug_target())?;

    // Give the port a moment to settle
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancel = CancellationToken::new();
    match TargetProber::new().ping(&mut port, &cancel).await {
        Ok(()) => {
            info!("{} answered ping", identity);
            Ok(())
        }
        Err(e) => {
            warn!("{} did not answer ping: {}", identity, e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (TransportHandle, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(256);
        (
            TransportHandle::new("mem", ours, LineSettings::debug_target()),
            theirs,
        )
    }

    fn fast_prober() -> TargetProber {
        TargetProber::with_config(PingConfig {
            send_timeout: Duration::from_millis(200),
            response_timeout: Duration::from_millis(100),
        })
    }

    /// Read the 40 ping bytes then answer with `reply_len` bytes
    async fn answer(mut peer: tokio::io::DuplexStream, reply_len: usize) {
        let mut request = [0u8; 40];
        peer.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..32], &PING_HEADER);
        assert_eq!(&request[32..], &PING_PAYLOAD);
        peer.write_all(&vec![0xA5; reply_len]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn test_full_reply_validates() {
        let (mut port, peer) = pair();
        tokio::spawn(answer(peer, 32));

        let result = fast_prober().ping(&mut port, &CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_short_reply_fails() {
        let (mut port, peer) = pair();
        tokio::spawn(answer(peer, 20));

        let result = fast_prober().ping(&mut port, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(ValidationError::ShortRead {
                expected: 32,
                received: 20
            })
        ));
    }

    #[tokio::test]
    async fn test_silent_port_times_out() {
        let (mut port, peer) = pair();
        tokio::spawn(answer(peer, 0));

        let result = fast_prober().ping(&mut port, &CancellationToken::new()).await;
        assert!(matches!(result, Err(ValidationError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancelled_ping() {
        let (mut port, _peer) = pair();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fast_prober().ping(&mut port, &cancel).await;
        assert!(matches!(
            result,
            Err(ValidationError::Transport(TransportError::Cancelled))
        ));
    }

    #[test]
    fn test_default_timeouts() {
        let config = PingConfig::default();
        assert_eq!(config.send_timeout, Duration::from_secs(2));
        assert_eq!(config.response_timeout, Duration::from_secs(1));
    }
}
