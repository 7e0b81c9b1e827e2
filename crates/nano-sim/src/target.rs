//! Virtual debug target task
//!
//! Owns the far end of an in-memory stream and answers ping frames the way a
//! target would. How it answers is controlled by `TargetBehavior` so tests can
//! produce live targets, truncated replies and silent ports.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nano_protocol::ping::{frame_crc, payload_len, SIGNATURE};
use nano_protocol::PING_RESPONSE_LEN;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Largest payload the virtual target accepts
const MAX_PAYLOAD: usize = 1024;

/// Flag marking a frame as a reply
const REPLY_FLAG: u32 = 0x0001;

/// How a virtual target answers pings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetBehavior {
    /// Full 32-byte reply
    #[default]
    Responsive,
    /// Only the first `n` bytes of the reply
    ShortReply(usize),
    /// Reads pings but never answers
    Silent,
}

/// Build the reply header for a ping request
///
/// Echoes the request with the reply sequence and flag set, no payload, and
/// a recomputed header CRC.
pub fn reply_frame(request: &[u8; 32]) -> [u8; PING_RESPONSE_LEN] {
    let mut reply = *request;
    reply[22..24].copy_from_slice(&request[20..22]);
    reply[24..28].copy_from_slice(&REPLY_FLAG.to_le_bytes());
    reply[28..32].fill(0);
    // Empty payload CRC, then the header CRC over a zeroed CRC field
    reply[12..16].fill(0);
    reply[8..12].fill(0);
    let crc = frame_crc(&reply, 0);
    reply[8..12].copy_from_slice(&crc.to_le_bytes());
    reply
}

/// Run the virtual target until the host closes the stream or `cancel` fires
///
/// Every complete ping bumps `pings`, whatever the behavior.
pub async fn run_virtual_target<S>(
    mut stream: S,
    behavior: TargetBehavior,
    pings: Arc<AtomicUsize>,
    cancel: CancellationToken,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Virtual target running ({:?})", behavior);
    loop {
        let mut header = [0u8; 32];
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Virtual target unplugged");
                return Ok(());
            }
            result = stream.read_exact(&mut header) => match result {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("Virtual target stream closed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        }

        if &header[..8] != SIGNATURE {
            warn!("Virtual target ignoring frame without signature: {:02X?}", &header[..8]);
            continue;
        }

        let len = payload_len(&header) as usize;
        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload of {} bytes", len),
            ));
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        pings.fetch_add(1, Ordering::SeqCst);
        trace!("Virtual target got ping with {} byte payload", len);

        let reply = reply_frame(&header);
        match behavior {
            TargetBehavior::Responsive => stream.write_all(&reply).await?,
            TargetBehavior::ShortReply(n) => {
                stream.write_all(&reply[..n.min(reply.len())]).await?
            }
            TargetBehavior::Silent => continue,
        }
        stream.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nano_protocol::{PING_HEADER, PING_PAYLOAD};
    use std::time::Duration;

    async fn exchange(behavior: TargetBehavior) -> (Vec<u8>, usize) {
        let (mut host, target) = tokio::io::duplex(256);
        let pings = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        tokio::spawn(run_virtual_target(target, behavior, pings.clone(), cancel.clone()));

        host.write_all(&PING_HEADER).await.unwrap();
        host.write_all(&PING_PAYLOAD).await.unwrap();

        let mut reply = Vec::new();
        let mut buf = [0u8; 64];
        while let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(100), host.read(&mut buf)).await
        {
            if n == 0 {
                break;
            }
            reply.extend_from_slice(&buf[..n]);
        }
        cancel.cancel();
        (reply, pings.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_responsive_target_replies_full_frame() {
        let (reply, pings) = exchange(TargetBehavior::Responsive).await;
        assert_eq!(reply.len(), PING_RESPONSE_LEN);
        assert_eq!(&reply[..8], SIGNATURE);
        assert_eq!(pings, 1);
    }

    #[tokio::test]
    async fn test_short_reply() {
        let (reply, _) = exchange(TargetBehavior::ShortReply(20)).await;
        assert_eq!(reply.len(), 20);
    }

    #[tokio::test]
    async fn test_silent_target_counts_ping() {
        let (reply, pings) = exchange(TargetBehavior::Silent).await;
        assert!(reply.is_empty());
        assert_eq!(pings, 1);
    }

    #[test]
    fn test_reply_frame_fields() {
        let reply = reply_frame(&PING_HEADER);
        assert_eq!(&reply[22..24], &[0x01, 0x00]);
        assert_eq!(&reply[24..28], &REPLY_FLAG.to_le_bytes());
        assert_eq!(payload_len(&reply), 0);

        let mut zeroed = reply;
        zeroed[8..12].fill(0);
        assert_eq!(&reply[8..12], &frame_crc(&zeroed, 0).to_le_bytes());
    }

    #[test]
    fn test_behavior_serde_names() {
        let json = serde_json::to_string(&TargetBehavior::ShortReply(20)).unwrap();
        assert_eq!(json, r#"{"short_reply":20}"#);
        let silent: TargetBehavior = serde_json::from_str(r#""silent""#).unwrap();
        assert_eq!(silent, TargetBehavior::Silent);
    }
}
