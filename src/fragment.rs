use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::blocklist::Blocklist;
use crate::error::ProxyError;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const HEAD_LEN: usize = 5;
pub const MAX_BODY_LEN: usize = 2048;
pub const FRAGMENT_HEADER_LEN: usize = 5;

pub const TLS_HANDSHAKE_TYPE: u8 = 0x16;
const TLS_MAJOR_VERSION: u8 = 0x03;

// ============================================================================
// FRAGMENT
// ============================================================================

/// One synthetic TLS record wrapped around a slice of the original payload.
/// The minor version byte is random per record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub record_type: u8,
    pub version: [u8; 2],
    pub payload: &'a [u8],
}

impl<'a> Fragment<'a> {
    fn new<R: Rng + ?Sized>(payload: &'a [u8], rng: &mut R) -> Self {
        Self {
            record_type: TLS_HANDSHAKE_TYPE,
            version: [TLS_MAJOR_VERSION, rng.random::<u8>()],
            payload,
        }
    }

    /// Payloads never exceed [`MAX_BODY_LEN`], so the length always fits.
    pub fn length(&self) -> u16 {
        self.payload.len() as u16
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.payload.len());
        frame.push(self.record_type);
        frame.extend_from_slice(&self.version);
        frame.extend_from_slice(&self.length().to_be_bytes());
        frame.extend_from_slice(self.payload);
        frame
    }
}

/// Cuts `body` into records: first up to and including the first zero byte
/// (the likely end of the hostname), then random-sized chunks of what is left.
pub fn split_body<'a, R: Rng + ?Sized>(body: &'a [u8], rng: &mut R) -> Vec<Fragment<'a>> {
    let mut fragments = Vec::new();
    let mut rest = body;

    if let Some(host_end) = rest.iter().position(|&b| b == 0x00) {
        let (first, tail) = rest.split_at(host_end + 1);
        fragments.push(Fragment::new(first, &mut *rng));
        rest = tail;
    }

    while !rest.is_empty() {
        let chunk_len = rng.random_range(1..=rest.len());
        let (chunk, tail) = rest.split_at(chunk_len);
        fragments.push(Fragment::new(chunk, &mut *rng));
        rest = tail;
    }

    fragments
}

// ============================================================================
// HEAD HANDLING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadOutcome {
    /// Forwarded as one unmodified write.
    Passthrough { bytes: usize },
    /// Re-framed into this many records.
    Fragmented { fragments: usize, bytes: usize },
}

/// Reads the first record header and up to [`MAX_BODY_LEN`] bytes after it
/// from `client`, then forwards them to `upstream`, split into synthetic
/// records if the blocklist matches.
///
/// When fragmenting, the client's own header is replaced by the per-fragment
/// headers; every body byte is sent exactly once and in order.
pub async fn forward_head<C, U>(
    client: &mut C,
    upstream: &mut U,
    blocklist: &Blocklist,
) -> Result<HeadOutcome, ProxyError>
where
    C: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    let mut head = [0u8; HEAD_LEN];
    client
        .read_exact(&mut head)
        .await
        .map_err(ProxyError::ShortHead)?;

    let mut body = vec![0u8; MAX_BODY_LEN];
    let n = client.read(&mut body).await.map_err(ProxyError::ShortRead)?;
    body.truncate(n);

    if !blocklist.matches(&body) {
        let mut packet = Vec::with_capacity(HEAD_LEN + body.len());
        packet.extend_from_slice(&head);
        packet.extend_from_slice(&body);

        upstream
            .write_all(&packet)
            .await
            .map_err(ProxyError::WriteFailure)?;

        return Ok(HeadOutcome::Passthrough {
            bytes: packet.len(),
        });
    }

    let frames: Vec<Vec<u8>> = {
        let mut rng = rand::rng();
        split_body(&body, &mut rng)
            .iter()
            .map(Fragment::encode)
            .collect()
    };

    trace!("Fragmenting {} byte payload into {} records", body.len(), frames.len());

    for frame in &frames {
        upstream
            .write_all(frame)
            .await
            .map_err(ProxyError::WriteFailure)?;
    }
    upstream.flush().await.map_err(ProxyError::WriteFailure)?;

    Ok(HeadOutcome::Fragmented {
        fragments: frames.len(),
        bytes: body.len(),
    })
}

// ============================================================================
// TESTS
// ============================================================================
