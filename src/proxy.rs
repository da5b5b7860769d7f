use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::blocklist::Blocklist;
use crate::error::{is_expected_io, ProxyError};
use crate::fragment::{forward_head, HeadOutcome, TLS_HANDSHAKE_TYPE};
use crate::request::ProxyRequest;
use crate::stats::Stats;

// ============================================================================
// CONSTANTS
// ============================================================================

const MAX_REQUEST_LINE: u64 = 8 * 1024;
const MAX_CONNECT_HEADERS: u64 = 16 * 1024;

const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

// ============================================================================
// PROXY CONFIGURATION
// ============================================================================

#[derive(Clone)]
pub struct ProxyConfig {
    pub blocklist: Arc<Blocklist>,
    pub stats: Arc<Stats>,
    pub connect_timeout: Option<Duration>,
    pub lifetime_timeout: Option<Duration>,
}

// ============================================================================
// CONNECTION HANDLER
// ============================================================================

/// Runs one proxied connection to completion.
///
/// Every error path returns without writing anything to the client; both
/// streams are dropped (and so closed) when this returns.
pub async fn handle_connection<C>(client: C, config: &ProxyConfig) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    // One buffer for request line, TLS head and relay.
    let mut client = BufReader::new(client);

    let line = read_request_line(&mut client).await?;
    let request = ProxyRequest::parse(&String::from_utf8_lossy(&line))?;

    trace!("{} {}:{}", request.method, request.host, request.port);

    if request.is_connect() {
        skip_connect_headers(&mut client).await?;
    }

    let mut upstream = connect_upstream(&request.upstream_addr(), config.connect_timeout).await?;

    if request.is_connect() {
        client
            .write_all(RESPONSE_200_CONNECT)
            .await
            .map_err(ProxyError::WriteFailure)?;
        client.flush().await.map_err(ProxyError::WriteFailure)?;

        match forward_head(&mut client, &mut upstream, &config.blocklist).await? {
            HeadOutcome::Fragmented { fragments, bytes } => {
                config.stats.fragmented.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "✂️ Fragmented {}: {} bytes in {} records",
                    request.host, bytes, fragments
                );
            }
            HeadOutcome::Passthrough { bytes } => {
                config.stats.passthrough.fetch_add(1, Ordering::Relaxed);
                trace!("Passthrough {}: {} bytes", request.host, bytes);
            }
        }
    } else {
        config.stats.plain_http.fetch_add(1, Ordering::Relaxed);
        forward_request_line(&mut client, &mut upstream, &line).await?;
    }

    relay(&mut client, &mut upstream, config).await
}

/// Reads through the first `\n`. EOF before it, or an oversized line, is a
/// malformed request.
async fn read_request_line<R>(client: &mut R) -> Result<Vec<u8>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    (&mut *client)
        .take(MAX_REQUEST_LINE)
        .read_until(b'\n', &mut line)
        .await?;

    if !line.ends_with(b"\n") {
        return Err(ProxyError::MalformedRequest(
            String::from_utf8_lossy(&line).into_owned(),
        ));
    }

    Ok(line)
}

/// Drops a CONNECT header block the client has already started sending.
///
/// Only waits for more bytes once header bytes are buffered: a client that
/// sent just the request line gets its ack at once, and a buffer starting
/// with a TLS record is left for the head read.
async fn skip_connect_headers<C>(client: &mut BufReader<C>) -> Result<(), ProxyError>
where
    C: AsyncRead + Unpin,
{
    match client.buffer().first().copied() {
        None => Ok(()),
        Some(TLS_HANDSHAKE_TYPE) => Ok(()),
        Some(_) => skip_headers(client).await,
    }
}

/// Reads header lines up to and including the blank line.
async fn skip_headers<R>(client: &mut R) -> Result<(), ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = (&mut *client).take(MAX_CONNECT_HEADERS);
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = headers.read_until(b'\n', &mut line).await?;

        if n == 0 || !line.ends_with(b"\n") {
            return Err(ProxyError::MalformedRequest(
                "unterminated CONNECT header block".to_string(),
            ));
        }

        if line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
    }
}

/// Plain HTTP: the request line, then whatever the client already sent,
/// both untouched.
async fn forward_request_line<C, U>(
    client: &mut BufReader<C>,
    upstream: &mut U,
    line: &[u8],
) -> Result<(), ProxyError>
where
    C: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    upstream
        .write_all(line)
        .await
        .map_err(ProxyError::WriteFailure)?;

    let buffered = client.buffer().len();
    if buffered > 0 {
        upstream
            .write_all(client.buffer())
            .await
            .map_err(ProxyError::WriteFailure)?;
        client.consume(buffered);
    }

    upstream.flush().await.map_err(ProxyError::WriteFailure)?;
    Ok(())
}

// ============================================================================
// UPSTREAM CONNECTOR
// ============================================================================

pub async fn connect_upstream(
    addr: &str,
    connect_timeout: Option<Duration>,
) -> Result<TcpStream, ProxyError> {
    let connect_future = TcpStream::connect(addr);

    let result = match connect_timeout {
        Some(timeout_duration) => match timeout(timeout_duration, connect_future).await {
            Ok(result) => result,
            Err(_) => return Err(ProxyError::ConnectTimeout(addr.to_string())),
        },
        None => connect_future.await,
    };

    let server = result.map_err(|source| ProxyError::ConnectFailure {
        addr: addr.to_string(),
        source,
    })?;

    let _ = server.set_nodelay(true);

    Ok(server)
}

// ============================================================================
// RELAY
// ============================================================================

async fn relay<C, U>(client: &mut C, upstream: &mut U, config: &ProxyConfig) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let copy_result = match config.lifetime_timeout {
        Some(timeout_duration) => {
            timeout(
                timeout_duration,
                tokio::io::copy_bidirectional(client, upstream),
            )
            .await
        }
        None => Ok(tokio::io::copy_bidirectional(client, upstream).await),
    };

    match copy_result {
        Ok(Ok((sent, received))) => {
            config.stats.record_relay(sent, received);
            trace!("Relay closed: {}b up, {}b down", sent, received);
            Ok(())
        }
        Ok(Err(e)) if is_expected_io(&e) => {
            trace!("Relay closed: {}", e);
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            debug!("Tunnel lifetime expired");
            Ok(())
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
