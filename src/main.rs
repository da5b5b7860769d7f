#![warn(clippy::all)]

mod blocklist;
mod error;
mod fragment;
mod proxy;
mod request;
mod stats;

use crate::blocklist::Blocklist;
use crate::proxy::{handle_connection, ProxyConfig};
use crate::stats::{ActiveGuard, Stats};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace};

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Newline-separated domain substrings that trigger fragmentation
    #[arg(long, default_value = "blacklist.txt")]
    blacklist: PathBuf,

    #[arg(long, default_value_t = 10)]
    timeout_connect: u64,

    /// Upper bound on a tunnel's relay phase, active or not (0 = none)
    #[arg(long, default_value_t = 0)]
    timeout_lifetime: u64,

    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn log_level(&self) -> &str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }

    fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let ip = host
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid listen address: {}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level())),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    // Loaded before the first accept and never written again.
    let blocklist = Arc::new(Blocklist::load_or_empty(&args.blacklist));
    let stats = Arc::new(Stats::new());

    if args.stats_interval > 0 {
        let stats_clone = stats.clone();
        let interval = args.stats_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval));
            loop {
                timer.tick().await;
                stats_clone.print();
            }
        });
    }

    let addr = args.bind_addr()?;
    let listener = bind_listener(addr)?;

    info!("🚀 Proxy listening on {}", addr);
    if blocklist.is_empty() {
        info!("🧱 Blacklist empty, tunnels pass through unmodified");
    } else {
        info!("🧱 Fragmenting for {} blacklist entries", blocklist.len());
    }

    let config = ProxyConfig {
        blocklist,
        stats,
        connect_timeout: secs(args.timeout_connect),
        lifetime_timeout: secs(args.timeout_lifetime),
    };

    serve(listener, config).await
}

fn bind_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket.listen(1024)?;

    Ok(TcpListener::from_std(socket.into())?)
}

// ============================================================================
// ACCEPT LOOP
// ============================================================================

async fn serve(listener: TcpListener, config: ProxyConfig) -> anyhow::Result<()> {
    loop {
        let (client_stream, client_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let config = config.clone();
        tokio::spawn(async move {
            handle_client(client_stream, client_addr, &config).await;
        });
    }
}

async fn handle_client(client: TcpStream, client_addr: SocketAddr, config: &ProxyConfig) {
    let _active = ActiveGuard::enter(&config.stats);
    let _ = client.set_nodelay(true);

    if let Err(e) = handle_connection(client, config).await {
        if e.is_expected() {
            trace!("Connection from {} closed: {}", client_addr, e);
        } else {
            debug!("Connection error from {}: {}", client_addr, e);
            config.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["sni-split-proxy"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_default_args() {
        let args = args(&[]);
        assert_eq!(args.bind_addr().unwrap(), "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(args.blacklist, PathBuf::from("blacklist.txt"));
        assert_eq!(args.log_level(), "info");
        assert_eq!(secs(args.timeout_connect), Some(Duration::from_secs(10)));
        assert_eq!(secs(args.timeout_lifetime), None);
    }

    #[test]
    fn test_lifetime_timeout_flag() {
        let args = args(&["--timeout-lifetime", "30"]);
        assert_eq!(secs(args.timeout_lifetime), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_ipv6_bind_addr() {
        let args = args(&["--host", "[::1]", "--port", "9000"]);
        assert_eq!(args.bind_addr().unwrap(), "[::1]:9000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_log_level_flags() {
        assert_eq!(args(&["-q", "-v"]).log_level(), "error");
        assert_eq!(args(&["-v"]).log_level(), "debug");
        assert_eq!(args(&["--log-level", "trace"]).log_level(), "trace");
    }

    #[tokio::test]
    async fn test_listener_serves_connect() {
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream_listener.local_addr().unwrap().port();

        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let config = ProxyConfig {
            blocklist: Arc::new(Blocklist::default()),
            stats: Arc::new(Stats::new()),
            connect_timeout: Some(Duration::from_secs(5)),
            lifetime_timeout: None,
        };
        let stats = config.stats.clone();
        tokio::spawn(serve(listener, config));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", upstream_port).as_bytes())
            .await
            .unwrap();

        let (mut upstream, _) = upstream_listener.accept().await.unwrap();

        let mut response = [0u8; 39];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

        client.write_all(&[0x16, 0x03, 0x01, 0x00, 0x02, 0xab, 0xcd]).await.unwrap();
        let mut hello = [0u8; 7];
        upstream.read_exact(&mut hello).await.unwrap();
        assert_eq!(hello, [0x16, 0x03, 0x01, 0x00, 0x02, 0xab, 0xcd]);

        assert_eq!(stats.total.load(Ordering::Relaxed), 1);
    }
}
