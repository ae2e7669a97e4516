//! Transfer bridge process
//!
//! Runs as `moviestream bridge <magnet> --port <port> --out <dir>`: joins the
//! swarm, selects the payload file, serves it over HTTP on loopback and
//! reports on stdout. Diagnostics go to stderr through `tracing`.
//!
//! stdout is a line channel. Only one line has a contract, printed once the
//! server listens:
//!
//! ```text
//! Server running at: http://localhost:<port>/0
//! ```

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use url::{Host, Url};

use super::payload::PayloadSource;
use super::server::{RangeServer, PAYLOAD_RESOURCE};
use super::swarm::Swarm;

/// Prefix of the readiness line
pub const READINESS_PREFIX: &str = "Server running at:";

/// Interval between progress lines
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Arguments of one bridge run
#[derive(Debug, Clone)]
pub struct BridgeArgs {
    pub magnet: String,
    pub port: u16,
    pub out_dir: PathBuf,
}

/// Write one line to the output channel
pub fn emit(line: impl AsRef<str>) {
    println!("{}", line.as_ref());
}

/// The readiness line for a server on `port`
pub fn readiness_line(port: u16) -> String {
    format!(
        "{} http://localhost:{}/{}",
        READINESS_PREFIX, port, PAYLOAD_RESOURCE
    )
}

/// Extract the URL announced by a readiness line, if `line` is one.
pub fn parse_readiness(line: &str) -> Option<&str> {
    let idx = line.find(READINESS_PREFIX)?;
    line[idx + READINESS_PREFIX.len()..].split_whitespace().next()
}

/// Accept only plain-http URLs whose host is a loopback name or address.
pub fn ensure_loopback(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("{}: {}", raw, e))?;
    if url.scheme() != "http" {
        return Err(format!("{}: unexpected scheme '{}'", raw, url.scheme()));
    }
    let loopback = match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    };
    if !loopback {
        return Err(format!("{}: host is not a loopback address", raw));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(format!("{}: credentials are not allowed", raw));
    }
    Ok(url)
}

/// Run the bridge until SIGTERM/Ctrl-C.
///
/// Returns an error (non-zero exit) when the port is taken or the swarm
/// cannot be joined.
pub async fn run(args: BridgeArgs) -> Result<()> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    emit(format!("Joining swarm, downloading to {}", args.out_dir.display()));
    let swarm = tokio::select! {
        swarm = Swarm::join(&args.magnet, &args.out_dir) => swarm?,
        _ = &mut shutdown => {
            info!("termination requested while joining");
            return Ok(());
        }
    };

    let payload = tokio::select! {
        payload = swarm.wait_for_payload() => payload?,
        _ = &mut shutdown => {
            info!("termination requested while waiting for metadata");
            swarm.shutdown().await;
            return Ok(());
        }
    };
    emit(format!(
        "Selected {} ({} bytes)",
        payload.name(),
        payload.length()
    ));

    let progress_payload = payload.clone();
    let progress = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + PROGRESS_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, PROGRESS_INTERVAL);
        loop {
            ticker.tick().await;
            emit(progress_payload.progress_line());
            if progress_payload.is_complete() {
                emit("Download complete");
                break;
            }
        }
    });

    let outcome = serve_payload(payload, args.port, &mut shutdown, |line| emit(line)).await;
    if let Err(e) = &outcome {
        error!("{:#}", e);
    }

    progress.abort();
    swarm.shutdown().await;
    outcome
}

/// Serve `payload` on loopback `port` until `shutdown` resolves.
///
/// The readiness line goes to `out` exactly once, after the listener is
/// bound. A taken port fails with `Port <port> is already in use`.
pub async fn serve_payload<F>(
    payload: Arc<dyn PayloadSource>,
    port: u16,
    shutdown: F,
    mut out: impl FnMut(String),
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let listener = bind(port).await?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = RangeServer::new(payload);
    let mut server_task = tokio::spawn(server.serve_until(listener, async {
        let _ = stop_rx.await;
    }));
    out(readiness_line(port));

    let outcome = tokio::select! {
        _ = shutdown => {
            info!("termination requested, shutting down");
            Ok(())
        }
        res = &mut server_task => match res {
            Ok(Ok(())) => Err(anyhow!("Range server stopped unexpectedly")),
            Ok(Err(e)) => Err(anyhow!(e).context("Range server failed")),
            Err(e) => Err(anyhow!(e).context("Range server task panicked")),
        },
    };

    let _ = stop_tx.send(());
    outcome
}

async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow!("Port {} is already in use", port)
            } else {
                anyhow!(e)
            }
        })
        .with_context(|| format!("Failed to listen on 127.0.0.1:{}", port))
}

/// Resolves on SIGTERM or Ctrl-C
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
