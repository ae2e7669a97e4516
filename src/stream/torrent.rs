//! Torrent bridge subprocess
//!
//! Spawns the bridge process for one transfer, merges its stdout and stderr
//! into a single line channel and terminates it on request.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use super::process::{supervised_command, terminate};

/// Buffered lines before the reader tasks wait on the orchestrator
const LINE_BUFFER: usize = 256;

/// How to invoke the bridge
///
/// The transfer arguments are appended as
/// `<magnet> --port <port> --out <dir>`, which `webtorrent-cli` also accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCommand {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl BridgeCommand {
    /// This executable's hidden `bridge` subcommand
    pub fn builtin() -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            leading_args: vec!["bridge".to_string()],
        })
    }

    /// An external transfer engine such as `webtorrent`
    pub fn external(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// A program with fixed leading arguments (e.g. `sh -c <script>`)
    pub fn with_args(program: impl Into<PathBuf>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }
}

/// Something the bridge did
#[derive(Debug)]
pub enum TransferEvent {
    /// One line of stdout or stderr
    Line(String),
    /// The process exited
    Exited(io::Result<ExitStatus>),
}

/// One running bridge process and the transfer it owns
pub struct TransferHandle {
    port: u16,
    download_dir: PathBuf,
    child: Child,
    pid: Option<u32>,
    lines: Option<mpsc::Receiver<String>>,
    stream_url: Option<Url>,
    exit_status: Option<ExitStatus>,
}

impl TransferHandle {
    /// Start the bridge for `magnet`, serving on `port`, downloading into
    /// `download_dir`.
    pub fn spawn(
        command: &BridgeCommand,
        magnet: &str,
        port: u16,
        download_dir: &Path,
    ) -> io::Result<Self> {
        let mut child = supervised_command(&command.program)
            .args(&command.leading_args)
            .arg(magnet)
            .arg("--port")
            .arg(port.to_string())
            .arg("--out")
            .arg(download_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id();
        info!(?pid, port, program = %command.program.display(), "bridge started");

        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        Ok(Self {
            port,
            download_dir: download_dir.to_path_buf(),
            child,
            pid,
            lines: Some(rx),
            stream_url: None,
            exit_status: None,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// URL of the payload once the bridge reported readiness
    pub fn stream_url(&self) -> Option<&Url> {
        self.stream_url.as_ref()
    }

    pub fn set_stream_url(&mut self, url: Url) {
        self.stream_url = Some(url);
    }

    /// Next output line, or `None` once both pipes are closed.
    pub async fn next_line(&mut self) -> Option<String> {
        if let Some(rx) = self.lines.as_mut() {
            if let Some(line) = rx.recv().await {
                return Some(line);
            }
            self.lines = None;
        }
        None
    }

    /// Next line or exit, lines first.
    ///
    /// Once the exit has been reported this only yields remaining lines.
    pub async fn next_event(&mut self) -> TransferEvent {
        loop {
            let exited = self.exit_status.is_some();
            let event = tokio::select! {
                biased;
                line = recv_line(&mut self.lines) => match line {
                    Some(line) => Some(TransferEvent::Line(line)),
                    None => None,
                },
                status = self.child.wait(), if !exited => Some(TransferEvent::Exited(status)),
            };
            match event {
                Some(TransferEvent::Exited(Ok(status))) => {
                    self.exit_status = Some(status);
                    return TransferEvent::Exited(Ok(status));
                }
                Some(event) => return event,
                None => {
                    // Both pipes closed; only the exit is left to observe.
                    self.lines = None;
                    if exited {
                        return std::future::pending().await;
                    }
                }
            }
        }
    }

    /// Collect whatever the bridge still writes, up to `within`.
    ///
    /// Used after an exit so lines written just before it are not lost.
    pub async fn drain_lines(&mut self, within: Duration) -> Vec<String> {
        let mut drained = Vec::new();
        let _ = tokio::time::timeout(within, async {
            while let Some(line) = self.next_line().await {
                drained.push(line);
            }
        })
        .await;
        drained
    }

    /// SIGTERM, wait up to `grace`, then kill.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        if self.exit_status.is_some() {
            return Ok(());
        }
        let status = terminate(&mut self.child, grace).await?;
        debug!(pid = ?self.pid, ?status, "bridge terminated");
        self.exit_status = status;
        Ok(())
    }
}

async fn recv_line(lines: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match lines {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Forward non-empty lines until EOF.
///
/// Bytes that are not UTF-8 are replaced rather than ending the stream, and
/// the pipe keeps draining after the receiver is gone so the bridge never
/// blocks on a full pipe.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut open = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "bridge output closed");
                break;
            }
        }
        if !open {
            continue;
        }
        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        if tx.send(line).await.is_err() {
            open = false;
        }
    }
}
