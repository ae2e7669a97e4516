//! Stream session orchestrator
//!
//! A single actor task owns the current `StreamSession`: the bridge
//! process, the player process, the download directory and the subtitle file.
//! Commands from [`StreamOrchestrator`] handles and signals from the child
//! processes are handled one at a time, so a new start, a stop, a timeout and
//! a child exit never race each other.
//!
//! ```text
//! Idle -> Preparing -> AwaitingReadiness -> Streaming -> Stopping -> Idle
//!                 \             \
//!                  +-> Failed <--+--> Idle
//! ```
//!
//! Every path out of a session goes through one release routine.

use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::models::StreamRequest;

use super::bridge::{ensure_loopback, parse_readiness};
use super::player::{LocalPlayer, PlaybackHandle, PlayerError, RetryPolicy};
use super::subtitles::{SubtitleArtifact, SubtitleProvider, SubtitleQuery};
use super::torrent::{BridgeCommand, TransferEvent, TransferHandle};

/// Prefix of per-session download directories
pub const WORKSPACE_PREFIX: &str = "movie-stream-";

/// How long output written just before a bridge exit is still collected
const EXIT_DRAIN: Duration = Duration::from_millis(500);

const COMMAND_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 256;

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bridge: BridgeCommand,
    pub player: LocalPlayer,
    /// Ports the bridge may be asked to listen on
    pub port_range: Range<u16>,
    pub readiness_timeout: Duration,
    /// Wait between SIGTERM and SIGKILL during cleanup
    pub grace_period: Duration,
    /// Warm-up between readiness and the first player launch
    pub player_launch_delay: Duration,
    pub retry: RetryPolicy,
    /// Parent of download directories and subtitle files; the OS temp dir
    /// when unset
    pub temp_root: Option<PathBuf>,
    pub subtitle_language: String,
}

impl SessionConfig {
    pub fn new(bridge: BridgeCommand, player: LocalPlayer) -> Self {
        Self {
            bridge,
            player,
            port_range: 8000..9000,
            readiness_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(3),
            player_launch_delay: Duration::from_secs(3),
            retry: RetryPolicy::default(),
            temp_root: None,
            subtitle_language: "eng".to_string(),
        }
    }

    fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Lifecycle state of the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Preparing,
    AwaitingReadiness,
    Streaming,
    Stopping,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Preparing => "preparing",
            SessionState::AwaitingReadiness => "awaiting readiness",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Notifications for the UI boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A line of bridge output
    Progress(String),
    SubtitleStatus(String),
    StateChanged(SessionState),
    PlaybackStarted { pid: Option<u32>, attempt: u32 },
    /// Sent once per session after the last player exit
    PlaybackEnded,
    PlayerMissing { message: String, url: String },
    PlaybackFailed(String),
    /// The bridge died after it was ready
    TransferError(String),
}

/// Why a start did not produce a stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Invalid stream request: {0}")]
    InvalidRequest(String),
    #[error("Failed to create download directory: {0}")]
    Workspace(String),
    #[error("Failed to start transfer engine: {0}")]
    Spawn(String),
    #[error("Transfer engine exited before it was ready: {detail}")]
    BridgeExited { code: Option<i32>, detail: String },
    #[error("Timed out waiting for stream: peers not found in time")]
    ReadinessTimeout,
    #[error("Refusing untrusted stream URL: {0}")]
    UntrustedUrl(String),
    #[error("Transfer engine stopped: {0}")]
    TransferFailed(String),
    #[error("Superseded by a newer stream request")]
    Superseded,
    #[error("Stream stopped")]
    Stopped,
    #[error("Stream orchestrator is not running")]
    OrchestratorGone,
}

/// Successful start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStarted {
    pub url: String,
    pub subtitle_url: Option<String>,
    pub subtitle_path: Option<PathBuf>,
    pub download_dir: PathBuf,
    pub port: u16,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub success: bool,
}

type StartReply = oneshot::Sender<Result<StreamStarted, StreamError>>;

enum Command {
    Start {
        request: Box<StreamRequest>,
        reply: StartReply,
    },
    Stop {
        reply: oneshot::Sender<StopOutcome>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the orchestrator task.
///
/// Clones share the task. When the last handle is dropped the task releases
/// whatever the current session holds and exits.
#[derive(Clone)]
pub struct StreamOrchestrator {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Receiver<SessionState>,
}

impl StreamOrchestrator {
    /// Spawn the orchestrator task on the current runtime.
    pub fn spawn(config: SessionConfig, subtitles: Arc<dyn SubtitleProvider>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let actor = Orchestrator {
            config,
            subtitles,
            commands: commands_rx,
            events: events_tx.clone(),
            state: state_tx,
            session: None,
            next_id: 0,
            last_port: None,
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            events: events_tx,
            state: state_rx,
        }
    }

    /// Start streaming `request`, replacing any current session.
    ///
    /// Resolves once the player has been asked to open the stream (or was
    /// found missing), or with the reason the stream could not start.
    pub async fn start_stream(&self, request: StreamRequest) -> Result<StreamStarted, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start {
                request: Box::new(request),
                reply,
            })
            .await
            .map_err(|_| StreamError::OrchestratorGone)?;
        rx.await.map_err(|_| StreamError::OrchestratorGone)?
    }

    /// Stop the current session. Stopping while idle succeeds.
    pub async fn stop_stream(&self) -> StopOutcome {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).await.is_err() {
            return StopOutcome { success: false };
        }
        rx.await.unwrap_or(StopOutcome { success: false })
    }

    /// Release everything and end the task.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// Everything one stream attempt holds
struct StreamSession {
    id: u64,
    title: String,
    workspace: Option<TempDir>,
    transfer: Option<TransferHandle>,
    subtitle: Option<SubtitleArtifact>,
    playback: Option<PlaybackHandle>,
    /// Start request still waiting for its answer
    pending: Option<StartReply>,
    /// Set while awaiting readiness
    deadline: Option<Instant>,
    /// Next player (re)launch
    launch_at: Option<Instant>,
    retries_used: u32,
    /// A player was launched and its end has not been announced yet
    playback_active: bool,
    /// Last line the bridge printed
    last_output: Option<String>,
}

impl StreamSession {
    fn new(id: u64, title: String, pending: StartReply) -> Self {
        Self {
            id,
            title,
            workspace: None,
            transfer: None,
            subtitle: None,
            playback: None,
            pending: Some(pending),
            deadline: None,
            launch_at: None,
            retries_used: 0,
            playback_active: false,
            last_output: None,
        }
    }

    fn awaiting_readiness(&self) -> bool {
        self.deadline.is_some()
    }

    async fn next_signal(&mut self) -> Signal {
        let deadline = self.deadline;
        let launch_at = self.launch_at;
        tokio::select! {
            event = next_transfer_event(&mut self.transfer) => Signal::Transfer(event),
            _ = sleep_until_opt(deadline) => Signal::ReadinessTimeout,
            _ = sleep_until_opt(launch_at) => Signal::LaunchPlayer,
            status = wait_playback(&mut self.playback) => Signal::PlayerExited(status),
        }
    }
}

enum Signal {
    Transfer(TransferEvent),
    ReadinessTimeout,
    LaunchPlayer,
    PlayerExited(io::Result<ExitStatus>),
}

enum Step {
    Command(Option<Command>),
    Signal(Signal),
}

struct Orchestrator {
    config: SessionConfig,
    subtitles: Arc<dyn SubtitleProvider>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<SessionState>,
    session: Option<StreamSession>,
    next_id: u64,
    last_port: Option<u16>,
}

impl Orchestrator {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                cmd = self.commands.recv() => Step::Command(cmd),
                signal = next_signal(&mut self.session) => Step::Signal(signal),
            };

            match step {
                Step::Command(Some(Command::Start { request, reply })) => {
                    self.start(*request, reply).await;
                }
                Step::Command(Some(Command::Stop { reply })) => {
                    self.stop().await;
                    let _ = reply.send(StopOutcome { success: true });
                }
                Step::Command(Some(Command::Shutdown { reply })) => {
                    self.stop().await;
                    let _ = reply.send(());
                    break;
                }
                Step::Command(None) => {
                    self.stop().await;
                    break;
                }
                Step::Signal(signal) => self.handle_signal(signal).await,
            }
        }
        debug!("stream orchestrator exited");
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "session state");
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    async fn start(&mut self, request: StreamRequest, reply: StartReply) {
        if let Some(mut previous) = self.session.take() {
            info!(session = previous.id, "superseding current stream");
            self.set_state(SessionState::Stopping);
            let pending = previous.pending.take();
            self.release(previous).await;
            if let Some(pending) = pending {
                let _ = pending.send(Err(StreamError::Superseded));
            }
            self.set_state(SessionState::Idle);
        }

        self.next_id += 1;
        let mut session = StreamSession::new(self.next_id, request.title.clone(), reply);
        info!(session = session.id, title = %session.title, "starting stream");
        self.set_state(SessionState::Preparing);

        let magnet = match request.magnet() {
            Ok(magnet) => magnet,
            Err(reason) => {
                return self.fail(session, StreamError::InvalidRequest(reason)).await;
            }
        };

        let workspace = match tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(self.config.temp_root())
        {
            Ok(dir) => dir,
            Err(e) => return self.fail(session, StreamError::Workspace(e.to_string())).await,
        };
        let download_dir = workspace.path().to_path_buf();
        session.workspace = Some(workspace);

        if request.use_subtitles {
            session.subtitle = self.acquire_subtitles(&request).await;
        }

        let port = self.pick_port();
        match TransferHandle::spawn(&self.config.bridge, &magnet, port, &download_dir) {
            Ok(transfer) => session.transfer = Some(transfer),
            Err(e) => return self.fail(session, StreamError::Spawn(e.to_string())).await,
        }
        self.last_port = Some(port);

        info!(session = session.id, port, dir = %download_dir.display(), "awaiting readiness");
        session.deadline = Some(Instant::now() + self.config.readiness_timeout);
        self.session = Some(session);
        self.set_state(SessionState::AwaitingReadiness);
    }

    async fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        info!(session = session.id, "stopping stream");
        self.set_state(SessionState::Stopping);
        let pending = session.pending.take();
        self.release(session).await;
        if let Some(pending) = pending {
            let _ = pending.send(Err(StreamError::Stopped));
        }
        self.set_state(SessionState::Idle);
    }

    /// Release the session, then answer the pending start with `error`.
    async fn fail(&mut self, mut session: StreamSession, error: StreamError) {
        warn!(session = session.id, "stream failed: {}", error);
        self.set_state(SessionState::Failed);
        let pending = session.pending.take();
        self.release(session).await;
        if let Some(pending) = pending {
            let _ = pending.send(Err(error));
        }
        self.set_state(SessionState::Idle);
    }

    /// End a session whose playback or transfer is over.
    async fn finish(&mut self, mut session: StreamSession, error: Option<StreamError>) {
        self.set_state(SessionState::Stopping);
        let pending = session.pending.take();
        self.release(session).await;
        if let (Some(pending), Some(error)) = (pending, error) {
            let _ = pending.send(Err(error));
        }
        self.set_state(SessionState::Idle);
    }

    /// Release every resource the session holds.
    ///
    /// Each release is attempted even when an earlier one failed.
    async fn release(&mut self, mut session: StreamSession) {
        let grace = self.config.grace_period;

        if let Some(mut playback) = session.playback.take() {
            if let Err(e) = playback.stop(grace).await {
                warn!(session = session.id, "failed to stop player: {}", e);
            }
        }
        if session.playback_active {
            self.emit(SessionEvent::PlaybackEnded);
        }

        if let Some(mut transfer) = session.transfer.take() {
            if let Err(e) = transfer.terminate(grace).await {
                warn!(session = session.id, pid = ?transfer.pid(), "failed to stop transfer engine: {}", e);
            }
        }

        if let Some(workspace) = session.workspace.take() {
            let path = workspace.path().to_path_buf();
            if let Err(e) = workspace.close() {
                warn!(session = session.id, "failed to remove {}: {}", path.display(), e);
            }
        }

        if let Some(subtitle) = session.subtitle.take() {
            let path = subtitle.path().to_path_buf();
            if let Err(e) = subtitle.close() {
                warn!(session = session.id, "failed to remove {}: {}", path.display(), e);
            }
        }

        debug!(session = session.id, "session released");
    }

    async fn acquire_subtitles(&mut self, request: &StreamRequest) -> Option<SubtitleArtifact> {
        let query = subtitle_query(request, &self.config.subtitle_language);
        let events = self.events.clone();
        let status = move |message: &str| {
            let _ = events.send(SessionEvent::SubtitleStatus(message.to_string()));
        };

        status("Searching for subtitles...");
        match self.subtitles.fetch(&query, &status).await {
            Ok(Some(webvtt)) => match SubtitleArtifact::write(&self.config.temp_root(), &webvtt) {
                Ok(artifact) => {
                    status("Subtitle downloaded");
                    Some(artifact)
                }
                Err(e) => {
                    warn!("failed to store subtitle: {}", e);
                    status("Subtitle download failed");
                    None
                }
            },
            Ok(None) => {
                status("No subtitles found");
                None
            }
            Err(e) => {
                warn!("subtitle lookup failed: {:#}", e);
                status("Subtitle download failed");
                None
            }
        }
    }

    fn pick_port(&self) -> u16 {
        let range = self.config.port_range.clone();
        if range.len() <= 1 {
            return range.start;
        }
        let mut rng = rand::rng();
        loop {
            let port = rng.random_range(range.clone());
            if Some(port) != self.last_port {
                return port;
            }
        }
    }

    async fn handle_signal(&mut self, signal: Signal) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        match signal {
            Signal::Transfer(TransferEvent::Line(line)) => {
                let readiness = if session.awaiting_readiness() {
                    parse_readiness(&line).map(ensure_loopback)
                } else {
                    None
                };
                session.last_output = Some(line.clone());
                self.emit(SessionEvent::Progress(line));

                match readiness {
                    Some(Ok(url)) => {
                        info!(session = session.id, %url, "transfer engine ready");
                        session.deadline = None;
                        session.launch_at = Some(Instant::now() + self.config.player_launch_delay);
                        if let Some(transfer) = session.transfer.as_mut() {
                            transfer.set_stream_url(url);
                        }
                        self.session = Some(session);
                        self.set_state(SessionState::Streaming);
                    }
                    Some(Err(reason)) => {
                        self.fail(session, StreamError::UntrustedUrl(reason)).await;
                    }
                    None => self.session = Some(session),
                }
            }

            Signal::Transfer(TransferEvent::Exited(status)) => {
                let mut last_line = session.last_output.take();
                if let Some(transfer) = session.transfer.as_mut() {
                    for line in transfer.drain_lines(EXIT_DRAIN).await {
                        last_line = Some(line.clone());
                        self.emit(SessionEvent::Progress(line));
                    }
                }
                let (code, detail) = describe_exit(&status, last_line);

                if session.awaiting_readiness() {
                    self.fail(session, StreamError::BridgeExited { code, detail }).await;
                } else {
                    warn!(session = session.id, "transfer engine stopped: {}", detail);
                    self.emit(SessionEvent::TransferError(detail.clone()));
                    self.finish(session, Some(StreamError::TransferFailed(detail))).await;
                }
            }

            Signal::ReadinessTimeout => {
                self.fail(session, StreamError::ReadinessTimeout).await;
            }

            Signal::LaunchPlayer => {
                session.launch_at = None;
                let retrying = session.retries_used > 0;
                if self.launch_player(&mut session) || !retrying {
                    self.session = Some(session);
                } else {
                    self.finish(session, None).await;
                }
            }

            Signal::PlayerExited(status) => {
                session.playback = None;
                let clean = matches!(&status, Ok(s) if s.success());
                info!(session = session.id, ?status, "player exited");

                match self.config.retry.next_attempt(clean, session.retries_used) {
                    Some(backoff) => {
                        session.retries_used += 1;
                        self.emit(SessionEvent::Progress(format!(
                            "Player exited unexpectedly, retrying ({}/{})",
                            session.retries_used, self.config.retry.max_retries
                        )));
                        session.launch_at = Some(Instant::now() + backoff);
                        self.session = Some(session);
                    }
                    None => self.finish(session, None).await,
                }
            }
        }
    }

    /// Launch the player on the ready stream and answer a pending start.
    ///
    /// Returns whether a player is now running.
    fn launch_player(&mut self, session: &mut StreamSession) -> bool {
        let Some(transfer) = session.transfer.as_ref() else {
            return false;
        };
        let Some(url) = transfer.stream_url().cloned() else {
            return false;
        };
        let port = transfer.port();
        let download_dir = transfer.download_dir().to_path_buf();

        let subtitle_path = session.subtitle.as_ref().map(|s| s.path().to_path_buf());
        let launched = self
            .config
            .player
            .launch(url.as_str(), &session.title, subtitle_path.as_deref());

        let running = match launched {
            Ok(handle) => {
                self.emit(SessionEvent::PlaybackStarted {
                    pid: handle.pid(),
                    attempt: session.retries_used + 1,
                });
                session.playback = Some(handle);
                session.playback_active = true;
                true
            }
            Err(e @ PlayerError::NotFound { .. }) => {
                warn!(session = session.id, "{}", e);
                self.emit(SessionEvent::PlayerMissing {
                    url: e.install_url().unwrap_or_default().to_string(),
                    message: e.to_string(),
                });
                false
            }
            Err(e) => {
                warn!(session = session.id, "{}", e);
                self.emit(SessionEvent::PlaybackFailed(e.to_string()));
                false
            }
        };

        if let Some(pending) = session.pending.take() {
            let _ = pending.send(Ok(StreamStarted {
                url: url.to_string(),
                subtitle_url: session.subtitle.as_ref().map(|s| s.url().to_string()),
                subtitle_path,
                download_dir,
                port,
            }));
        }
        running
    }
}

fn subtitle_query(request: &StreamRequest, language: &str) -> SubtitleQuery {
    match &request.metadata {
        Some(meta) => SubtitleQuery {
            title: meta.title.clone(),
            year: meta.year,
            imdb_id: meta.imdb_code.clone(),
            language: language.to_string(),
        },
        None => SubtitleQuery::new(request.title.clone(), language),
    }
}

fn describe_exit(status: &io::Result<ExitStatus>, last_line: Option<String>) -> (Option<i32>, String) {
    let code = status.as_ref().ok().and_then(|s| s.code());
    let status_text = match status {
        Ok(s) => s.to_string(),
        Err(e) => format!("unknown exit status ({})", e),
    };
    let detail = match last_line {
        Some(line) => format!("{} ({})", line, status_text),
        None => status_text,
    };
    (code, detail)
}

async fn next_signal(session: &mut Option<StreamSession>) -> Signal {
    match session {
        Some(session) => session.next_signal().await,
        None => std::future::pending().await,
    }
}

async fn next_transfer_event(transfer: &mut Option<TransferHandle>) -> TransferEvent {
    match transfer {
        Some(transfer) => transfer.next_event().await,
        None => std::future::pending().await,
    }
}

async fn wait_playback(playback: &mut Option<PlaybackHandle>) -> io::Result<ExitStatus> {
    match playback {
        Some(playback) => playback.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Whether `path` looks like a session download directory
pub fn is_workspace(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(WORKSPACE_PREFIX))
        .unwrap_or(false)
}
