//! Stream Orchestrator Tests
//!
//! Drives the orchestrator end to end with shell scripts standing in for the
//! transfer bridge and the player. The bridge scripts see the same arguments
//! the real one does: `$1` magnet, `$3` port, `$5` download directory.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use moviestream::models::StreamRequest;
use moviestream::stream::session::{is_workspace, WORKSPACE_PREFIX};
use moviestream::stream::{
    BridgeCommand, LocalPlayer, RetryPolicy, SessionConfig, SessionEvent, SessionState,
    StreamError, StreamOrchestrator, SubtitleProvider, SubtitleQuery,
};
use tempfile::TempDir;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

const HASH: &str = "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c";
const LONG_PLAYER: &str = "exec sleep 30";

// =============================================================================
// Fixtures
// =============================================================================

struct NoSubtitles;

#[async_trait]
impl SubtitleProvider for NoSubtitles {
    async fn fetch(
        &self,
        _query: &SubtitleQuery,
        _status: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

struct FixedSubtitles;

#[async_trait]
impl SubtitleProvider for FixedSubtitles {
    async fn fetch(
        &self,
        _query: &SubtitleQuery,
        status: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<Option<String>> {
        status("Downloading subtitle...");
        Ok(Some("WEBVTT\n\n1\n00:00:01.000 --> 00:00:02.000\nHi\n".to_string()))
    }
}

fn sh_bridge(script: &str) -> BridgeCommand {
    BridgeCommand::with_args(
        "sh",
        vec!["-c".to_string(), script.to_string(), "bridge".to_string()],
    )
}

fn sh_player(script: &str) -> LocalPlayer {
    LocalPlayer::mpv().with_program("sh").with_leading_args(vec![
        "-c".to_string(),
        script.to_string(),
        "player".to_string(),
    ])
}

/// Prints its pid, announces readiness, then idles
fn ready_bridge(pid_file: &Path) -> String {
    format!(
        "echo $$ > '{}'; echo 'Downloading metadata'; echo \"Server running at: http://localhost:$3/0\"; exec sleep 30",
        pid_file.display()
    )
}

fn silent_bridge(pid_file: &Path) -> String {
    format!("echo $$ > '{}'; exec sleep 30", pid_file.display())
}

struct Harness {
    root: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    fn config(&self, bridge: BridgeCommand, player: LocalPlayer) -> SessionConfig {
        let mut config = SessionConfig::new(bridge, player);
        config.port_range = 20000..30000;
        config.readiness_timeout = Duration::from_secs(5);
        config.grace_period = Duration::from_secs(1);
        config.player_launch_delay = Duration::from_millis(50);
        config.retry = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(50),
        };
        config.temp_root = Some(self.root.path().to_path_buf());
        config
    }

    fn spawn(&self, config: SessionConfig) -> StreamOrchestrator {
        StreamOrchestrator::spawn(config, Arc::new(NoSubtitles))
    }

    fn workspaces(&self) -> usize {
        std::fs::read_dir(self.root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX))
            .count()
    }
}

fn request() -> StreamRequest {
    StreamRequest::new(HASH, "Big Buck Bunny")
}

fn read_pid(path: &Path) -> i32 {
    std::fs::read_to_string(path)
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

fn alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

async fn wait_for<F>(events: &mut Receiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collect events until the session settles back to idle
async fn collect_until_idle(events: &mut Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = event == SessionEvent::StateChanged(SessionState::Idle);
                    seen.push(event);
                    if done {
                        return;
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for idle");
    seen
}

async fn wait_for_file(path: &Path) -> String {
    for _ in 0..100 {
        if let Ok(text) = std::fs::read_to_string(path) {
            if !text.is_empty() {
                return text;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} never appeared", path.display());
}

// =============================================================================
// Start and Stop
// =============================================================================

#[tokio::test]
async fn test_start_then_stop_releases_everything() {
    let h = Harness::new();
    let pid_file = h.path("bridge.pid");
    let orchestrator = h.spawn(h.config(sh_bridge(&ready_bridge(&pid_file)), sh_player(LONG_PLAYER)));
    let mut events = orchestrator.subscribe();

    let started = orchestrator.start_stream(request()).await.unwrap();
    assert_eq!(started.url, format!("http://localhost:{}/0", started.port));
    assert!((20000..30000).contains(&started.port));
    assert!(started.download_dir.exists());
    assert!(is_workspace(&started.download_dir));
    assert!(started.subtitle_url.is_none());
    assert_eq!(orchestrator.state(), SessionState::Streaming);

    let progress = wait_for(&mut events, |e| matches!(e, SessionEvent::Progress(_))).await;
    assert_eq!(progress, SessionEvent::Progress("Downloading metadata".to_string()));

    let player_pid = match wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PlaybackStarted { .. })
    })
    .await
    {
        SessionEvent::PlaybackStarted { pid, attempt } => {
            assert_eq!(attempt, 1);
            pid.unwrap() as i32
        }
        _ => unreachable!(),
    };
    let bridge_pid = read_pid(&pid_file);
    assert!(alive(bridge_pid));
    assert!(alive(player_pid));

    assert!(orchestrator.stop_stream().await.success);
    assert_eq!(orchestrator.state(), SessionState::Idle);
    wait_for(&mut events, |e| *e == SessionEvent::PlaybackEnded).await;

    assert!(!alive(bridge_pid), "bridge must be gone after stop");
    assert!(!alive(player_pid), "player must be gone after stop");
    assert!(!started.download_dir.exists());
    assert_eq!(h.workspaces(), 0);

    // Stopping again is a no-op
    assert!(orchestrator.stop_stream().await.success);
}

#[tokio::test]
async fn test_player_receives_stream_url_first() {
    let h = Harness::new();
    let pid_file = h.path("bridge.pid");
    let args_file = h.path("player.args");
    let player = format!("printf '%s\\n' \"$@\" > '{}'; exec sleep 30", args_file.display());
    let orchestrator = h.spawn(h.config(sh_bridge(&ready_bridge(&pid_file)), sh_player(&player)));

    let started = orchestrator.start_stream(request()).await.unwrap();
    let args = wait_for_file(&args_file).await;
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(args[0], started.url);
    assert!(args.contains(&"--title=Big Buck Bunny"));
    assert!(!args.iter().any(|a| a.starts_with("--sub-file=")));

    orchestrator.shutdown().await;
    assert_eq!(h.workspaces(), 0);
}

#[tokio::test]
async fn test_subtitles_follow_the_session() {
    let h = Harness::new();
    let pid_file = h.path("bridge.pid");
    let args_file = h.path("player.args");
    let player = format!("printf '%s\\n' \"$@\" > '{}'; exec sleep 30", args_file.display());
    let config = h.config(sh_bridge(&ready_bridge(&pid_file)), sh_player(&player));
    let orchestrator = StreamOrchestrator::spawn(config, Arc::new(FixedSubtitles));
    let mut events = orchestrator.subscribe();

    let mut req = request();
    req.use_subtitles = true;
    let started = orchestrator.start_stream(req).await.unwrap();

    let subtitle_path = started.subtitle_path.clone().expect("subtitle file");
    assert!(subtitle_path.starts_with(h.root.path()));
    assert!(std::fs::read_to_string(&subtitle_path)
        .unwrap()
        .starts_with("WEBVTT"));
    assert!(started.subtitle_url.as_deref().unwrap().starts_with("file://"));

    let args = wait_for_file(&args_file).await;
    let expected = format!("--sub-file={}", subtitle_path.display());
    assert!(args.lines().any(|a| a == expected));

    let first = wait_for(&mut events, |e| matches!(e, SessionEvent::SubtitleStatus(_))).await;
    assert_eq!(
        first,
        SessionEvent::SubtitleStatus("Searching for subtitles...".to_string())
    );
    wait_for(&mut events, |e| {
        *e == SessionEvent::SubtitleStatus("Subtitle downloaded".to_string())
    })
    .await;

    orchestrator.stop_stream().await;
    assert!(!subtitle_path.exists());
}

// =============================================================================
// Failed Starts
// =============================================================================

#[tokio::test]
async fn test_readiness_timeout_kills_bridge() {
    let h = Harness::new();
    let pid_file = h.path("bridge.pid");
    let mut config = h.config(sh_bridge(&silent_bridge(&pid_file)), sh_player(LONG_PLAYER));
    config.readiness_timeout = Duration::from_millis(500);
    let orchestrator = h.spawn(config);

    let err = orchestrator.start_stream(request()).await.unwrap_err();
    assert_eq!(err, StreamError::ReadinessTimeout);
    assert_eq!(orchestrator.state(), SessionState::Idle);
    assert!(!alive(read_pid(&pid_file)));
    assert_eq!(h.workspaces(), 0);
}

#[tokio::test]
async fn test_non_utf8_output_before_readiness() {
    let h = Harness::new();
    let bridge = "printf 'Downloading caf\\351.mkv\\n'; echo \"Server running at: http://localhost:$3/0\"; exec sleep 30";
    let orchestrator = h.spawn(h.config(sh_bridge(bridge), sh_player(LONG_PLAYER)));
    let mut events = orchestrator.subscribe();

    let started = orchestrator.start_stream(request()).await.unwrap();
    assert_eq!(started.url, format!("http://localhost:{}/0", started.port));

    let progress = wait_for(&mut events, |e| matches!(e, SessionEvent::Progress(_))).await;
    assert_eq!(
        progress,
        SessionEvent::Progress("Downloading caf\u{FFFD}.mkv".to_string())
    );

    orchestrator.stop_stream().await;
    assert_eq!(h.workspaces(), 0);
}

#[tokio::test]
async fn test_non_loopback_url_rejected() {
    let h = Harness::new();
    let bridge = "echo \"Server running at: http://192.168.1.50:$3/0\"; exec sleep 30";
    let orchestrator = h.spawn(h.config(sh_bridge(bridge), sh_player(LONG_PLAYER)));

    let err = orchestrator.start_stream(request()).await.unwrap_err();
    assert!(matches!(err, StreamError::UntrustedUrl(_)), "got {:?}", err);
    assert_eq!(h.workspaces(), 0);
}

#[tokio::test]
async fn test_bridge_exit_before_readiness() {
    let h = Harness::new();
    let bridge = "echo 'Error: no peers for this torrent' >&2; exit 3";
    let orchestrator = h.spawn(h.config(sh_bridge(bridge), sh_player(LONG_PLAYER)));

    match orchestrator.start_stream(request()).await {
        Err(StreamError::BridgeExited { code, detail }) => {
            assert_eq!(code, Some(3));
            assert!(detail.contains("no peers"), "detail was {}", detail);
        }
        other => panic!("expected BridgeExited, got {:?}", other),
    }
    assert_eq!(h.workspaces(), 0);
}

#[tokio::test]
async fn test_bridge_spawn_failure() {
    let h = Harness::new();
    let bridge = BridgeCommand::external("/nonexistent/moviestream-bridge");
    let orchestrator = h.spawn(h.config(bridge, sh_player(LONG_PLAYER)));

    let err = orchestrator.start_stream(request()).await.unwrap_err();
    assert!(matches!(err, StreamError::Spawn(_)), "got {:?}", err);
    assert_eq!(orchestrator.state(), SessionState::Idle);
    assert_eq!(h.workspaces(), 0);
}

#[tokio::test]
async fn test_invalid_identifier() {
    let h = Harness::new();
    let orchestrator = h.spawn(h.config(sh_bridge("exit 0"), sh_player(LONG_PLAYER)));

    let err = orchestrator
        .start_stream(StreamRequest::new("not-a-hash", "Nothing"))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::InvalidRequest(_)));
    assert_eq!(h.workspaces(), 0);
}

// =============================================================================
// Session Replacement
// =============================================================================

#[tokio::test]
async fn test_rapid_starts_keep_one_session() {
    let h = Harness::new();
    let pid_file = h.path("bridge.pid");
    let mut config = h.config(sh_bridge(&ready_bridge(&pid_file)), sh_player(LONG_PLAYER));
    config.player_launch_delay = Duration::from_millis(500);
    let orchestrator = h.spawn(config);

    let first = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.start_stream(request()).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = orchestrator
        .start_stream(StreamRequest::new(HASH, "Sintel"))
        .await
        .unwrap();
    assert_eq!(first.await.unwrap(), Err(StreamError::Superseded));
    assert_eq!(h.workspaces(), 1);
    assert!(second.download_dir.exists());

    orchestrator.stop_stream().await;
    assert_eq!(h.workspaces(), 0);
}

#[tokio::test]
async fn test_new_start_replaces_playing_session() {
    let h = Harness::new();
    let pids_file = h.path("bridge.pids");
    let bridge = format!(
        "echo $$ >> '{}'; echo \"Server running at: http://localhost:$3/0\"; exec sleep 30",
        pids_file.display()
    );
    let orchestrator = h.spawn(h.config(sh_bridge(&bridge), sh_player(LONG_PLAYER)));
    let mut events = orchestrator.subscribe();

    let first = orchestrator.start_stream(request()).await.unwrap();
    let first_player = match wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PlaybackStarted { .. })
    })
    .await
    {
        SessionEvent::PlaybackStarted { pid, .. } => pid.unwrap() as i32,
        _ => unreachable!(),
    };
    assert_eq!(orchestrator.state(), SessionState::Streaming);
    let first_bridge = read_pid(&pids_file);

    let second = orchestrator
        .start_stream(StreamRequest::new(HASH, "Sintel"))
        .await
        .unwrap();
    let second_player = match wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PlaybackStarted { .. })
    })
    .await
    {
        SessionEvent::PlaybackStarted { pid, .. } => pid.unwrap() as i32,
        _ => unreachable!(),
    };

    assert!(!alive(first_bridge), "first bridge must be gone");
    assert!(!alive(first_player), "first player must be gone");
    assert!(!first.download_dir.exists());

    let pids: Vec<i32> = std::fs::read_to_string(&pids_file)
        .unwrap()
        .lines()
        .map(|l| l.trim().parse().unwrap())
        .collect();
    assert_eq!(pids.len(), 2);
    assert!(alive(pids[1]));
    assert!(alive(second_player));
    assert!(second.download_dir.exists());
    assert_eq!(h.workspaces(), 1);

    orchestrator.stop_stream().await;
    assert!(!alive(pids[1]));
    assert!(!alive(second_player));
    assert_eq!(h.workspaces(), 0);
}

#[tokio::test]
async fn test_shutdown_then_start_fails() {
    let h = Harness::new();
    let pid_file = h.path("bridge.pid");
    let orchestrator = h.spawn(h.config(sh_bridge(&ready_bridge(&pid_file)), sh_player(LONG_PLAYER)));

    orchestrator.start_stream(request()).await.unwrap();
    orchestrator.shutdown().await;
    assert!(!alive(read_pid(&pid_file)));
    assert_eq!(h.workspaces(), 0);

    let err = orchestrator.start_stream(request()).await.unwrap_err();
    assert_eq!(err, StreamError::OrchestratorGone);
    assert!(!orchestrator.stop_stream().await.success);
}

// =============================================================================
// Playback
// =============================================================================

#[tokio::test]
async fn test_player_missing_keeps_transfer() {
    let h = Harness::new();
    let pid_file = h.path("bridge.pid");
    let player = LocalPlayer::mpv().with_program("/nonexistent/mpv");
    let orchestrator = h.spawn(h.config(sh_bridge(&ready_bridge(&pid_file)), player));
    let mut events = orchestrator.subscribe();

    let started = orchestrator.start_stream(request()).await.unwrap();
    match wait_for(&mut events, |e| matches!(e, SessionEvent::PlayerMissing { .. })).await {
        SessionEvent::PlayerMissing { message, url } => {
            assert!(message.contains("mpv player not found"));
            assert_eq!(url, "https://mpv.io/installation/");
        }
        _ => unreachable!(),
    }

    assert_eq!(orchestrator.state(), SessionState::Streaming);
    assert!(alive(read_pid(&pid_file)));
    assert!(started.download_dir.exists());

    orchestrator.stop_stream().await;
    assert_eq!(h.workspaces(), 0);
}

#[tokio::test]
async fn test_player_exit_ends_session() {
    let h = Harness::new();
    let pid_file = h.path("bridge.pid");
    let orchestrator = h.spawn(h.config(sh_bridge(&ready_bridge(&pid_file)), sh_player("exit 0")));
    let mut events = orchestrator.subscribe();

    let started = orchestrator.start_stream(request()).await.unwrap();
    let seen = collect_until_idle(&mut events).await;

    let ended = seen.iter().filter(|e| **e == SessionEvent::PlaybackEnded).count();
    assert_eq!(ended, 1);
    assert!(!seen.iter().any(|e| matches!(e, SessionEvent::TransferError(_))));
    assert!(!alive(read_pid(&pid_file)));
    assert!(!started.download_dir.exists());
}

#[tokio::test]
async fn test_crashing_player_is_retried() {
    let h = Harness::new();
    let pid_file = h.path("bridge.pid");
    let orchestrator = h.spawn(h.config(sh_bridge(&ready_bridge(&pid_file)), sh_player("exit 1")));
    let mut events = orchestrator.subscribe();

    orchestrator.start_stream(request()).await.unwrap();
    let seen = collect_until_idle(&mut events).await;

    let attempts: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::PlaybackStarted { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, [1, 2, 3]);
    let ended = seen.iter().filter(|e| **e == SessionEvent::PlaybackEnded).count();
    assert_eq!(ended, 1);
    assert_eq!(h.workspaces(), 0);
}

#[tokio::test]
async fn test_transfer_death_during_playback() {
    let h = Harness::new();
    let bridge = "echo \"Server running at: http://localhost:$3/0\"; sleep 1; echo 'Error: tracker gone' >&2; exit 2";
    let orchestrator = h.spawn(h.config(sh_bridge(bridge), sh_player(LONG_PLAYER)));
    let mut events = orchestrator.subscribe();

    orchestrator.start_stream(request()).await.unwrap();
    let seen = collect_until_idle(&mut events).await;

    let player_pid = seen
        .iter()
        .find_map(|e| match e {
            SessionEvent::PlaybackStarted { pid, .. } => *pid,
            _ => None,
        })
        .expect("player started") as i32;
    let detail = seen
        .iter()
        .find_map(|e| match e {
            SessionEvent::TransferError(detail) => Some(detail.clone()),
            _ => None,
        })
        .expect("transfer error");
    assert!(detail.contains("tracker gone"), "detail was {}", detail);
    assert!(seen.contains(&SessionEvent::PlaybackEnded));
    assert!(!alive(player_pid));
    assert_eq!(h.workspaces(), 0);
}
