//! CLI command handlers
//!
//! Each handler takes its parsed arguments, does the work and returns the
//! exit code. Output goes through [`Output`] so every command honors
//! `--json` and `--quiet` the same way.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;

use crate::cli::{
    validate_imdb_id, BridgeCmd, ExitCode, Output, PlayerChoice, SearchCmd, StreamCmd,
    StreamResponse, SubtitlesCmd, WatchCmd,
};
use moviestream::models::{MovieMetadata, Quality, StreamRequest};
use moviestream::stream::bridge::{self, BridgeArgs};
use moviestream::stream::{
    SessionEvent, StreamOrchestrator, StreamStarted, SubtitleClient, SubtitleQuery,
};
use moviestream::{Config, YtsClient};

// =============================================================================
// Search Command
// =============================================================================

#[derive(Serialize)]
struct SearchResult {
    index: usize,
    id: u64,
    title: String,
    year: Option<u16>,
    rating: f32,
    imdb_code: Option<String>,
    qualities: Vec<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    page: u32,
    total_pages: u32,
    results: Vec<SearchResult>,
}

pub async fn search_cmd(cmd: SearchCmd, config: &Config, output: &Output) -> ExitCode {
    if cmd.page == 0 {
        return output.error("Page numbers start at 1", ExitCode::InvalidArgs);
    }

    let client = YtsClient::with_base_url(&config.catalog_url);
    let page = match client.search(&cmd.query, cmd.page).await {
        Ok(page) => page,
        Err(e) => return output.error(format!("Search failed: {:#}", e), ExitCode::NetworkError),
    };

    if page.movies.is_empty() {
        return output.error(format!("No movies found for '{}'", cmd.query), ExitCode::NoStreams);
    }

    if output.json {
        let results = page
            .movies
            .iter()
            .enumerate()
            .map(|(index, movie)| SearchResult {
                index,
                id: movie.id,
                title: movie.title.clone(),
                year: movie.year,
                rating: movie.rating,
                imdb_code: movie.imdb_code.clone(),
                qualities: movie.torrents.iter().map(|t| t.quality.clone()).collect(),
            })
            .collect();
        let response = SearchResponse {
            page: page.page,
            total_pages: page.total_pages,
            results,
        };
        if let Err(e) = output.print(response) {
            return output.error(e.to_string(), ExitCode::Error);
        }
    } else {
        for (index, movie) in page.movies.iter().enumerate() {
            println!("{:>3}. {}", index, movie);
            for variant in &movie.torrents {
                println!("       {}", variant);
            }
        }
        output.info(format!("Page {} of {}", page.page, page.total_pages));
    }

    ExitCode::Success
}

// =============================================================================
// Subtitles Command
// =============================================================================

pub async fn subtitles_cmd(cmd: SubtitlesCmd, config: &Config, output: &Output) -> ExitCode {
    if let Some(imdb) = &cmd.imdb {
        if let Err(e) = validate_imdb_id(imdb) {
            return output.error(e, ExitCode::InvalidArgs);
        }
    }

    let language = cmd.lang.unwrap_or_else(|| config.subtitle_language.clone());
    let query = SubtitleQuery {
        title: cmd.title,
        year: cmd.year,
        imdb_id: cmd.imdb,
        language,
    };

    let client = SubtitleClient::with_base_url(&config.subtitle_url);
    let mut candidates = match client.search(&query).await {
        Ok(candidates) => candidates,
        Err(e) => {
            return output.error(format!("Subtitle search failed: {:#}", e), ExitCode::NetworkError)
        }
    };
    candidates.truncate(cmd.limit);

    if candidates.is_empty() {
        return output.error(
            format!("No subtitles found for '{}'", query.search_term()),
            ExitCode::NoStreams,
        );
    }

    if output.json {
        if let Err(e) = output.print(&candidates) {
            return output.error(e.to_string(), ExitCode::Error);
        }
    } else {
        for candidate in &candidates {
            println!(
                "{:>4.1}  [{}] {} ({})",
                candidate.rating, candidate.language, candidate.file_name, candidate.format
            );
        }
    }

    ExitCode::Success
}

// =============================================================================
// Stream Command
// =============================================================================

pub async fn stream_cmd(cmd: StreamCmd, config: &Config, output: &Output) -> ExitCode {
    if let Some(imdb) = &cmd.imdb {
        if let Err(e) = validate_imdb_id(imdb) {
            return output.error(e, ExitCode::InvalidArgs);
        }
    }

    let mut request = StreamRequest::new(cmd.identifier, cmd.title.clone());
    request.quality = cmd.quality.map(|q| q.to_string());
    request.use_subtitles = !cmd.no_subtitles;
    if cmd.year.is_some() || cmd.imdb.is_some() {
        request.metadata = Some(MovieMetadata {
            title: cmd.title,
            year: cmd.year,
            imdb_code: cmd.imdb,
        });
    }

    run_stream(request, cmd.player, config, output).await
}

// =============================================================================
// Watch Command
// =============================================================================

pub async fn watch_cmd(cmd: WatchCmd, config: &Config, output: &Output) -> ExitCode {
    let client = YtsClient::with_base_url(&config.catalog_url);
    output.info(format!("Searching for '{}'...", cmd.query));
    let page = client.search_lenient(&cmd.query, 1).await;

    let Some(movie) = page.movies.get(cmd.index) else {
        return output.error(
            format!("No movie at index {} for '{}'", cmd.index, cmd.query),
            ExitCode::NoStreams,
        );
    };

    let quality = cmd
        .quality
        .map(Quality::from)
        .or_else(|| config.preferred_quality.as_deref().map(Quality::from_str_loose));
    let Some(variant) = movie.pick_variant(quality) else {
        let wanted = quality.map(|q| format!(" in {}", q)).unwrap_or_default();
        return output.error(
            format!("No release of '{}'{}", movie.title, wanted),
            ExitCode::NoStreams,
        );
    };

    output.info(format!("Selected {} - {}", movie, variant));

    let mut request = StreamRequest::new(variant.hash.clone(), movie.title.clone());
    request.quality = Some(variant.quality.clone());
    request.use_subtitles = !cmd.no_subtitles;
    request.metadata = Some(movie.metadata());

    run_stream(request, cmd.player, config, output).await
}

// =============================================================================
// Bridge Command
// =============================================================================

pub async fn bridge_cmd(cmd: BridgeCmd) -> ExitCode {
    let args = BridgeArgs {
        magnet: cmd.magnet,
        port: cmd.port,
        out_dir: cmd.out,
    };
    match bridge::run(args).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            // The orchestrator reports the last line it saw
            bridge::emit(format!("Error: {:#}", e));
            ExitCode::StreamFailed
        }
    }
}

// =============================================================================
// Session Driver
// =============================================================================

/// Run one session to its end: start, play, then tear down.
async fn run_stream(
    request: StreamRequest,
    player: Option<PlayerChoice>,
    config: &Config,
    output: &Output,
) -> ExitCode {
    let mut session_config = match config.session_config() {
        Ok(session_config) => session_config,
        Err(e) => return output.error(format!("{:#}", e), ExitCode::InvalidArgs),
    };
    if let Some(choice) = player {
        let config = Config {
            player: choice.into(),
            ..config.clone()
        };
        session_config.player = config.local_player();
    }

    let subtitles = Arc::new(SubtitleClient::with_base_url(&config.subtitle_url));
    let orchestrator = StreamOrchestrator::spawn(session_config, subtitles);
    let mut events = orchestrator.subscribe();
    let title = request.title.clone();
    let quality = request.quality.clone();

    output.info(format!("Starting '{}'...", title));
    let mut outcome = Outcome::default();
    let start = orchestrator.start_stream(request);
    tokio::pin!(start);

    let started = loop {
        tokio::select! {
            result = &mut start => break result,
            event = events.recv() => {
                if let Ok(event) = event {
                    report_event(output, &event, &mut outcome);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                orchestrator.shutdown().await;
                return output.error("Interrupted", ExitCode::Error);
            }
        }
    };

    let started = match started {
        Ok(started) => started,
        Err(e) => {
            drain_events(output, &mut events, &mut outcome);
            orchestrator.shutdown().await;
            return output.error(e.to_string(), ExitCode::from(&e));
        }
    };
    announce(output, &title, quality, &started);

    // Launch results are announced before the start is answered
    drain_events(output, &mut events, &mut outcome);

    if !outcome.playing {
        orchestrator.shutdown().await;
        return match outcome.player_missing {
            Some(message) => output.error(message, ExitCode::PlayerMissing),
            None => output.error(
                outcome.failure.unwrap_or_else(|| "Player did not start".to_string()),
                ExitCode::StreamFailed,
            ),
        };
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    report_event(output, &event, &mut outcome);
                    if outcome.ended {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event receiver lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                output.info("Stopping...");
                orchestrator.stop_stream().await;
                break;
            }
        }
    }

    orchestrator.shutdown().await;
    match outcome.failure.filter(|_| outcome.transfer_failed) {
        Some(detail) => output.error(format!("Transfer stopped: {}", detail), ExitCode::StreamFailed),
        None => ExitCode::Success,
    }
}

/// What the event stream has told us so far
#[derive(Debug, Default)]
struct Outcome {
    playing: bool,
    ended: bool,
    transfer_failed: bool,
    player_missing: Option<String>,
    failure: Option<String>,
}

fn report_event(output: &Output, event: &SessionEvent, outcome: &mut Outcome) {
    match event {
        SessionEvent::PlaybackStarted { .. } => outcome.playing = true,
        SessionEvent::PlaybackEnded => outcome.ended = true,
        SessionEvent::PlayerMissing { message, .. } => {
            outcome.player_missing = Some(message.clone())
        }
        SessionEvent::PlaybackFailed(reason) => outcome.failure = Some(reason.clone()),
        SessionEvent::TransferError(detail) => {
            outcome.transfer_failed = true;
            outcome.failure = Some(detail.clone());
            outcome.ended = true;
        }
        _ => {}
    }

    if output.json {
        if let Err(e) = output.print_line(event) {
            tracing::warn!("failed to print event: {}", e);
        }
        return;
    }

    match event {
        SessionEvent::Progress(line) | SessionEvent::SubtitleStatus(line) => output.info(line),
        SessionEvent::PlaybackStarted { pid, attempt } => {
            let pid = pid.map(|p| format!(" (pid {})", p)).unwrap_or_default();
            if *attempt > 1 {
                output.info(format!("Player restarted{}, attempt {}", pid, attempt));
            } else {
                output.info(format!("Player started{}", pid));
            }
        }
        SessionEvent::PlaybackEnded => output.info("Playback ended"),
        SessionEvent::PlayerMissing { message, .. } => output.info(message),
        SessionEvent::PlaybackFailed(reason) => output.info(format!("Playback failed: {}", reason)),
        SessionEvent::TransferError(detail) => output.info(format!("Transfer error: {}", detail)),
        SessionEvent::StateChanged(state) => tracing::debug!(%state, "session state"),
    }
}

fn drain_events(output: &Output, events: &mut Receiver<SessionEvent>, outcome: &mut Outcome) {
    loop {
        match events.try_recv() {
            Ok(event) => report_event(output, &event, outcome),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}

fn announce(output: &Output, title: &str, quality: Option<String>, started: &StreamStarted) {
    let response = StreamResponse {
        status: "streaming",
        title: title.to_string(),
        url: started.url.clone(),
        subtitle_url: started.subtitle_url.clone(),
        quality,
    };
    if output.json {
        if let Err(e) = output.print_line(&response) {
            tracing::warn!("failed to print stream info: {}", e);
        }
    } else {
        output.info(format!("Streaming {} at {}", response.title, response.url));
        if let Some(subtitle) = &response.subtitle_url {
            output.info(format!("Subtitles: {}", subtitle));
        }
    }
}
