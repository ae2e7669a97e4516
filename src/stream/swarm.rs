//! librqbit-backed swarm session
//!
//! Used only inside the bridge process. Joins one torrent, picks the payload
//! file and exposes it as a [`PayloadSource`] whose read streams park until
//! the pieces they need arrive.

use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use librqbit::{
    AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session,
    SessionOptions,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// librqbit's `ManagedTorrentHandle` alias is not re-exported at the crate root.
type ManagedTorrentHandle = std::sync::Arc<ManagedTorrent>;
use tracing::{debug, info};

use super::bridge::emit;
use super::payload::{select_payload, PayloadCandidate, PayloadReader, PayloadSource};

/// How often metadata is re-read while the torrent lists no files
const METADATA_POLL: Duration = Duration::from_secs(1);

/// One joined torrent
pub struct Swarm {
    session: Arc<Session>,
    handle: ManagedTorrentHandle,
}

impl Swarm {
    /// Start a session rooted at `out_dir` and add the magnet to it.
    ///
    /// For magnet links this resolves metadata from peers before returning.
    pub async fn join(magnet: &str, out_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .with_context(|| format!("Failed to create {}", out_dir.display()))?;

        let session = Session::new_with_opts(
            out_dir.to_path_buf(),
            SessionOptions {
                disable_dht_persistence: true,
                ..Default::default()
            },
        )
        .await
        .context("Failed to start torrent session")?;

        emit("Fetching torrent metadata...");
        let response = session
            .add_torrent(
                AddTorrent::from_url(magnet),
                Some(AddTorrentOptions {
                    overwrite: true,
                    ..Default::default()
                }),
            )
            .await
            .context("Failed to add torrent")?;

        let handle = match response {
            AddTorrentResponse::Added(_, handle) => handle,
            AddTorrentResponse::AlreadyManaged(_, handle) => handle,
            AddTorrentResponse::ListOnly(_) => bail!("Torrent was added in list-only mode"),
        };
        info!(name = ?handle.name(), "joined swarm");

        Ok(Self { session, handle })
    }

    /// Wait until metadata lists at least one file, then select the payload.
    pub async fn wait_for_payload(&self) -> Result<Arc<TorrentPayload>> {
        self.handle
            .wait_until_initialized()
            .await
            .context("Torrent failed to initialize")?;

        loop {
            let files = self
                .handle
                .with_metadata(|meta| {
                    meta.file_infos
                        .iter()
                        .map(|fi| PayloadCandidate {
                            name: fi.relative_filename.to_string_lossy().into_owned(),
                            length: fi.len,
                        })
                        .collect::<Vec<_>>()
                })
                .context("Torrent metadata unavailable")?;

            if let Some(file_id) = select_payload(&files) {
                let file = &files[file_id];
                info!(file_id, name = %file.name, length = file.length, "selected payload");
                return Ok(Arc::new(TorrentPayload {
                    handle: self.handle.clone(),
                    file_id,
                    name: file.name.clone(),
                    length: file.length,
                }));
            }

            debug!("torrent lists no files yet");
            emit("Waiting for torrent files...");
            tokio::time::sleep(METADATA_POLL).await;
        }
    }

    /// Stop the session and release peers, sockets and file handles.
    pub async fn shutdown(self) {
        self.session.stop().await;
    }
}

/// The selected file of a joined torrent
pub struct TorrentPayload {
    handle: ManagedTorrentHandle,
    file_id: usize,
    name: String,
    length: u64,
}

impl TorrentPayload {
    /// Verified bytes of this file, as reported by the engine
    fn file_progress(&self) -> u64 {
        self.handle
            .stats()
            .file_progress
            .get(self.file_id)
            .copied()
            .unwrap_or(0)
            .min(self.length)
    }

    /// One human-readable progress line for the bridge output channel
    pub fn progress_line(&self) -> String {
        let stats = self.handle.stats();
        let done = self.file_progress();
        let pct = if self.length == 0 {
            100.0
        } else {
            done as f64 * 100.0 / self.length as f64
        };
        format!(
            "Downloading: {:.1}% ({} / {} bytes), torrent {} / {} bytes",
            pct, done, self.length, stats.progress_bytes, stats.total_bytes
        )
    }
}

#[async_trait]
impl PayloadSource for TorrentPayload {
    fn name(&self) -> &str {
        &self.name
    }

    fn length(&self) -> u64 {
        self.length
    }

    // librqbit tracks verified bytes per file rather than a strict prefix;
    // the read stream still waits on any missing piece.
    fn downloaded_contiguous_length(&self) -> u64 {
        self.file_progress()
    }

    fn is_complete(&self) -> bool {
        self.handle.stats().finished || self.file_progress() >= self.length
    }

    async fn open_read_stream(&self, start: u64, end: Option<u64>) -> io::Result<PayloadReader> {
        let mut stream = self
            .handle
            .clone()
            .stream(self.file_id)
            .map_err(io::Error::other)?;
        stream.seek(SeekFrom::Start(start)).await?;

        let reader: PayloadReader = match end {
            Some(end) => Box::pin(stream.take(end.saturating_sub(start) + 1)),
            None => Box::pin(stream),
        };
        Ok(reader)
    }
}
