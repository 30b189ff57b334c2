//! Moving file contents over a [Channel], with resumption of interrupted transfers.
//!
//! After the command's end-of-response line, a transfer proceeds like this (the server's
//!  view):
//!
//! *download*
//! ```ascii
//! server -> client   200 ACCEPT
//! client -> server   <already received byte count>     (only when resuming)
//! client -> server   <sync>
//! server -> client   <remaining byte count>
//! server -> client   <chunks>...
//! ```
//!
//! *upload*
//! ```ascii
//! server -> client   200 ACCEPT
//! client -> server   <sync>
//! server -> client   <current file size>               (only if the client asked to resume)
//! client -> server   <byte count to follow>
//! client -> server   <chunks>...
//! ```
//!
//! A transfer can only be resumed if it is the most recent one in its direction on the same
//!  [TransferEngine], from the same peer and for the same file, and if it did not complete.

pub mod file_names;
pub mod request;

use std::io::SeekFrom;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use anyhow::{bail, Context};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::status::Status;
use crate::transfer::request::TransferRequest;

pub use file_names::resolve_file_name;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// all bytes were transferred; `bytes` is the number moved by this call, which is less than
    ///  the file size for a resumed transfer
    Completed { bytes: u64 },
    /// the file to download does not exist - nothing was sent
    FileNotFound,
    /// the peer asked to resume, but there is no matching unfinished transfer - nothing was sent
    ResumeRejected,
}

/// Server side of file transfers. It remembers the most recent download and upload for
///  resumption, so there should be one engine per client (or client address).
pub struct TransferEngine {
    chunk_send_timeout: Duration,
    chunk_receive_timeout: Duration,
    last_download: Option<TransferRequest>,
    last_upload: Option<TransferRequest>,
}

impl TransferEngine {
    pub fn new(config: &ServerConfig) -> TransferEngine {
        TransferEngine {
            chunk_send_timeout: config.chunk_send_timeout,
            chunk_receive_timeout: config.chunk_receive_timeout,
            last_download: None,
            last_upload: None,
        }
    }

    pub fn last_download(&self) -> Option<&TransferRequest> {
        self.last_download.as_ref()
    }

    pub fn last_upload(&self) -> Option<&TransferRequest> {
        self.last_upload.as_ref()
    }

    /// Sends a file to the peer. An `Err` means the channel (or the file system) failed in the
    ///  middle of the transfer, leaving the channel in an undefined state.
    pub async fn download_file(&mut self, channel: &mut dyn Channel, path: &Path, peer: IpAddr, resume: bool) -> anyhow::Result<TransferOutcome> {
        let mut file = match open_regular_file(path).await? {
            Some(file) => file,
            None => {
                debug!("download of {:?}: file not found", path);
                return Ok(TransferOutcome::FileNotFound);
            }
        };
        let file_len = file.metadata().await?.len();

        let resuming = resume && self.last_download.as_ref()
            .is_some_and(|last| last.is_resumable_by(peer, path));
        if resume && !resuming {
            debug!("download of {:?}: no unfinished download from {} to resume", path, peer);
            return Ok(TransferOutcome::ResumeRejected);
        }

        channel.write_text(&Status::accept_line()).await?;

        let mut request = TransferRequest::new(peer, path);
        if resuming {
            let already_received = channel.read_u64(self.chunk_receive_timeout).await?;
            request.progress = already_received.min(file_len);
            file.seek(SeekFrom::Start(request.progress)).await?;
            info!("resuming download of {:?} to {} at byte {}", path, peer, request.progress);
        }
        else {
            info!("starting download of {:?} ({} bytes) to {}", path, file_len, peer);
        }
        let request = self.last_download.insert(request);

        channel.read_sync(self.chunk_receive_timeout).await?;
        let remaining = file_len - request.progress;
        channel.write_u64(remaining).await?;

        let mut buf = vec![0u8; channel.max_chunk_len()];
        let mut sent = 0;
        while sent < remaining {
            let max_read = buf.len().min((remaining - sent) as usize);
            let num_read = file.read(&mut buf[..max_read]).await?;
            if num_read == 0 {
                bail!("{:?} shrank while it was being sent", path);
            }

            channel.send_chunk(&buf[..num_read], self.chunk_send_timeout).await?;
            sent += num_read as u64;
            request.progress += num_read as u64;
        }

        request.successful = true;
        info!("download of {:?} to {} complete", path, peer);
        Ok(TransferOutcome::Completed { bytes: sent })
    }

    /// Receives a file from the peer. A request to resume that does not match an unfinished
    ///  upload starts from the beginning, reporting a current size of 0 to the peer.
    pub async fn upload_file(&mut self, channel: &mut dyn Channel, path: &Path, peer: IpAddr, resume: bool) -> anyhow::Result<TransferOutcome> {
        let resuming = resume && self.last_upload.as_ref()
            .is_some_and(|last| last.is_resumable_by(peer, path));

        if !resuming {
            if let Some(last) = &self.last_upload {
                if !last.successful {
                    discard_partial_upload(&last.path).await;
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await
                .with_context(|| format!("creating directory {:?}", parent))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resuming)
            .truncate(!resuming)
            .open(path).await
            .with_context(|| format!("opening {:?} for upload", path))?;

        channel.write_text(&Status::accept_line()).await?;
        channel.read_sync(self.chunk_receive_timeout).await?;

        let current_size = file.metadata().await?.len();
        if resume {
            channel.write_u64(current_size).await?;
        }
        let expected = channel.read_u64(self.chunk_receive_timeout).await?;

        if resuming {
            info!("resuming upload of {:?} from {} at byte {}, {} more bytes", path, peer, current_size, expected);
        }
        else {
            info!("starting upload of {:?} ({} bytes) from {}", path, expected, peer);
        }

        let request = self.last_upload.insert(TransferRequest::new(peer, path));
        request.progress = current_size;

        let max_chunk_len = channel.max_chunk_len();
        let mut received = 0;
        while received < expected {
            let max_len = max_chunk_len.min((expected - received) as usize);
            let chunk = channel.recv_chunk(max_len, self.chunk_receive_timeout).await?;
            if chunk.len() as u64 > expected - received {
                return Err(TransportError::Malformed(format!("received {} bytes more than announced", chunk.len() as u64 - (expected - received))).into());
            }

            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            request.progress += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;

        request.successful = true;
        info!("upload of {:?} from {} complete", path, peer);
        Ok(TransferOutcome::Completed { bytes: received })
    }
}

/// `None` if there is no regular file at the path
async fn open_regular_file(path: &Path) -> anyhow::Result<Option<File>> {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("accessing {:?}", path)),
    }

    let file = File::open(path).await
        .with_context(|| format!("opening {:?}", path))?;
    Ok(Some(file))
}

async fn discard_partial_upload(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("discarded partial upload {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to discard partial upload {:?}: {}", path, e),
    }
}
