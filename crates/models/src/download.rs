use crate::{DownloadError, HttpClient, Result};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    pub bearer_token: Option<String>,
    /// Bytes written per progress step.
    pub buffer_size: usize,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            bearer_token: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
}

impl DownloadProgress {
    /// Completed fraction, or `None` when the server did not declare a length.
    pub fn fraction(&self) -> Option<f32> {
        self.total_bytes.map(|total| {
            (self.downloaded_bytes as f64 / total as f64).clamp(0.0, 1.0) as f32
        })
    }
}

/// Stream `request.url` into `request.destination`.
///
/// The body is written in `buffer_size` blocks and `on_progress` runs after
/// each block. On any failure the destination file is removed before the
/// error is returned. Returns the number of bytes written.
pub async fn download_artifact<F>(
    client: &dyn HttpClient,
    request: &DownloadRequest,
    mut on_progress: F,
) -> Result<u64>
where
    F: FnMut(DownloadProgress) + Send,
{
    tracing::info!(url = %request.url, dest = %request.destination.display(), "Starting model download");

    match stream_to_file(client, request, &mut on_progress).await {
        Ok(bytes) => {
            tracing::info!(bytes, dest = %request.destination.display(), "Model download finished");
            Ok(bytes)
        }
        Err(e) => {
            tracing::error!(error = %e, url = %request.url, "Model download failed");
            discard_partial(&request.destination).await;
            Err(e)
        }
    }
}

async fn stream_to_file<F>(
    client: &dyn HttpClient,
    request: &DownloadRequest,
    on_progress: &mut F,
) -> Result<u64>
where
    F: FnMut(DownloadProgress) + Send,
{
    let response = client
        .get(&request.url, request.bearer_token.as_deref())
        .await?;

    if response.status == 401 {
        return Err(DownloadError::Unauthorized);
    }
    if !response.is_success() {
        return Err(DownloadError::Http {
            code: response.status,
            message: response.message,
        });
    }

    let total = response.content_length.filter(|&len| len > 0);
    let mut body = response.body.ok_or(DownloadError::EmptyBody)?;

    if let Some(parent) = request.destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(&request.destination).await?;

    let buffer_size = request.buffer_size.max(1);
    let mut block: Vec<u8> = Vec::with_capacity(buffer_size);
    let mut downloaded = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        let mut rest = chunk.as_slice();
        while !rest.is_empty() {
            let take = (buffer_size - block.len()).min(rest.len());
            block.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if block.len() == buffer_size {
                downloaded += write_block(&mut file, &mut block).await?;
                on_progress(DownloadProgress {
                    downloaded_bytes: downloaded,
                    total_bytes: total,
                });
            }
        }
    }
    if !block.is_empty() {
        downloaded += write_block(&mut file, &mut block).await?;
        on_progress(DownloadProgress {
            downloaded_bytes: downloaded,
            total_bytes: total,
        });
    }
    file.flush().await?;

    if downloaded == 0 {
        return Err(DownloadError::EmptyBody);
    }
    if let Some(total) = total {
        if downloaded < total {
            return Err(DownloadError::Network(format!(
                "connection closed after {downloaded} of {total} bytes"
            )));
        }
    }

    Ok(downloaded)
}

async fn write_block(file: &mut tokio::fs::File, block: &mut Vec<u8>) -> Result<u64> {
    file.write_all(block).await?;
    let written = block.len() as u64;
    block.clear();
    Ok(written)
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(error = %e, path = %path.display(), "Could not remove partial download"),
    }
}
