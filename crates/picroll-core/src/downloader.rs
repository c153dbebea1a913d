//! Content downloader - streams one item at one quality tier

use std::io::Cursor;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::gallery::{ContentResponse, Gallery, REQUEST_TIMEOUT};
use crate::manager::{WorkerEvent, WorkerSender};
use crate::types::{ItemDescriptor, QualityTier, ReadyItem, TaskId, TaskKind};

/// One content transfer, owned by the task that runs it
#[derive(Debug, Clone)]
pub(crate) struct DownloadJob {
    pub id: TaskId,
    pub kind: TaskKind,
    pub descriptor: Arc<ItemDescriptor>,
    pub tier: QualityTier,
    pub token: CancellationToken,
}

/// How a transfer ended when it did not fail
#[derive(Debug)]
pub(crate) enum Transfer {
    Complete(ReadyItem),
    /// Cancelled, or gone upstream when `unavailable` is set
    Stopped { unavailable: bool },
}

/// Validate the payload and read its dimensions.
///
/// Only the header is parsed; the presentation layer decodes pixels itself.
pub fn decode(
    descriptor: Arc<ItemDescriptor>,
    tier: QualityTier,
    bytes: Vec<u8>,
) -> Result<ReadyItem> {
    if bytes.is_empty() {
        return Err(Error::Decode("empty body".into()));
    }

    let reader = image::ImageReader::new(Cursor::new(bytes.as_slice()))
        .with_guessed_format()
        .map_err(|e| Error::Decode(e.to_string()))?;
    let format = reader
        .format()
        .ok_or_else(|| Error::Decode("unrecognised image format".into()))?;
    let (width, height) = reader.into_dimensions()?;

    Ok(ReadyItem {
        descriptor,
        tier,
        content: Arc::from(bytes),
        format,
        width,
        height,
    })
}

fn percent(received: u64, total: Option<u64>) -> Option<f32> {
    match total {
        Some(total) if total > 0 => Some((received as f64 / total as f64 * 100.0).min(100.0) as f32),
        _ => None,
    }
}

/// Stream the job's content, reporting progress after every chunk.
pub(crate) async fn transfer(
    gallery: &dyn Gallery,
    job: &DownloadJob,
    events: &WorkerSender,
) -> Result<Transfer> {
    if job.token.is_cancelled() {
        return Ok(Transfer::Stopped { unavailable: false });
    }

    let url = job.descriptor.url_for(job.tier).ok_or_else(|| {
        Error::InvalidPayload(format!("item {} has no {} url", job.descriptor.pid, job.tier))
    })?;

    log::debug!("{} ({}) fetching {}", job.id, job.kind, url);

    let response = tokio::select! {
        biased;
        _ = job.token.cancelled() => return Ok(Transfer::Stopped { unavailable: false }),
        response = tokio::time::timeout(REQUEST_TIMEOUT, gallery.open(url)) => response
            .map_err(|_| Error::Network(format!("request to {} timed out", url)))??,
    };

    let (content_length, mut chunks) = match response {
        ContentResponse::NotFound => return Ok(Transfer::Stopped { unavailable: true }),
        ContentResponse::Body {
            content_length,
            chunks,
        } => (content_length, chunks),
    };

    let mut body = Vec::with_capacity(content_length.unwrap_or(0).min(32 * 1024 * 1024) as usize);

    loop {
        let next = tokio::select! {
            biased;
            _ = job.token.cancelled() => return Ok(Transfer::Stopped { unavailable: false }),
            next = tokio::time::timeout(REQUEST_TIMEOUT, chunks.next()) => next
                .map_err(|_| Error::Network("read timed out".into()))?,
        };

        match next {
            Some(chunk) => {
                body.extend_from_slice(&chunk?);
                if let Some(percent) = percent(body.len() as u64, content_length) {
                    let _ = events.send(WorkerEvent::Progress { id: job.id, percent });
                }
            }
            None => break,
        }
    }

    decode(job.descriptor.clone(), job.tier, body).map(Transfer::Complete)
}

/// Body of a view-tier download task.
pub(crate) async fn run_view(gallery: Arc<dyn Gallery>, job: DownloadJob, events: WorkerSender) {
    let event = match transfer(gallery.as_ref(), &job, &events).await {
        Ok(Transfer::Complete(item)) => WorkerEvent::Downloaded { id: job.id, item },
        Ok(Transfer::Stopped { unavailable }) => WorkerEvent::Stopped {
            id: job.id,
            unavailable,
        },
        Err(error) => WorkerEvent::Failed {
            id: job.id,
            kind: job.kind,
            error,
        },
    };
    let _ = events.send(event);
}
