//! Export - persist the shown item at save quality

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::downloader::{self, DownloadJob, Transfer};
use crate::error::Result;
use crate::gallery::Gallery;
use crate::manager::{WorkerEvent, WorkerSender};
use crate::types::{ItemDescriptor, ReadyItem, TaskId, TaskKind};

/// Concurrent export transfers; view downloads are bounded by `cache_num` instead.
pub const EXPORT_WORKERS: usize = 4;

/// Where the exported bytes come from
#[derive(Debug)]
pub(crate) enum ExportSource {
    /// View and save tiers differ: fetch again at save tier
    Remote(DownloadJob),
    /// Same tier: reuse the bytes already in memory
    Local {
        id: TaskId,
        item: ReadyItem,
        token: CancellationToken,
    },
}

impl ExportSource {
    fn id(&self) -> TaskId {
        match self {
            ExportSource::Remote(job) => job.id,
            ExportSource::Local { id, .. } => *id,
        }
    }
}

/// `{pid}-{title} by {author}.{ext}`, with characters unsafe in file names replaced.
pub fn file_name(descriptor: &ItemDescriptor) -> String {
    let stem = format!("{}-{} by {}", descriptor.pid, descriptor.title, descriptor.author);
    let stem: String = stem
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let ext: String = descriptor
        .ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if ext.is_empty() {
        stem
    } else {
        format!("{}.{}", stem.trim_end_matches('.'), ext)
    }
}

pub async fn write(save_dir: &Path, item: &ReadyItem) -> Result<PathBuf> {
    tokio::fs::create_dir_all(save_dir).await?;
    let path = save_dir.join(file_name(&item.descriptor));
    tokio::fs::write(&path, &item.content).await?;
    Ok(path)
}

pub(crate) async fn run(
    gallery: Arc<dyn Gallery>,
    source: ExportSource,
    save_dir: PathBuf,
    slots: Arc<Semaphore>,
    events: WorkerSender,
) {
    let id = source.id();
    let event = match export(gallery.as_ref(), source, &save_dir, slots, &events).await {
        Ok(ExportEnd::Written(path)) => WorkerEvent::Exported { id, path },
        Ok(ExportEnd::Stopped { unavailable }) => WorkerEvent::Stopped { id, unavailable },
        Err(error) => WorkerEvent::Failed {
            id,
            kind: TaskKind::Export,
            error,
        },
    };
    let _ = events.send(event);
}

enum ExportEnd {
    Written(PathBuf),
    Stopped { unavailable: bool },
}

async fn export(
    gallery: &dyn Gallery,
    source: ExportSource,
    save_dir: &Path,
    slots: Arc<Semaphore>,
    events: &WorkerSender,
) -> Result<ExportEnd> {
    let item = match source {
        ExportSource::Local { item, token, .. } => {
            if token.is_cancelled() {
                return Ok(ExportEnd::Stopped { unavailable: false });
            }
            item
        }
        ExportSource::Remote(job) => {
            let _permit = tokio::select! {
                biased;
                _ = job.token.cancelled() => return Ok(ExportEnd::Stopped { unavailable: false }),
                permit = slots.acquire_owned() => permit
                    .map_err(|e| crate::Error::Channel(e.to_string()))?,
            };
            match downloader::transfer(gallery, &job, events).await? {
                Transfer::Complete(item) => item,
                Transfer::Stopped { unavailable } => return Ok(ExportEnd::Stopped { unavailable }),
            }
        }
    };

    let path = write(save_dir, &item).await?;
    log::info!("exported {} to {}", item.descriptor.pid, path.display());
    Ok(ExportEnd::Written(path))
}
