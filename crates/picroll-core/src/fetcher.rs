//! Metadata fetcher - pulls descriptor batches until the pending queue is full

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::gallery::{Gallery, MetadataQuery};
use crate::manager::{WorkerEvent, WorkerSender};
use crate::types::{Settings, TaskId};

/// Pause between two queries of one run.
pub const FETCH_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub(crate) struct FetchJob {
    pub id: TaskId,
    pub settings: Arc<Settings>,
    /// Pending queue length when the run started
    pub pending: usize,
    pub token: CancellationToken,
}

/// Why a fetcher run ended
#[derive(Debug)]
pub enum FetchOutcome {
    /// The pending queue reached `cache_num`
    Filled,
    /// The gallery returned an empty batch
    NoMatchingItems,
    /// Transport or payload failure; the next trigger may retry
    Failed(Error),
    Cancelled,
}

pub(crate) async fn run(gallery: Arc<dyn Gallery>, job: FetchJob, events: WorkerSender) {
    log::info!("{} fetching metadata (pending {})", job.id, job.pending);
    let outcome = fetch_until_filled(gallery.as_ref(), &job, &events).await;
    log::info!("{} metadata fetch finished: {:?}", job.id, outcome);
    let _ = events.send(WorkerEvent::FetchDone { id: job.id, outcome });
}

async fn fetch_until_filled(
    gallery: &dyn Gallery,
    job: &FetchJob,
    events: &WorkerSender,
) -> FetchOutcome {
    let query = MetadataQuery::from_settings(&job.settings);
    let mut pending = job.pending;

    while pending < job.settings.cache_num {
        let batch = tokio::select! {
            biased;
            _ = job.token.cancelled() => return FetchOutcome::Cancelled,
            batch = gallery.query(&query) => batch,
        };

        let mut items = match batch {
            Ok(items) => items,
            Err(e) => return FetchOutcome::Failed(e),
        };
        if job.settings.exclude_ai {
            items.retain(|item| !item.ai_generated);
        }
        if items.is_empty() {
            return FetchOutcome::NoMatchingItems;
        }

        log::debug!("{} received {} descriptors", job.id, items.len());

        let (ack, acked) = oneshot::channel();
        if events
            .send(WorkerEvent::Batch {
                id: job.id,
                items,
                ack,
            })
            .is_err()
        {
            return FetchOutcome::Cancelled;
        }
        pending = match acked.await {
            Ok(pending) => pending,
            Err(_) => return FetchOutcome::Cancelled,
        };

        if pending >= job.settings.cache_num {
            break;
        }

        tokio::select! {
            biased;
            _ = job.token.cancelled() => return FetchOutcome::Cancelled,
            _ = tokio::time::sleep(FETCH_PAUSE) => {}
        }
    }

    FetchOutcome::Filled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::ContentResponse;
    use crate::types::ItemDescriptor;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct Batches {
        size: usize,
        ai: bool,
        calls: AtomicUsize,
        fail: bool,
    }

    impl Batches {
        fn new(size: usize) -> Self {
            Self {
                size,
                ai: false,
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Gallery for Batches {
        async fn query(&self, _query: &MetadataQuery) -> crate::Result<Vec<ItemDescriptor>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
            if self.fail {
                return Err(Error::Network("connection refused".into()));
            }
            Ok((0..self.size as u64)
                .map(|n| ItemDescriptor {
                    pid: call * 100 + n,
                    title: String::new(),
                    author_id: 0,
                    author: String::new(),
                    tags: vec![],
                    urls: BTreeMap::new(),
                    ext: "png".into(),
                    ai_generated: self.ai,
                })
                .collect())
        }

        async fn open(&self, _url: &str) -> crate::Result<ContentResponse> {
            Ok(ContentResponse::NotFound)
        }
    }

    fn job(cache_num: usize, exclude_ai: bool) -> FetchJob {
        FetchJob {
            id: TaskId(1),
            settings: Arc::new(Settings {
                cache_num,
                exclude_ai,
                ..Settings::default()
            }),
            pending: 0,
            token: CancellationToken::new(),
        }
    }

    /// Acknowledge batches the way the manager does: pending grows by batch size.
    async fn drive(gallery: Arc<Batches>, job: FetchJob) -> (FetchOutcome, usize) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(run(gallery, job, tx));
        let mut pending = 0;
        loop {
            match rx.recv().await {
                Some(WorkerEvent::Batch { items, ack, .. }) => {
                    pending += items.len();
                    let _ = ack.send(pending);
                }
                Some(WorkerEvent::FetchDone { outcome, .. }) => return (outcome, pending),
                Some(_) => {}
                None => panic!("fetcher vanished"),
            }
        }
    }

    #[tokio::test]
    async fn test_stops_once_filled() {
        let gallery = Arc::new(Batches::new(3));
        let (outcome, pending) = drive(gallery.clone(), job(5, false)).await;
        assert!(matches!(outcome, FetchOutcome::Filled));
        assert_eq!(pending, 6);
        assert_eq!(gallery.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_means_no_match() {
        let gallery = Arc::new(Batches::new(0));
        let (outcome, pending) = drive(gallery, job(5, false)).await;
        assert!(matches!(outcome, FetchOutcome::NoMatchingItems));
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_all_machine_generated_filtered() {
        let gallery = Arc::new(Batches {
            ai: true,
            ..Batches::new(4)
        });
        let (outcome, _) = drive(gallery, job(5, true)).await;
        assert!(matches!(outcome, FetchOutcome::NoMatchingItems));
    }

    #[tokio::test]
    async fn test_network_failure_ends_run() {
        let gallery = Arc::new(Batches {
            fail: true,
            ..Batches::new(4)
        });
        let (outcome, _) = drive(gallery.clone(), job(5, false)).await;
        assert!(matches!(outcome, FetchOutcome::Failed(Error::Network(_))));
        assert_eq!(gallery.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_full_does_nothing() {
        let gallery = Arc::new(Batches::new(4));
        let mut job = job(2, false);
        job.pending = 2;
        let (outcome, _) = drive(gallery.clone(), job).await;
        assert!(matches!(outcome, FetchOutcome::Filled));
        assert_eq!(gallery.calls.load(Ordering::SeqCst), 0);
    }
}
