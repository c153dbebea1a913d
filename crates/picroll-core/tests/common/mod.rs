#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use picroll_core::{
    CacheHandle, ChunkStream, ContentResponse, CoreEvent, CoreSnapshot, ErrorEvent, ErrorKind, Gallery,
    ItemDescriptor, MetadataQuery, QualityTier, Result,
};
use tokio::sync::Notify;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn png() -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image::RgbaImage::new(2, 2)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

pub fn url(pid: u64, tier: QualityTier) -> String {
    format!("mem://{}/{}", pid, tier)
}

pub fn descriptor(pid: u64) -> ItemDescriptor {
    let urls: BTreeMap<QualityTier, String> = QualityTier::ALL
        .iter()
        .map(|tier| (*tier, url(pid, *tier)))
        .collect();
    ItemDescriptor {
        pid,
        title: format!("item {}", pid),
        author_id: 9,
        author: "tester".into(),
        tags: vec!["test".into()],
        urls,
        ext: "png".into(),
        ai_generated: false,
    }
}

pub fn batch(pids: std::ops::RangeInclusive<u64>) -> Vec<ItemDescriptor> {
    pids.map(descriptor).collect()
}

#[derive(Clone)]
pub enum Body {
    Image,
    /// First chunk arrives, then the stream never ends
    Stall,
    /// Image bytes are held back until the gate is notified
    Gated(Arc<Notify>),
    Missing,
    Garbage,
}

/// In-memory gallery with scripted metadata batches and per-URL bodies.
///
/// Once the script is exhausted, queries hang, so a finished script leaves the
/// fetcher idle instead of reporting an empty batch.
pub struct FakeGallery {
    batches: Mutex<VecDeque<Result<Vec<ItemDescriptor>>>>,
    bodies: Mutex<HashMap<String, Body>>,
    default_body: Body,
    pub queries: Mutex<Vec<MetadataQuery>>,
    pub opened: Mutex<Vec<String>>,
    pub open_count: AtomicUsize,
}

impl FakeGallery {
    pub fn new(batches: Vec<Vec<ItemDescriptor>>, default_body: Body) -> Self {
        Self {
            batches: Mutex::new(batches.into_iter().map(Ok).collect()),
            bodies: Mutex::new(HashMap::new()),
            default_body,
            queries: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
            open_count: AtomicUsize::new(0),
        }
    }

    pub fn push_batch(&self, batch: Result<Vec<ItemDescriptor>>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    pub fn set_body(&self, url: String, body: Body) {
        self.bodies.lock().unwrap().insert(url, body);
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    pub fn opens(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Gallery for FakeGallery {
    async fn query(&self, query: &MetadataQuery) -> Result<Vec<ItemDescriptor>> {
        self.queries.lock().unwrap().push(query.clone());
        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(batch) => batch,
            None => std::future::pending().await,
        }
    }

    async fn open(&self, url: &str) -> Result<ContentResponse> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        self.opened.lock().unwrap().push(url.to_string());
        let body = self
            .bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| self.default_body.clone());

        let image = png();
        let length = Some(image.len() as u64);
        let (content_length, chunks): (Option<u64>, ChunkStream) = match body {
            Body::Missing => return Ok(ContentResponse::NotFound),
            Body::Image => {
                let (a, b) = image.split_at(image.len() / 2);
                let chunks: Vec<Result<Vec<u8>>> = vec![Ok(a.to_vec()), Ok(b.to_vec())];
                (length, stream::iter(chunks).boxed())
            }
            Body::Stall => {
                let first = image[..8].to_vec();
                (
                    length,
                    stream::iter(vec![Ok(first)]).chain(stream::pending()).boxed(),
                )
            }
            Body::Gated(gate) => (
                length,
                stream::once(async move {
                    gate.notified().await;
                    Ok(image)
                })
                .boxed(),
            ),
            Body::Garbage => (
                Some(5),
                stream::iter(vec![Ok(b"junk!".to_vec())]).boxed(),
            ),
        };
        Ok(ContentResponse::Body {
            content_length,
            chunks,
        })
    }
}

/// Wait until the published snapshot satisfies `pred`.
pub async fn wait_for(
    handle: &CacheHandle,
    what: &str,
    pred: impl FnMut(&CoreSnapshot) -> bool,
) -> CoreSnapshot {
    let mut rx = handle.watch();
    let result = tokio::time::timeout(WAIT, rx.wait_for(pred)).await;
    match result {
        Ok(Ok(snapshot)) => snapshot.clone(),
        Ok(Err(_)) => panic!("manager stopped while waiting for {}", what),
        Err(_) => panic!(
            "timed out waiting for {}: {:?}",
            what,
            handle.snapshot().stats
        ),
    }
}

/// Receive core events until an error of `kind` shows up.
pub async fn next_error(
    events: &async_channel::Receiver<CoreEvent>,
    kind: ErrorKind,
) -> ErrorEvent {
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(CoreEvent::Error(event)) if event.kind == kind => return event,
                Ok(_) => continue,
                Err(_) => panic!("event channel closed"),
            }
        }
    })
    .await;
    found.unwrap_or_else(|_| panic!("no {:?} error event", kind))
}

pub fn current_pid(snapshot: &CoreSnapshot) -> Option<u64> {
    snapshot.current.as_ref().map(|item| item.descriptor.pid)
}
