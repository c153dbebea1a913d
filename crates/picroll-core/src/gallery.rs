//! Remote gallery access
//!
//! [`Gallery`] is the seam between the pipeline and the network. The
//! production implementation, [`HttpGallery`], talks to a lolicon-style
//! `setu/v2` API with reqwest.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ExplicitPolicy, ItemDescriptor, QualityTier, Settings};

pub const DEFAULT_API_BASE: &str = "https://api.lolicon.app";

/// Connect timeout and per-chunk read timeout applied by every worker.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Descriptors requested per metadata query.
pub const BATCH_SIZE: usize = 20;

const USER_AGENT: &str = concat!("picroll/", env!("CARGO_PKG_VERSION"));

/// Parameters of one metadata query
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataQuery {
    pub explicit: ExplicitPolicy,
    pub num: usize,
    /// AND of OR-groups, each group encoded as `a|b|c`
    pub tags: Vec<String>,
    pub tiers: Vec<QualityTier>,
    pub exclude_ai: bool,
}

impl MetadataQuery {
    /// Build a query for every tier, so switching tiers later needs no re-query.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            explicit: settings.explicit,
            num: BATCH_SIZE,
            tags: settings.tags.to_query(),
            tiers: QualityTier::ALL.to_vec(),
            exclude_ai: settings.exclude_ai,
        }
    }
}

/// Body chunks of one content transfer
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>>>;

/// Outcome of opening a content URL
pub enum ContentResponse {
    /// HTTP 404: the asset is gone
    NotFound,
    Body {
        content_length: Option<u64>,
        chunks: ChunkStream,
    },
}

#[async_trait]
pub trait Gallery: Send + Sync {
    /// Fetch one batch of item descriptors.
    async fn query(&self, query: &MetadataQuery) -> Result<Vec<ItemDescriptor>>;

    /// Start a streaming fetch of one content URL.
    async fn open(&self, url: &str) -> Result<ContentResponse>;
}

#[derive(Debug, Serialize)]
struct SetuRequest<'a> {
    r18: u8,
    num: usize,
    tag: &'a [String],
    size: Vec<&'static str>,
    #[serde(rename = "excludeAI")]
    exclude_ai: bool,
}

#[derive(Debug, Deserialize)]
struct SetuResponse {
    #[serde(default)]
    error: String,
    data: Vec<SetuItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetuItem {
    pid: u64,
    title: String,
    uid: u64,
    author: String,
    tags: Vec<String>,
    ext: String,
    ai_type: u8,
    urls: BTreeMap<String, String>,
}

impl TryFrom<SetuItem> for ItemDescriptor {
    type Error = Error;

    fn try_from(item: SetuItem) -> Result<Self> {
        let urls: BTreeMap<QualityTier, String> = item
            .urls
            .into_iter()
            .filter_map(|(tier, url)| tier.parse::<QualityTier>().ok().map(|t| (t, url)))
            .collect();

        if urls.is_empty() {
            return Err(Error::InvalidPayload(format!(
                "item {} carries no usable urls",
                item.pid
            )));
        }

        Ok(ItemDescriptor {
            pid: item.pid,
            title: item.title,
            author_id: item.uid,
            author: item.author,
            tags: item.tags,
            urls,
            ext: item.ext,
            ai_generated: item.ai_type == 2,
        })
    }
}

fn parse_setu_response(body: &str) -> Result<Vec<ItemDescriptor>> {
    let response: SetuResponse =
        serde_json::from_str(body).map_err(|e| Error::InvalidPayload(e.to_string()))?;

    if !response.error.is_empty() {
        return Err(Error::InvalidPayload(response.error));
    }

    response.data.into_iter().map(ItemDescriptor::try_from).collect()
}

/// reqwest-backed gallery client
#[derive(Debug, Clone)]
pub struct HttpGallery {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGallery {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_API_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Gallery for HttpGallery {
    async fn query(&self, query: &MetadataQuery) -> Result<Vec<ItemDescriptor>> {
        let body = SetuRequest {
            r18: query.explicit.as_wire(),
            num: query.num,
            tag: &query.tags,
            size: query.tiers.iter().map(QualityTier::as_str).collect(),
            exclude_ai: query.exclude_ai,
        };

        let response = self
            .client
            .post(format!("{}/setu/v2", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Http(response.status().as_u16()));
        }

        let text = response.text().await?;
        parse_setu_response(&text)
    }

    async fn open(&self, url: &str) -> Result<ContentResponse> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(ContentResponse::NotFound);
        }
        if !status.is_success() {
            return Err(Error::Http(status.as_u16()));
        }

        let content_length = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from))
            .boxed();

        Ok(ContentResponse::Body {
            content_length,
            chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TagFilter;

    const SAMPLE: &str = r#"{
        "error": "",
        "data": [{
            "pid": 101, "p": 0, "uid": 7, "title": "sunset", "author": "kei",
            "r18": false, "width": 800, "height": 600,
            "tags": ["sky", "orange"], "ext": "jpg", "aiType": 2,
            "uploadDate": 1700000000000,
            "urls": {"original": "https://i.example/o.jpg", "small": "https://i.example/s.jpg", "huge": "x"}
        }]
    }"#;

    #[test]
    fn test_parse_response() {
        let items = parse_setu_response(SAMPLE).unwrap();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.pid, 101);
        assert_eq!(item.author_id, 7);
        assert!(item.ai_generated);
        assert_eq!(item.urls.len(), 2);
        assert_eq!(item.url_for(QualityTier::Small), Some("https://i.example/s.jpg"));
        assert_eq!(item.url_for(QualityTier::Mini), None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            parse_setu_response(r#"{"error": "bad tag", "data": []}"#),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            parse_setu_response(r#"{"data": [{"pid": 1}]}"#),
            Err(Error::InvalidPayload(_))
        ));
        assert!(parse_setu_response(r#"{"error": "", "data": []}"#).unwrap().is_empty());
    }

    #[test]
    fn test_query_from_settings() {
        let settings = Settings {
            tags: TagFilter::new(vec![vec!["a".into(), "b".into()], vec!["c".into()]]),
            explicit: ExplicitPolicy::Random,
            exclude_ai: true,
            ..Settings::default()
        };
        let query = MetadataQuery::from_settings(&settings);
        assert_eq!(query.num, BATCH_SIZE);
        assert_eq!(query.tags, vec!["a|b".to_string(), "c".to_string()]);
        assert_eq!(query.tiers.len(), 5);

        let body = SetuRequest {
            r18: query.explicit.as_wire(),
            num: query.num,
            tag: &query.tags,
            size: query.tiers.iter().map(QualityTier::as_str).collect(),
            exclude_ai: query.exclude_ai,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["r18"], 2);
        assert_eq!(json["excludeAI"], true);
        assert_eq!(json["size"][0], "original");
    }
}
