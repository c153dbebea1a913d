//! Types module - data structures for picroll
//!
//! These types define the data model shared by the fetcher, the downloaders,
//! the cache manager and whatever frontend polls the core.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ErrorEvent;
use crate::registry::ProgressSnapshot;

/// Upper bound for `cache_num` and `keep_num`.
pub const MAX_QUEUE_SETTING: usize = 19;

/// Quality tiers exposed by the gallery, lowest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Mini,
    Thumb,
    #[default]
    Small,
    Regular,
    Original,
}

impl QualityTier {
    pub const ALL: [QualityTier; 5] = [
        QualityTier::Original,
        QualityTier::Regular,
        QualityTier::Small,
        QualityTier::Thumb,
        QualityTier::Mini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Mini => "mini",
            QualityTier::Thumb => "thumb",
            QualityTier::Small => "small",
            QualityTier::Regular => "regular",
            QualityTier::Original => "original",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mini" => Ok(QualityTier::Mini),
            "thumb" => Ok(QualityTier::Thumb),
            "small" => Ok(QualityTier::Small),
            "regular" => Ok(QualityTier::Regular),
            "original" => Ok(QualityTier::Original),
            other => Err(format!("unknown quality tier: {}", other)),
        }
    }
}

/// Explicit-content policy sent with every metadata query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExplicitPolicy {
    #[default]
    Off,
    On,
    Random,
}

impl ExplicitPolicy {
    /// Wire value understood by the gallery API.
    pub fn as_wire(&self) -> u8 {
        match self {
            ExplicitPolicy::Off => 0,
            ExplicitPolicy::On => 1,
            ExplicitPolicy::Random => 2,
        }
    }
}

/// Tag filter: a list of OR-groups, combined with AND.
///
/// `[["cat", "dog"], ["white"]]` matches items tagged (cat OR dog) AND white.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct TagFilter(pub Vec<Vec<String>>);

impl TagFilter {
    pub fn new(groups: Vec<Vec<String>>) -> Self {
        Self(groups)
    }

    /// Encode as the API expects: one `a|b|c` string per OR-group.
    pub fn to_query(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|t| t.trim())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join("|")
            })
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Descriptor of one gallery item, as returned by a metadata query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub pid: u64,
    pub title: String,
    pub author_id: u64,
    pub author: String,
    pub tags: Vec<String>,
    pub urls: BTreeMap<QualityTier, String>,
    pub ext: String,
    /// Marked as machine-generated by the gallery
    pub ai_generated: bool,
}

impl ItemDescriptor {
    pub fn url_for(&self, tier: QualityTier) -> Option<&str> {
        self.urls.get(&tier).map(String::as_str)
    }
}

/// Unique id of a background task. Allocated by the cache manager, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// What a content download is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Fetch at view quality into the ready queue
    View,
    /// Fetch at save quality and write to disk
    Export,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::View => write!(f, "view"),
            TaskKind::Export => write!(f, "export"),
        }
    }
}

/// Target of a cancellation broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCategory {
    View,
    Export,
    All,
}

impl CancelCategory {
    pub fn matches(&self, kind: TaskKind) -> bool {
        match self {
            CancelCategory::All => true,
            CancelCategory::View => kind == TaskKind::View,
            CancelCategory::Export => kind == TaskKind::Export,
        }
    }
}

/// A fully downloaded, header-validated item.
///
/// Cloning is cheap: the descriptor and the bytes are shared.
#[derive(Debug, Clone)]
pub struct ReadyItem {
    pub descriptor: Arc<ItemDescriptor>,
    /// Tier the bytes were fetched at
    pub tier: QualityTier,
    pub content: Arc<[u8]>,
    pub format: image::ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Configuration snapshot consumed by the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Desired ready + in-flight item count
    pub cache_num: usize,
    /// History depth kept for backward navigation
    pub keep_num: usize,
    pub view_quality: QualityTier,
    pub save_quality: QualityTier,
    pub save_dir: PathBuf,
    pub tags: TagFilter,
    pub explicit: ExplicitPolicy,
    pub exclude_ai: bool,
    /// Read by the presentation layer only
    pub suppress_warnings: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let save_dir = dirs::download_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join("Downloads"))
            .join("picroll");

        Self {
            cache_num: 5,
            keep_num: 5,
            view_quality: QualityTier::Small,
            save_quality: QualityTier::Original,
            save_dir,
            tags: TagFilter::default(),
            explicit: ExplicitPolicy::Off,
            exclude_ai: false,
            suppress_warnings: false,
        }
    }
}

impl Settings {
    /// Parse a settings document; absent fields take their defaults.
    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        let settings: Settings = serde_json::from_str(json)?;
        Ok(settings.validated())
    }

    /// Clamp numeric fields into their supported range.
    pub fn validated(mut self) -> Self {
        if self.cache_num > MAX_QUEUE_SETTING {
            log::warn!(
                "cache_num {} out of range, clamping to {}",
                self.cache_num,
                MAX_QUEUE_SETTING
            );
            self.cache_num = MAX_QUEUE_SETTING;
        }
        if self.keep_num > MAX_QUEUE_SETTING {
            log::warn!(
                "keep_num {} out of range, clamping to {}",
                self.keep_num,
                MAX_QUEUE_SETTING
            );
            self.keep_num = MAX_QUEUE_SETTING;
        }
        self
    }

    /// True when switching from `self` to `next` changes what the gallery returns.
    pub fn changes_query(&self, next: &Settings) -> bool {
        self.tags != next.tags || self.explicit != next.explicit || self.exclude_ai != next.exclude_ai
    }
}

/// Queue occupancy, published with every snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// `cache_num` of the settings in force
    pub capacity: usize,
    pub pending: usize,
    pub ready: usize,
    pub in_flight_view: usize,
    pub in_flight_export: usize,
    pub history_len: usize,
    pub history_index: usize,
    pub fetching: bool,
}

/// Everything the presentation layer polls
#[derive(Debug, Clone, Default)]
pub struct CoreSnapshot {
    pub current: Option<ReadyItem>,
    pub progress: ProgressSnapshot,
    pub last_error: Option<ErrorEvent>,
    pub stats: QueueStats,
}
