//! Core domain model for the velsync pipeline.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "velsync-core";

/// A single entry extracted from the RSS document, before normalization.
///
/// Transient: lives only within one pipeline run. The parser guarantees
/// `title` and `link` are non-empty; items violating that are dropped at
/// parse time rather than surfacing here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    /// Raw HTML from `<description>`; empty when absent.
    pub description: String,
    /// Raw `<pubDate>` text, not yet parsed; empty when absent.
    pub published_at: String,
    /// `<category>` child values in document order, trimmed, empties dropped.
    pub categories: Vec<String>,
}

/// Normalized handoff contract from the feed normalizer into merge.
///
/// Identical to [`Post`] minus the identity fields: the id is allocated by
/// merge, and `postType` is a fixed label the store writes out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDraft {
    pub title: String,
    /// Dedupe key against the persisted collection.
    pub url: String,
    /// HTML-stripped, entity-decoded, whitespace-collapsed, length-capped.
    pub summary: String,
    pub category: String,
    /// Fixed `YYYY.MM.DD.` format.
    pub date: String,
    /// Derived category first, then the feed's own categories, deduplicated
    /// preserving first occurrence.
    pub tags: Vec<String>,
}

/// Label the generated module records for every synced post.
pub const POST_TYPE_VELOG: &str = "velog";

/// Canonical persisted post record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Unique across the whole persisted collection; never reassigned or
    /// reused within a run.
    pub id: u32,
    pub title: String,
    pub url: String,
    pub summary: String,
    pub category: String,
    pub date: String,
    pub post_type: String,
    pub tags: Vec<String>,
}

impl Post {
    pub fn from_draft(id: u32, draft: PostDraft) -> Self {
        Self {
            id,
            title: draft.title,
            url: draft.url,
            summary: draft.summary,
            category: draft.category,
            date: draft.date,
            post_type: POST_TYPE_VELOG.to_string(),
            tags: draft.tags,
        }
    }
}

/// The set of post ids already in use during one sync invocation.
///
/// Owned state, constructor-injected into merge: the registry lives exactly
/// as long as one run and must not be shared across concurrent invocations.
/// Nothing here persists beyond what merge bakes into the output file.
#[derive(Debug, Default, Clone)]
pub struct IdRegistry {
    used: HashSet<u32>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry from the ids already present in the store.
    pub fn from_ids(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            used: ids.into_iter().collect(),
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.used.contains(&id)
    }

    /// Highest registered id, or `None` when the registry is empty.
    pub fn max_id(&self) -> Option<u32> {
        self.used.iter().copied().max()
    }

    /// Allocate a fresh unique id.
    ///
    /// Uses `suggested` directly when it is free; otherwise probes linearly
    /// upward from `max(suggested, 1)` until an unused id is found. The
    /// returned id is registered before this method returns, so repeated
    /// calls never hand out the same id twice.
    pub fn allocate(&mut self, suggested: Option<u32>) -> u32 {
        let start = suggested.unwrap_or(1).max(1);
        let mut candidate = start;
        while self.used.contains(&candidate) {
            candidate += 1;
        }
        self.used.insert(candidate);
        candidate
    }
}
