//! RSS document parsing and post normalization.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use velsync_core::{FeedItem, PostDraft};

pub const CRATE_NAME: &str = "velsync-feed";

/// How much of the offending input a parse error carries for diagnostics.
const PARSE_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("malformed feed document: {message} (excerpt: {excerpt})")]
    Parse { message: String, excerpt: String },
    #[error("feed item missing required field `{field}`")]
    Validation { field: &'static str },
}

fn excerpt_of(input: &str) -> String {
    input.trim_start().chars().take(PARSE_EXCERPT_CHARS).collect()
}

// ---------------------------------------------------------------------------
// Feed parsing
// ---------------------------------------------------------------------------

/// Parse an RSS 2.0 document into [`FeedItem`]s, preserving document order.
///
/// Only a malformed document is fatal. Items lacking a title or link are
/// skipped with a warning; missing optional fields degrade to empty values.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedItem>, FeedError> {
    let channel = rss::Channel::read_from(xml.as_bytes()).map_err(|err| FeedError::Parse {
        message: err.to_string(),
        excerpt: excerpt_of(xml),
    })?;

    let mut items = Vec::with_capacity(channel.items().len());
    for item in channel.items() {
        match feed_item_from_rss(item) {
            Ok(feed_item) => items.push(feed_item),
            Err(err) => {
                warn!(%err, title = item.title().unwrap_or(""), "skipping feed item");
            }
        }
    }
    Ok(items)
}

fn feed_item_from_rss(item: &rss::Item) -> Result<FeedItem, FeedError> {
    let title = item
        .title()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(FeedError::Validation { field: "title" })?;
    let link = item
        .link()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or(FeedError::Validation { field: "link" })?;

    let categories = item
        .categories()
        .iter()
        .map(|c| c.name().trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    Ok(FeedItem {
        title: title.to_string(),
        link: link.to_string(),
        description: item.description().unwrap_or_default().to_string(),
        published_at: item.pub_date().unwrap_or_default().to_string(),
        categories,
    })
}

// ---------------------------------------------------------------------------
// Date formatting
// ---------------------------------------------------------------------------

const DATE_OUTPUT_FORMAT: &str = "%Y.%m.%d.";

fn parse_published(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    // Our own output format, which makes formatting idempotent.
    if let Ok(date) = NaiveDate::parse_from_str(raw, DATE_OUTPUT_FORMAT) {
        return Some(date);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

fn format_date(date: NaiveDate) -> String {
    format!(
        "{:04}.{:02}.{:02}.",
        date.year(),
        date.month(),
        date.day()
    )
}

/// Format a raw publish date as `YYYY.MM.DD.`.
///
/// Fails soft: an unparseable input substitutes today's date with a warning.
pub fn format_published_date(raw: &str) -> String {
    match parse_published(raw) {
        Some(date) => format_date(date),
        None => {
            warn!(raw, "unparseable publish date, substituting today");
            format_date(Utc::now().date_naive())
        }
    }
}

// ---------------------------------------------------------------------------
// Summary cleaning
// ---------------------------------------------------------------------------

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

/// The fixed entity table, decoded in this order.
const ENTITIES: &[(&str, &str)] = &[
    ("&nbsp;", " "),
    ("&amp;", "&"),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&apos;", "'"),
];

/// Strip HTML tags, decode entities, collapse whitespace runs, trim, and
/// truncate to `max_chars` characters (chars, not bytes; summaries are
/// often Korean).
pub fn clean_summary(html: &str, max_chars: usize) -> String {
    let mut text = TAG_RE.replace_all(html, " ").into_owned();
    for (entity, replacement) in ENTITIES {
        if text.contains(entity) {
            text = text.replace(entity, replacement);
        }
    }
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_chars).collect()
}

// ---------------------------------------------------------------------------
// Category rules
// ---------------------------------------------------------------------------

/// One keyword rule: the category applies when the lower-cased title
/// contains any of the keywords.
#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    pub contains_any: Vec<String>,
}

/// Ordered rule table; declaration order encodes priority and the first
/// matching rule wins. Ties are never resolved alphabetically.
#[derive(Debug, Clone)]
pub struct CategoryRules {
    rules: Vec<CategoryRule>,
    default_category: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRulesFile {
    #[allow(dead_code)]
    version: u32,
    default: String,
    #[serde(default)]
    rules: Vec<CategoryRule>,
}

impl Default for CategoryRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CategoryRules {
    /// The compiled-in table. Order matters: a title mentioning both React
    /// and TypeScript is a React post.
    pub fn builtin() -> Self {
        let rule = |category: &str, keywords: &[&str]| CategoryRule {
            category: category.to_string(),
            contains_any: keywords.iter().map(|k| k.to_string()).collect(),
        };
        Self {
            rules: vec![
                rule("React", &["react", "리액트"]),
                rule("TypeScript", &["typescript", "타입스크립트"]),
                rule("JavaScript", &["javascript", "자바스크립트"]),
                rule("Next.js", &["next.js", "nextjs"]),
                rule("CSS", &["css", "스타일링"]),
                rule("Testing", &["testing", "jest", "테스트"]),
                rule("Git", &["git", "깃허브"]),
            ],
            default_category: "Programming".to_string(),
        }
    }

    pub fn new(rules: Vec<CategoryRule>, default_category: impl Into<String>) -> Self {
        Self {
            rules,
            default_category: default_category.into(),
        }
    }

    /// Load an override table from a YAML rules file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: CategoryRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self {
            rules: file.rules,
            default_category: file.default,
        })
    }

    /// First matching rule wins; keywords match case-insensitively anywhere
    /// in the title.
    pub fn derive_category(&self, title: &str) -> &str {
        let haystack = title.to_lowercase();
        for rule in &self.rules {
            if rule
                .contains_any
                .iter()
                .any(|keyword| haystack.contains(&keyword.to_lowercase()))
            {
                return &rule.category;
            }
        }
        &self.default_category
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub summary_max_chars: usize,
    pub rules: CategoryRules,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            summary_max_chars: 200,
            rules: CategoryRules::builtin(),
        }
    }
}

/// Tag set: the derived category first, then the feed's own categories,
/// deduplicated preserving first occurrence.
fn derive_tags(category: &str, feed_categories: &[String]) -> Vec<String> {
    let mut tags = vec![category.to_string()];
    for raw in feed_categories {
        if !tags.iter().any(|t| t == raw) {
            tags.push(raw.clone());
        }
    }
    tags
}

/// Map a parsed feed item into an unsaved [`PostDraft`].
///
/// Every step is total: unparseable dates and messy HTML degrade instead
/// of failing, so normalization itself cannot fail.
pub fn normalize(item: &FeedItem, options: &NormalizeOptions) -> PostDraft {
    let category = options.rules.derive_category(&item.title).to_string();
    let tags = derive_tags(&category, &item.categories);
    PostDraft {
        title: item.title.clone(),
        url: item.link.clone(),
        summary: clean_summary(&item.description, options.summary_max_chars),
        category,
        date: format_published_date(&item.published_at),
        tags,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
