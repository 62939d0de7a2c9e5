//! Merge, persistence, and pipeline orchestration.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use velsync_core::{IdRegistry, Post, PostDraft};
use velsync_feed::{normalize, parse_feed, CategoryRules, NormalizeOptions};
use velsync_fetch::{FeedFetcher, FetchConfig, RetryPolicy};

pub const CRATE_NAME: &str = "velsync-sync";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime configuration, environment variables with compiled-in defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub feed_url: String,
    pub proxy_url: String,
    /// The generated TypeScript data module: read-back source of truth and
    /// write target.
    pub posts_file: PathBuf,
    /// Optional YAML override for the category rule table.
    pub rules_file: Option<PathBuf>,
    pub summary_max_chars: usize,
    pub max_new_posts: usize,
    pub max_attempts: usize,
    pub retry_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            feed_url: std::env::var("VELSYNC_FEED_URL")
                .unwrap_or_else(|_| "https://v2.velog.io/rss/@velsync".to_string()),
            proxy_url: std::env::var("VELSYNC_PROXY_URL")
                .unwrap_or_else(|_| "https://api.allorigins.win/get".to_string()),
            posts_file: std::env::var("VELSYNC_POSTS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("web/src/data/blogPosts.ts")),
            rules_file: std::env::var("VELSYNC_RULES_FILE").ok().map(PathBuf::from),
            summary_max_chars: env_parsed("VELSYNC_SUMMARY_MAX_CHARS", 200),
            max_new_posts: env_parsed("VELSYNC_MAX_NEW_POSTS", 20),
            max_attempts: env_parsed("VELSYNC_MAX_ATTEMPTS", 3),
            retry_delay_ms: env_parsed("VELSYNC_RETRY_DELAY_MS", 1000),
            http_timeout_secs: env_parsed("VELSYNC_HTTP_TIMEOUT_SECS", 20),
            user_agent: std::env::var("VELSYNC_USER_AGENT")
                .unwrap_or_else(|_| "velsync/0.1".to_string()),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Post store: the generated TypeScript module
// ---------------------------------------------------------------------------

const MODULE_HEADER: &str = "\
// AUTO-GENERATED by velsync. Do not edit by hand.\n\
// Posts are kept sorted by id, newest (highest id) first.\n\
import { createPost } from './postFactory';\n\
\n\
export const blogPosts = [\n";

const MODULE_FOOTER: &str = "];\n";

// The module is scanned textually on read-back; entries must only ever be
// produced by `render_post` so the write/read round-trip stays byte-stable.
// Every scanner below is anchored to the rendered line shape: `escape_ts`
// never leaves a raw newline inside a quoted string, so summaries containing
// code text like `})` or `tags: [` cannot fake an anchor.
static ENTRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)createPost\(\{\n(.*?)\n  \}\),\n").expect("valid entry regex")
});
static ENTRY_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^  createPost\(\{$").expect("valid entry-open regex"));
static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"id:\s*(\d+)").expect("valid id regex"));
static ID_FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^    id: (\d+),$").expect("valid id field regex"));
static STRING_FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^    (\w+): '((?:[^'\\]|\\.)*)',$").expect("valid field regex")
});
static TAGS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^    tags: \[(.*)\],$").expect("valid tags regex"));
static QUOTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'((?:[^'\\]|\\.)*)'").expect("valid quoted regex"));

fn escape_ts(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(ch),
        }
    }
    out
}

fn unescape_ts(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(ch);
        }
    }
    out
}

fn render_post(post: &Post) -> String {
    let tags = post
        .tags
        .iter()
        .map(|t| format!("'{}'", escape_ts(t)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "  createPost({{\n    id: {},\n    title: '{}',\n    customDate: '{}',\n    url: '{}',\n    summary: '{}',\n    category: '{}',\n    postType: '{}',\n    tags: [{}],\n  }}),\n",
        post.id,
        escape_ts(&post.title),
        escape_ts(&post.date),
        escape_ts(&post.url),
        escape_ts(&post.summary),
        escape_ts(&post.category),
        escape_ts(&post.post_type),
        tags,
    )
}

/// Render the full module text for a post list.
pub fn render_module(posts: &[Post]) -> String {
    let mut out = String::from(MODULE_HEADER);
    for post in posts {
        out.push_str(&render_post(post));
    }
    out.push_str(MODULE_FOOTER);
    out
}

fn parse_entry(body: &str) -> Result<Post> {
    let id: u32 = ID_FIELD_RE
        .captures(body)
        .context("store entry missing `id`")?[1]
        .parse()
        .context("store entry has a non-numeric id")?;

    let mut fields: HashMap<String, String> = HashMap::new();
    for cap in STRING_FIELD_RE.captures_iter(body) {
        fields.insert(cap[1].to_string(), unescape_ts(&cap[2]));
    }
    let mut take = |name: &str| {
        fields
            .remove(name)
            .with_context(|| format!("store entry missing `{name}`"))
    };

    let title = take("title")?;
    let date = take("customDate")?;
    let url = take("url")?;
    let summary = take("summary")?;
    let category = take("category")?;
    let post_type = take("postType")?;

    let tags_body = TAGS_RE.captures(body).context("store entry missing `tags`")?;
    let tags = QUOTED_RE
        .captures_iter(&tags_body[1])
        .map(|cap| unescape_ts(&cap[1]))
        .collect();

    Ok(Post {
        id,
        title,
        url,
        summary,
        category,
        date,
        post_type,
        tags,
    })
}

fn parse_module(text: &str) -> Result<Vec<Post>> {
    if !text.contains("export const blogPosts") {
        bail!("posts file is not a generated blogPosts module");
    }

    let mut posts = Vec::new();
    for cap in ENTRY_RE.captures_iter(text) {
        posts.push(parse_entry(&cap[1])?);
    }

    // A partial read would make merge treat the missing posts as new and
    // duplicate them on the next run, so refuse it outright.
    let constructor_calls = ENTRY_OPEN_RE.find_iter(text).count();
    if posts.len() != constructor_calls {
        bail!(
            "parsed {} of {} store entries, refusing a partial read",
            posts.len(),
            constructor_calls
        );
    }
    Ok(posts)
}

/// Posts and ids recovered from the store file at the start of a run.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub posts: Vec<Post>,
    /// Every `id:` occurrence in the raw module text, which may include ids
    /// from hand-edited leftovers that no longer parse as full entries.
    pub used_ids: Vec<u32>,
}

/// Reads and rewrites the generated posts module.
#[derive(Debug, Clone)]
pub struct PostStore {
    path: PathBuf,
}

impl PostStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load the persisted posts.
    ///
    /// A missing file is the normal first-run case and yields an empty
    /// snapshot. A file that exists but cannot be parsed is a hard error:
    /// silently treating it as empty would re-import the entire feed as new.
    pub async fn load(&self) -> Result<StoreSnapshot> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))?
        {
            info!(path = %self.path.display(), "posts file absent, starting empty");
            return Ok(StoreSnapshot {
                posts: Vec::new(),
                used_ids: Vec::new(),
            });
        }

        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let posts =
            parse_module(&text).with_context(|| format!("parsing {}", self.path.display()))?;
        let used_ids = ID_RE
            .captures_iter(&text)
            .filter_map(|cap| cap[1].parse().ok())
            .collect();
        Ok(StoreSnapshot { posts, used_ids })
    }

    /// Rewrite the full module atomically (temp file + rename).
    pub async fn write(&self, posts: &[Post]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        let temp_path = self.path.with_extension(format!("tmp.{}", std::process::id()));
        let rendered = render_module(posts);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp posts file {}", temp_path.display()))?;
        file.write_all(rendered.as_bytes())
            .await
            .with_context(|| format!("writing temp posts file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp posts file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming {} -> {}",
                        temp_path.display(),
                        self.path.display()
                    )
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Full collection, sorted by id descending.
    pub posts: Vec<Post>,
    pub new_count: usize,
}

/// Merge normalized drafts into the existing collection.
///
/// A draft is new iff no existing post (and no earlier draft in the same
/// batch) shares its URL. New posts get fresh ids probed upward from one
/// past the highest registered id, so the descending sort puts them first.
/// At most `max_new` drafts are admitted per run.
pub fn merge_posts(
    existing: &[Post],
    drafts: Vec<PostDraft>,
    registry: &mut IdRegistry,
    max_new: usize,
) -> MergeOutcome {
    let mut known_urls: HashSet<String> = existing.iter().map(|p| p.url.clone()).collect();
    let suggested = registry.max_id().map(|max| max + 1);

    let mut merged = existing.to_vec();
    let mut new_count = 0;

    for draft in drafts {
        if known_urls.contains(&draft.url) {
            debug!(url = %draft.url, "already persisted, skipping");
            continue;
        }
        if new_count >= max_new {
            warn!(max_new, "max posts per sync reached, deferring the rest");
            break;
        }
        let id = registry.allocate(suggested);
        known_urls.insert(draft.url.clone());
        info!(id, title = %draft.title, "admitting new post");
        merged.push(Post::from_draft(id, draft));
        new_count += 1;
    }

    merged.sort_by(|a, b| b.id.cmp(&a.id));
    MergeOutcome {
        posts: merged,
        new_count,
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub existing_posts: usize,
    pub fetched_items: usize,
    pub new_posts: usize,
    pub wrote_file: bool,
}

/// One sync invocation end to end: load -> fetch -> parse -> normalize ->
/// merge -> write. Single-writer by design; never run two concurrently
/// against the same posts file.
pub struct SyncPipeline {
    config: SyncConfig,
    fetcher: FeedFetcher,
    options: NormalizeOptions,
    store: PostStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let rules = match &config.rules_file {
            Some(path) => CategoryRules::from_yaml_file(path)?,
            None => CategoryRules::builtin(),
        };
        let fetcher = FeedFetcher::new(FetchConfig {
            proxy_url: config.proxy_url.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                delay: Duration::from_millis(config.retry_delay_ms),
            },
        })?;
        let options = NormalizeOptions {
            summary_max_chars: config.summary_max_chars,
            rules,
        };
        let store = PostStore::new(config.posts_file.clone());
        Ok(Self {
            config,
            fetcher,
            options,
            store,
        })
    }

    async fn fetch_drafts(&self) -> Result<Vec<PostDraft>> {
        let xml = self
            .fetcher
            .fetch_feed(&self.config.feed_url)
            .await
            .with_context(|| format!("fetching {}", self.config.feed_url))?;
        let items = parse_feed(&xml)?;
        debug!(items = items.len(), "parsed feed");
        Ok(items
            .iter()
            .map(|item| normalize(item, &self.options))
            .collect())
    }

    /// Run the sync once. The store file is rewritten only when at least one
    /// new post was admitted; an unchanged feed leaves it untouched.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let snapshot = self.store.load().await?;
        info!(existing = snapshot.posts.len(), "loaded persisted posts");

        let drafts = self.fetch_drafts().await?;
        let fetched_items = drafts.len();

        let mut registry = IdRegistry::from_ids(snapshot.used_ids.iter().copied());
        let outcome = merge_posts(
            &snapshot.posts,
            drafts,
            &mut registry,
            self.config.max_new_posts,
        );

        let wrote_file = outcome.new_count > 0;
        if wrote_file {
            self.store
                .write(&outcome.posts)
                .await
                .context("persisting merged posts")?;
        } else {
            info!("no new posts, store left untouched");
        }

        let summary = SyncRunSummary {
            existing_posts: snapshot.posts.len(),
            fetched_items,
            new_posts: outcome.new_count,
            wrote_file,
        };
        info!(
            existing = summary.existing_posts,
            fetched = summary.fetched_items,
            new = summary.new_posts,
            "sync run complete"
        );
        Ok(summary)
    }

    /// Fetch and report the would-be-new posts without touching the store.
    pub async fn preview(&self) -> Result<Vec<PostDraft>> {
        let snapshot = self.store.load().await?;
        let known_urls: HashSet<&str> = snapshot.posts.iter().map(|p| p.url.as_str()).collect();

        let mut seen = HashSet::new();
        Ok(self
            .fetch_drafts()
            .await?
            .into_iter()
            .filter(|draft| !known_urls.contains(draft.url.as_str()))
            .filter(|draft| seen.insert(draft.url.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn post(id: u32, url: &str) -> Post {
        Post {
            id,
            title: format!("Post {id}"),
            url: url.to_string(),
            summary: "A summary.".to_string(),
            category: "Programming".to_string(),
            date: "2026.08.01.".to_string(),
            post_type: "velog".to_string(),
            tags: vec!["Programming".to_string()],
        }
    }

    fn draft(url: &str, title: &str) -> PostDraft {
        PostDraft {
            title: title.to_string(),
            url: url.to_string(),
            summary: "New summary.".to_string(),
            category: "React".to_string(),
            date: "2026.08.20.".to_string(),
            tags: vec!["React".to_string()],
        }
    }

    #[test]
    fn merge_dedupes_by_url() {
        let existing = vec![post(10, "https://x/1")];
        let mut registry = IdRegistry::from_ids([10]);
        let outcome = merge_posts(
            &existing,
            vec![draft("https://x/1", "Dup"), draft("https://x/2", "New")],
            &mut registry,
            20,
        );
        assert_eq!(outcome.new_count, 1);
        assert_eq!(outcome.posts.len(), 2);
        assert_eq!(outcome.posts[0].url, "https://x/2");
    }

    #[test]
    fn merge_is_idempotent() {
        let existing = vec![post(10, "https://x/1")];
        let mut registry = IdRegistry::from_ids([10]);
        let incoming = vec![draft("https://x/2", "New")];

        let first = merge_posts(&existing, incoming.clone(), &mut registry, 20);
        assert_eq!(first.new_count, 1);

        let mut registry = IdRegistry::from_ids(first.posts.iter().map(|p| p.id));
        let second = merge_posts(&first.posts, incoming, &mut registry, 20);
        assert_eq!(second.new_count, 0);
        assert_eq!(second.posts, first.posts);
    }

    #[test]
    fn merge_never_duplicates_ids() {
        let existing = vec![post(3, "https://x/3"), post(7, "https://x/7")];
        let mut registry = IdRegistry::from_ids([3, 7]);
        let incoming = (0..5)
            .map(|n| draft(&format!("https://x/new-{n}"), "New"))
            .collect();
        let outcome = merge_posts(&existing, incoming, &mut registry, 20);

        let mut ids: Vec<u32> = outcome.posts.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), outcome.posts.len());
    }

    #[test]
    fn merge_sorts_by_id_descending_with_new_posts_first() {
        let existing = vec![post(10, "https://x/1")];
        let mut registry = IdRegistry::from_ids([10]);
        let outcome = merge_posts(&existing, vec![draft("https://x/2", "New")], &mut registry, 20);
        assert!(outcome.posts[0].id > 10);
        assert_eq!(outcome.posts[1].id, 10);
    }

    #[test]
    fn merge_collapses_duplicates_within_the_batch() {
        let mut registry = IdRegistry::new();
        let outcome = merge_posts(
            &[],
            vec![draft("https://x/a", "A"), draft("https://x/a", "A again")],
            &mut registry,
            20,
        );
        assert_eq!(outcome.new_count, 1);
    }

    #[test]
    fn merge_caps_new_posts_preserving_feed_order() {
        let mut registry = IdRegistry::new();
        let incoming = (0..5)
            .map(|n| draft(&format!("https://x/{n}"), &format!("Post {n}")))
            .collect();
        let outcome = merge_posts(&[], incoming, &mut registry, 2);
        assert_eq!(outcome.new_count, 2);
        let urls: HashSet<&str> = outcome.posts.iter().map(|p| p.url.as_str()).collect();
        assert!(urls.contains("https://x/0") && urls.contains("https://x/1"));
    }

    #[tokio::test]
    async fn store_round_trip_is_byte_stable() {
        let dir = tempdir().expect("tempdir");
        let store = PostStore::new(dir.path().join("blogPosts.ts"));
        let posts = vec![
            post(2, "https://velog.io/@dev/two"),
            Post {
                id: 1,
                title: "It's \\ tricky: quotes 'n backslashes".to_string(),
                url: "https://velog.io/@dev/one".to_string(),
                summary: "유니언 타입을 좁히는 방법".to_string(),
                category: "TypeScript".to_string(),
                date: "2026.08.12.".to_string(),
                post_type: "velog".to_string(),
                tags: vec!["TypeScript".to_string(), "TIL".to_string()],
            },
        ];

        store.write(&posts).await.expect("first write");
        let first_bytes = std::fs::read(store.path()).expect("read back");

        let snapshot = store.load().await.expect("load");
        assert_eq!(snapshot.posts, posts);
        assert_eq!(snapshot.used_ids, vec![2, 1]);

        store.write(&snapshot.posts).await.expect("second write");
        let second_bytes = std::fs::read(store.path()).expect("read back again");
        assert_eq!(first_bytes, second_bytes);
    }

    #[tokio::test]
    async fn missing_store_file_is_an_empty_first_run() {
        let dir = tempdir().expect("tempdir");
        let store = PostStore::new(dir.path().join("absent.ts"));
        let snapshot = store.load().await.expect("load");
        assert!(snapshot.posts.is_empty());
        assert!(snapshot.used_ids.is_empty());
    }

    #[tokio::test]
    async fn corrupted_store_file_fails_loudly() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("blogPosts.ts");
        std::fs::write(&path, "totally not the generated module").expect("write");
        assert!(PostStore::new(&path).load().await.is_err());
    }

    #[tokio::test]
    async fn partially_readable_store_file_fails_loudly() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("blogPosts.ts");
        let mut text = render_module(&[post(1, "https://x/1")]);
        // A second constructor call that the entry scanner cannot parse.
        text.push_str("  createPost({\n    id: oops,\n  }),\n");
        std::fs::write(&path, text).expect("write");
        assert!(PostStore::new(&path).load().await.is_err());
    }

    #[tokio::test]
    async fn truncated_store_entry_fails_loudly() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("blogPosts.ts");
        let mut text = render_module(&[post(1, "https://x/1")]);
        // An entry opening whose terminator was lost mid-write.
        text.push_str("  createPost({\n    id: 7,\n");
        std::fs::write(&path, text).expect("write");
        assert!(PostStore::new(&path).load().await.is_err());
    }

    #[tokio::test]
    async fn code_text_in_summaries_survives_the_round_trip() {
        let dir = tempdir().expect("tempdir");
        let store = PostStore::new(dir.path().join("blogPosts.ts"));
        let posts = vec![
            Post {
                id: 2,
                title: "useEffect cleanup".to_string(),
                url: "https://velog.io/@dev/effect".to_string(),
                summary: "useEffect(() => { setup(); }) runs after every render".to_string(),
                category: "React".to_string(),
                date: "2026.08.25.".to_string(),
                post_type: "velog".to_string(),
                tags: vec!["React".to_string()],
            },
            Post {
                id: 1,
                title: "Frontmatter basics".to_string(),
                url: "https://velog.io/@dev/frontmatter".to_string(),
                summary: "every post needs id: 99, tags: [a, b] and a title: 'x'".to_string(),
                category: "Programming".to_string(),
                date: "2026.08.24.".to_string(),
                post_type: "velog".to_string(),
                tags: vec!["Programming".to_string(), "markdown".to_string()],
            },
        ];

        store.write(&posts).await.expect("write");
        let snapshot = store.load().await.expect("load");
        assert_eq!(snapshot.posts, posts);

        store.write(&snapshot.posts).await.expect("rewrite");
        let reloaded = store.load().await.expect("reload");
        assert_eq!(reloaded.posts, posts);
    }

    #[test]
    fn empty_module_renders_and_parses() {
        let rendered = render_module(&[]);
        assert_eq!(parse_module(&rendered).expect("parse"), Vec::<Post>::new());
    }
}
