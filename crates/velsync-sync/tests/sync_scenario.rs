//! Offline end-to-end scenario: parse a feed document, normalize it, merge
//! against a persisted collection, and round-trip the store file.

use std::collections::HashSet;

use tempfile::tempdir;
use velsync_core::{IdRegistry, Post};
use velsync_feed::{normalize, parse_feed, NormalizeOptions};
use velsync_sync::{merge_posts, PostStore};

const FEED_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Velog</title>
<item>
  <title>Already Synced</title>
  <link>https://x/1</link>
  <description>old post</description>
  <pubDate>Mon, 03 Aug 2026 09:00:00 +0900</pubDate>
</item>
<item>
  <title>My TypeScript Error</title>
  <link>https://x/2</link>
  <description>&lt;p&gt;Tracking down a narrowing bug.&lt;/p&gt;</description>
  <pubDate>Wed, 12 Aug 2026 04:10:27 GMT</pubDate>
  <category>debugging</category>
</item>
</channel></rss>"#;

fn existing_post() -> Post {
    Post {
        id: 10,
        title: "Already Synced".to_string(),
        url: "https://x/1".to_string(),
        summary: "old post".to_string(),
        category: "Programming".to_string(),
        date: "2026.08.03.".to_string(),
        post_type: "velog".to_string(),
        tags: vec!["Programming".to_string()],
    }
}

#[tokio::test]
async fn duplicate_is_skipped_and_new_post_lands_first() {
    let dir = tempdir().expect("tempdir");
    let store = PostStore::new(dir.path().join("blogPosts.ts"));
    store.write(&[existing_post()]).await.expect("seed store");

    let snapshot = store.load().await.expect("load");
    assert_eq!(snapshot.used_ids, vec![10]);

    let options = NormalizeOptions::default();
    let drafts: Vec<_> = parse_feed(FEED_XML)
        .expect("parse")
        .iter()
        .map(|item| normalize(item, &options))
        .collect();
    assert_eq!(drafts.len(), 2);

    let mut registry = IdRegistry::from_ids(snapshot.used_ids.iter().copied());
    let outcome = merge_posts(&snapshot.posts, drafts, &mut registry, 20);

    assert_eq!(outcome.new_count, 1);
    assert_eq!(outcome.posts.len(), 2);

    let newest = &outcome.posts[0];
    assert_eq!(newest.url, "https://x/2");
    assert_eq!(newest.category, "TypeScript");
    assert_eq!(newest.date, "2026.08.12.");
    assert_eq!(newest.summary, "Tracking down a narrowing bug.");
    assert_eq!(newest.tags, vec!["TypeScript", "debugging"]);
    assert_ne!(newest.id, 10);
    assert!(newest.id > outcome.posts[1].id, "descending id order");
    assert_eq!(outcome.posts[1].id, 10);

    store.write(&outcome.posts).await.expect("persist");
    let rewritten = std::fs::read(store.path()).expect("read");

    // Second run over the unchanged feed: nothing new, file byte-identical.
    let snapshot = store.load().await.expect("reload");
    assert_eq!(snapshot.posts, outcome.posts);

    let options = NormalizeOptions::default();
    let drafts: Vec<_> = parse_feed(FEED_XML)
        .expect("parse")
        .iter()
        .map(|item| normalize(item, &options))
        .collect();
    let mut registry = IdRegistry::from_ids(snapshot.used_ids.iter().copied());
    let second = merge_posts(&snapshot.posts, drafts, &mut registry, 20);
    assert_eq!(second.new_count, 0);
    assert_eq!(second.posts, snapshot.posts);

    store.write(&second.posts).await.expect("rewrite");
    assert_eq!(std::fs::read(store.path()).expect("read"), rewritten);

    let ids: HashSet<u32> = second.posts.iter().map(|p| p.id).collect();
    assert_eq!(ids.len(), second.posts.len(), "no duplicate ids");
}
