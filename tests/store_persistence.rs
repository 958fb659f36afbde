//! Integration tests for the persistent store and the command layer:
//! datafile migration, atomic saves, lock exclusion, and a dry-run
//! through `commands::run` against a real (mock) server.

use std::path::PathBuf;

use feedmail::commands::{self, Paths};
use feedmail::feed::RunOptions;
use feedmail::store::{FeedStore, StoreLock, DATAFILE_VERSION};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("feedmail_it_store_{tag}"));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// ============================================================================
// Datafile format
// ============================================================================

#[test]
fn test_v1_datafile_upgrades_in_place_on_next_save() {
    let dir = temp_dir("migrate");
    let datafile = dir.join("feeds.json");
    std::fs::write(
        &datafile,
        r#"{"version": 1, "feeds": [{"name": "legacy", "seen": {"guid-a": "key-a"}}]}"#,
    )
    .unwrap();

    let store = FeedStore::load(&datafile, true).unwrap();
    assert_eq!(store.get("legacy").unwrap().seen["guid-a"].hash, "key-a");
    store.save().unwrap();

    let text = std::fs::read_to_string(&datafile).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["version"], DATAFILE_VERSION);
    assert_eq!(value["feeds"][0]["seen"]["guid-a"]["hash"], "key-a");

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_future_datafile_version_refuses_to_load() {
    let dir = temp_dir("future");
    let datafile = dir.join("feeds.json");
    std::fs::write(&datafile, r#"{"version": 99, "feeds": []}"#).unwrap();

    let err = FeedStore::load(&datafile, true).unwrap_err();
    assert!(err.to_string().contains("version 99"));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_save_leaves_no_temp_files_behind() {
    let dir = temp_dir("atomic");
    let datafile = dir.join("feeds.json");

    let mut store = FeedStore::load(&datafile, false).unwrap();
    store.state_mut("f").record("g", "h", None);
    store.save().unwrap();
    store.save().unwrap();

    let names: Vec<String> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["feeds.json"]);

    std::fs::remove_dir_all(&dir).ok();
}

// ============================================================================
// Locking
// ============================================================================

#[test]
fn test_lock_excludes_a_second_instance() {
    let dir = temp_dir("lock");
    let lock_path = FeedStore::lock_path(&dir.join("feeds.json"));

    let held = StoreLock::acquire(&lock_path).unwrap();
    assert!(StoreLock::try_acquire(&lock_path).unwrap().is_none());
    drop(held);
    assert!(StoreLock::try_acquire(&lock_path).unwrap().is_some());

    std::fs::remove_dir_all(&dir).ok();
}

// ============================================================================
// Command layer end-to-end (dry run, so no MTA involved)
// ============================================================================

async fn serve_feed() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>t</title>\
             <item><guid>g1</guid><title>Hello</title>\
             <description>world</description></item></channel></rss>",
        ))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_add_then_dry_run_records_state() {
    let dir = temp_dir("dry_run");
    let paths = Paths {
        config: dir.join("config.toml"),
        data: dir.join("feeds.json"),
    };
    let server = serve_feed().await;

    commands::add(&paths, "blog", &server.uri(), Some("inbox@example.com")).unwrap();
    commands::run(
        &paths,
        RunOptions {
            send: false,
            clean: false,
        },
        &[],
    )
    .await
    .unwrap();

    let store = FeedStore::load(&paths.data, true).unwrap();
    let state = store.get("blog").unwrap();
    assert!(state.seen.contains_key("g1"));
    assert!(state.seen["g1"].message_id.is_none(), "dry run sends nothing");

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_paused_feed_is_skipped_by_run() {
    let dir = temp_dir("paused");
    let paths = Paths {
        config: dir.join("config.toml"),
        data: dir.join("feeds.json"),
    };
    let server = serve_feed().await;

    commands::add(&paths, "blog", &server.uri(), Some("inbox@example.com")).unwrap();
    commands::set_active(&paths, &["blog".to_string()], false).unwrap();
    commands::run(
        &paths,
        RunOptions {
            send: false,
            clean: false,
        },
        &[],
    )
    .await
    .unwrap();

    let store = FeedStore::load(&paths.data, false).unwrap();
    assert!(store
        .get("blog")
        .map(|s| s.seen.is_empty())
        .unwrap_or(true));

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_failing_feed_does_not_block_the_next_one() {
    let dir = temp_dir("partial");
    let paths = Paths {
        config: dir.join("config.toml"),
        data: dir.join("feeds.json"),
    };

    let broken = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken)
        .await;
    let working = serve_feed().await;

    commands::add(&paths, "broken", &broken.uri(), Some("inbox@example.com")).unwrap();
    commands::add(&paths, "working", &working.uri(), Some("inbox@example.com")).unwrap();

    let err = commands::run(
        &paths,
        RunOptions {
            send: false,
            clean: false,
        },
        &[],
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("1 of 2 feeds failed"));

    // The working feed's progress was saved despite the failure.
    let store = FeedStore::load(&paths.data, true).unwrap();
    assert!(store.get("working").unwrap().seen.contains_key("g1"));

    std::fs::remove_dir_all(&dir).ok();
}
