use std::fs;
use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use hastemap::{ChangeEvent, HasteConfig, HasteMap, WatchEventKind};

fn watch_config(root: &Path, cache_dir: &Path, name: &str) -> HasteConfig {
    let mut config = HasteConfig::new(
        name,
        root,
        vec![root.to_path_buf()],
        vec!["js".to_string()],
        vec![],
        1,
    );
    config.cache_directory = cache_dir.to_path_buf();
    config.use_watchman = false;
    config.watch = true;
    config
}

fn wait_for_frame(
    events: &Receiver<ChangeEvent>,
    deadline: Duration,
    mut interesting: impl FnMut(&ChangeEvent) -> bool,
) -> Option<ChangeEvent> {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        match events.recv_timeout(Duration::from_millis(500)) {
            Ok(frame) if interesting(&frame) => return Some(frame),
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
    None
}

#[test]
fn watch_mode_emits_consistent_change_frames() {
    let root = tempfile::tempdir().expect("root");
    let root_dir = fs::canonicalize(root.path()).expect("canonical root");
    let cache = tempfile::tempdir().expect("cache");
    fs::write(root_dir.join("One.js"), "/** @providesModule One */").expect("fixture");

    let mut map = HasteMap::new(watch_config(&root_dir, cache.path(), "watch-frames"))
        .expect("map");
    let built = map.build().expect("build");
    assert!(built.haste_fs.exists(&root_dir.join("One.js")));
    let events = map.take_change_events().expect("change receiver");

    // Give the OS watcher a moment to settle before producing events.
    thread::sleep(Duration::from_millis(250));
    fs::write(root_dir.join("Two.js"), "/** @providesModule Two */").expect("new file");

    let frame = wait_for_frame(&events, Duration::from_secs(10), |frame| {
        frame
            .events
            .iter()
            .any(|event| event.file_path.ends_with("Two.js"))
    })
    .expect("change frame for Two.js");

    // The frame's views derive from one snapshot version and include the
    // new module.
    assert!(frame.haste_fs.exists(&root_dir.join("Two.js")));
    assert_eq!(
        frame
            .module_map
            .get_module("Two", None, false)
            .expect("resolvable"),
        Some(root_dir.join("Two.js"))
    );

    map.end();
}

#[test]
fn watch_mode_observes_deletions() {
    let root = tempfile::tempdir().expect("root");
    let root_dir = fs::canonicalize(root.path()).expect("canonical root");
    let cache = tempfile::tempdir().expect("cache");
    fs::write(root_dir.join("Gone.js"), "/** @providesModule Gone */").expect("fixture");

    let mut map = HasteMap::new(watch_config(&root_dir, cache.path(), "watch-delete"))
        .expect("map");
    let built = map.build().expect("build");
    assert!(built.haste_fs.exists(&root_dir.join("Gone.js")));
    let events = map.take_change_events().expect("change receiver");

    thread::sleep(Duration::from_millis(250));
    fs::remove_file(root_dir.join("Gone.js")).expect("delete");

    let frame = wait_for_frame(&events, Duration::from_secs(10), |frame| {
        frame.events.iter().any(|event| {
            event.kind == WatchEventKind::Delete && event.file_path.ends_with("Gone.js")
        })
    })
    .expect("delete frame");

    assert!(!frame.haste_fs.exists(&root_dir.join("Gone.js")));
    assert_eq!(
        frame
            .module_map
            .get_module("Gone", None, false)
            .expect("lookup"),
        None
    );

    map.end();
}

#[test]
fn end_is_idempotent() {
    let root = tempfile::tempdir().expect("root");
    let root_dir = fs::canonicalize(root.path()).expect("canonical root");
    let cache = tempfile::tempdir().expect("cache");
    fs::write(root_dir.join("One.js"), "/** @providesModule One */").expect("fixture");

    let mut map =
        HasteMap::new(watch_config(&root_dir, cache.path(), "watch-end")).expect("map");
    map.build().expect("build");
    map.end();
    map.end();
}
