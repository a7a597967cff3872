//! End-to-end scenarios driven through the public [`Observer`] API against a real filesystem.
//!
//! These exercise whichever backend [`watchtower::recommended_observer`] selects for the host
//! running the suite; the polling interval is kept short so a catch-up tick never dominates a
//! test's runtime on backends that still rely on the poller (or as the universal fallback).

mod common;

use std::time::Duration;

use watchtower::{recommended_observer, Config, RecursiveMode, WatchPathConfig};

fn fast_observer() -> watchtower::Observer {
    let observer =
        recommended_observer(Config::default().with_poll_interval(Duration::from_millis(20)))
            .unwrap();
    observer.start().unwrap();
    observer
}

#[test]
fn create_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let observer = fast_observer();
    let (handler, events) = common::channel_handler();
    let watch = observer
        .schedule(dir.path(), WatchPathConfig::new(RecursiveMode::Recursive))
        .unwrap();
    observer.add_handler_for_watch(&watch, Box::new(handler)).unwrap();

    let file = dir.path().join("a");
    std::fs::write(&file, b"hi").unwrap();
    events.expect("file_created");

    std::fs::remove_file(&file).unwrap();
    events.expect("file_deleted");

    observer.stop();
}

#[test]
fn move_within_watch() {
    let dir = tempfile::tempdir().unwrap();
    let observer = fast_observer();
    let (handler, events) = common::channel_handler();
    let watch = observer
        .schedule(dir.path(), WatchPathConfig::new(RecursiveMode::Recursive))
        .unwrap();
    observer.add_handler_for_watch(&watch, Box::new(handler)).unwrap();

    let a = dir.path().join("a");
    let b = dir.path().join("b");
    std::fs::write(&a, b"hi").unwrap();
    events.expect("file_created");

    std::fs::rename(&a, &b).unwrap();
    let moved = events.expect("file_moved");
    assert_eq!(moved.paths.first().unwrap(), &a);
    assert_eq!(moved.paths.last().unwrap(), &b);

    observer.stop();
}

#[test]
fn move_out_of_watch() {
    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let observer = fast_observer();
    let (handler, events) = common::channel_handler();
    let watch = observer
        .schedule(dir.path(), WatchPathConfig::new(RecursiveMode::Recursive))
        .unwrap();
    observer.add_handler_for_watch(&watch, Box::new(handler)).unwrap();

    let a = dir.path().join("a");
    std::fs::write(&a, b"hi").unwrap();
    events.expect("file_created");

    std::fs::rename(&a, outside.path().join("a")).unwrap();
    events.expect("file_deleted");

    observer.stop();
}

#[test]
fn new_subdirectory_catch_up() {
    let dir = tempfile::tempdir().unwrap();
    let observer = fast_observer();
    let (handler, events) = common::channel_handler();
    let watch = observer
        .schedule(dir.path(), WatchPathConfig::new(RecursiveMode::Recursive))
        .unwrap();
    observer.add_handler_for_watch(&watch, Box::new(handler)).unwrap();

    let sub = dir.path().join("d");
    std::fs::create_dir(&sub).unwrap();
    std::fs::write(sub.join("f"), b"hi").unwrap();

    events.wait_ordered(&["dir_created", "file_created"]);

    observer.stop();
}

#[test]
fn non_recursive_filter_ignores_nested_creation() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("d");
    std::fs::create_dir(&sub).unwrap();

    let observer = fast_observer();
    let (handler, events) = common::channel_handler();
    let watch = observer
        .schedule(dir.path(), WatchPathConfig::new(RecursiveMode::NonRecursive))
        .unwrap();
    observer.add_handler_for_watch(&watch, Box::new(handler)).unwrap();

    std::fs::write(sub.join("f"), b"hi").unwrap();
    events.expect_none(Duration::from_millis(300));

    observer.stop();
}

#[test]
fn snapshot_diff_idempotence() {
    use watchtower::{diff, Walker};

    let dir = tempfile::tempdir().unwrap();
    let walker = Walker::new(true);
    let s1 = walker.walk(dir.path(), true);

    let file = dir.path().join("a");
    std::fs::write(&file, b"hi").unwrap();
    let s2 = walker.walk(dir.path(), true);

    let events = diff(&s1, &s2);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].label(), "file_created");
    assert!(events[0].is_synthetic);
    assert_eq!(events[0].paths, vec![file]);

    let no_change = diff(&s2, &s2);
    assert!(no_change.is_empty());
}
