//! End-to-end lifecycle tests over the local backend: factory, config,
//! start, event delivery in both modes, and queue shutdown on close.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use driftwatch::{Event, EventKind, WatchError, Watcher as _};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

const POLL: Duration = Duration::from_millis(100);
const WAIT: Duration = Duration::from_secs(5);

async fn next_event(events: &mut mpsc::Receiver<Event>) -> Event {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event queue closed early")
}

async fn assert_closes(events: &mut mpsc::Receiver<Event>) {
    while timeout(WAIT, events.recv())
        .await
        .expect("event queue did not close")
        .is_some()
    {}
}

#[test]
fn factory_requires_existing_directory() {
    let result = driftwatch::new("local", "/nonexistent/path/12345", POLL);
    assert!(matches!(result, Err(WatchError::NotFound(_))));
}

#[tokio::test]
async fn polling_mode_reports_the_full_lifecycle() {
    let dir = TempDir::new().unwrap();
    let mut watcher = driftwatch::new("local", dir.path().to_str().unwrap(), POLL).unwrap();

    let options = HashMap::from([("disable_fsnotify".to_string(), "true".to_string())]);
    watcher.set_config(&options).unwrap();

    let mut events = watcher.take_events().unwrap();
    let mut errors = watcher.take_errors().unwrap();
    assert!(watcher.take_events().is_none(), "receivers are taken once");

    watcher.start().await.unwrap();

    // Give the silent first sync time to pass before creating anything.
    tokio::time::sleep(Duration::from_millis(250)).await;

    let file = dir.path().join("a.txt");
    fs::write(&file, b"one").unwrap();
    let event = next_event(&mut events).await;
    assert_eq!(event.kind, EventKind::Created);
    assert!(event.key.ends_with("a.txt"));

    fs::write(&file, b"one, but longer").unwrap();
    let event = next_event(&mut events).await;
    assert_eq!(event.kind, EventKind::Changed);

    fs::remove_file(&file).unwrap();
    let event = next_event(&mut events).await;
    assert_eq!(event.kind, EventKind::Deleted);

    watcher.close();
    watcher.close(); // idempotent

    assert_closes(&mut events).await;
    while timeout(WAIT, errors.recv())
        .await
        .expect("error queue did not close")
        .is_some()
    {}
}

#[tokio::test]
async fn notify_mode_translates_kernel_events() {
    let dir = TempDir::new().unwrap();
    let mut watcher = driftwatch::new("local", dir.path().to_str().unwrap(), POLL).unwrap();
    watcher.set_config(&HashMap::new()).unwrap();

    let mut events = watcher.take_events().unwrap();
    watcher.start().await.unwrap();

    // Let the recursive subscriptions settle.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let file = dir.path().join("a.txt");
    fs::write(&file, b"one").unwrap();
    let event = next_event(&mut events).await;
    assert_eq!(event.kind, EventKind::Created);
    assert!(event.key.ends_with("a.txt"));

    // A new subdirectory gets subscribed, so files below it are seen too.
    let sub = dir.path().join("sub");
    fs::create_dir(&sub).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    fs::write(sub.join("b.txt"), b"two").unwrap();

    let mut saw_nested_create = false;
    for _ in 0..10 {
        let event = next_event(&mut events).await;
        if event.kind == EventKind::Created && event.key.ends_with("b.txt") {
            saw_nested_create = true;
            break;
        }
    }
    assert!(saw_nested_create, "no Created event for the nested file");

    // Removal comes through as Deleted; writes in between may add Changed
    // events, so scan forward.
    fs::remove_file(&file).unwrap();
    loop {
        let event = next_event(&mut events).await;
        if event.kind == EventKind::Deleted && event.key.ends_with("a.txt") {
            break;
        }
    }

    watcher.close();
    assert_closes(&mut events).await;
}

#[tokio::test]
async fn second_start_fails() {
    let dir = TempDir::new().unwrap();
    let mut watcher = driftwatch::new("local", dir.path().to_str().unwrap(), POLL).unwrap();
    let options = HashMap::from([("disable_fsnotify".to_string(), "true".to_string())]);
    watcher.set_config(&options).unwrap();

    watcher.start().await.unwrap();
    assert!(matches!(
        watcher.start().await,
        Err(WatchError::AlreadyStarted)
    ));
    watcher.close();
}

#[tokio::test]
async fn close_before_start_is_safe() {
    let dir = TempDir::new().unwrap();
    let mut watcher = driftwatch::new("local", dir.path().to_str().unwrap(), POLL).unwrap();
    let options = HashMap::from([("disable_fsnotify".to_string(), "true".to_string())]);
    watcher.set_config(&options).unwrap();

    watcher.close();

    let mut events = watcher.take_events().unwrap();
    watcher.start().await.unwrap();

    // The pending stop signal winds the loop down right away.
    assert_closes(&mut events).await;
}
