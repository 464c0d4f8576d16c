//! Shared polling lifecycle for all watcher backends.
//!
//! Each watcher owns one background task that alone drives its polling
//! loop; the differ, cache and backend client move into that task, so the
//! cache needs no lock. The task runs one synchronisation immediately, then
//! selects between the ticker and the stop signal. Dropping the queue
//! senders on exit closes both queues exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::error::{Result, WatchError};
use crate::event::Event;

/// Capacity of the event and error queues. Producers block when a queue is
/// full, so a consumer that stops draining applies backpressure onto the
/// polling task rather than losing events.
pub(crate) const QUEUE_CAPACITY: usize = 100;

/// Outbound side of the event and error queues, owned by the background
/// task.
pub(crate) struct Sink {
    events: mpsc::Sender<Event>,
    errors: mpsc::Sender<WatchError>,
}

impl Sink {
    #[cfg(test)]
    pub(crate) fn for_tests() -> (Self, mpsc::Receiver<Event>, mpsc::Receiver<WatchError>) {
        let (events_tx, events_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(QUEUE_CAPACITY);
        let sink = Sink {
            events: events_tx,
            errors: errors_tx,
        };
        (sink, events_rx, errors_rx)
    }

    /// Publish an event; blocks while the queue is full.
    pub(crate) async fn event(&self, event: Event) {
        let _ = self.events.send(event).await;
    }

    /// Publish a non-fatal error; blocks while the queue is full.
    pub(crate) async fn error(&self, error: WatchError) {
        let _ = self.errors.send(error).await;
    }
}

/// One enumeration + diff pass, implemented per backend.
#[async_trait]
pub(crate) trait Synchronizer: Send + 'static {
    async fn sync(&mut self, first_sync: bool, sink: &Sink);
}

/// Run one guarded synchronisation.
///
/// The compare-and-swap on `syncing` keeps at most one body executing per
/// watcher; a tick that finds the flag set is dropped, not queued. The flag
/// is cleared on every exit path.
pub(crate) async fn run_guarded<S: Synchronizer + ?Sized>(
    synchronizer: &mut S,
    first_sync: bool,
    sink: &Sink,
    syncing: &AtomicBool,
) {
    if syncing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        debug!("synchronisation already running, skipping tick");
        return;
    }
    synchronizer.sync(first_sync, sink).await;
    syncing.store(false, Ordering::Release);
}

/// Lifecycle state shared by every backend: the watched location, polling
/// cadence, bounded queues, stop signal and single-flight flag.
pub(crate) struct WatcherBase {
    pub(crate) watch_dir: String,
    pub(crate) poll_interval: Duration,

    events_tx: Option<mpsc::Sender<Event>>,
    events_rx: Option<mpsc::Receiver<Event>>,
    errors_tx: Option<mpsc::Sender<WatchError>>,
    errors_rx: Option<mpsc::Receiver<WatchError>>,

    stop_tx: mpsc::Sender<()>,
    stop_rx: Option<mpsc::Receiver<()>>,
    syncing: Arc<AtomicBool>,
}

impl WatcherBase {
    pub(crate) fn new(watch_dir: &str, poll_interval: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        Self {
            watch_dir: watch_dir.to_string(),
            poll_interval,
            events_tx: Some(events_tx),
            events_rx: Some(events_rx),
            errors_tx: Some(errors_tx),
            errors_rx: Some(errors_rx),
            stop_tx,
            stop_rx: Some(stop_rx),
            syncing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take the pieces the background task owns: the queue senders and the
    /// stop receiver. Fails on a second `start`.
    pub(crate) fn prepare(&mut self) -> Result<(Sink, mpsc::Receiver<()>)> {
        let stop_rx = self.stop_rx.take().ok_or(WatchError::AlreadyStarted)?;
        let sink = Sink {
            events: self.events_tx.take().ok_or(WatchError::AlreadyStarted)?,
            errors: self.errors_tx.take().ok_or(WatchError::AlreadyStarted)?,
        };
        Ok((sink, stop_rx))
    }

    /// Spawn the standard polling loop around `synchronizer`. The task runs
    /// detached; `close` is the only way to end it.
    pub(crate) fn spawn_poll<S: Synchronizer>(&mut self, mut synchronizer: S) -> Result<()> {
        let (sink, mut stop_rx) = self.prepare()?;
        let interval = self.poll_interval;
        let syncing = Arc::clone(&self.syncing);

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            run_guarded(&mut synchronizer, true, &sink, &syncing).await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_guarded(&mut synchronizer, false, &sink, &syncing).await;
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        });
        Ok(())
    }

    /// Signal the background task to stop. Safe before `start` and
    /// idempotent afterwards; the one-slot buffer absorbs the first signal
    /// and later ones are dropped.
    pub(crate) fn close(&mut self) {
        let _ = self.stop_tx.try_send(());
    }

    pub(crate) fn take_events(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.events_rx.take()
    }

    pub(crate) fn take_errors(&mut self) -> Option<mpsc::Receiver<WatchError>> {
        self.errors_rx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::event::EventKind;

    struct CountingSync {
        entered: Arc<AtomicUsize>,
        hold: Duration,
    }

    #[async_trait]
    impl Synchronizer for CountingSync {
        async fn sync(&mut self, _first_sync: bool, _sink: &Sink) {
            self.entered.fetch_add(1, Ordering::SeqCst);
            time::sleep(self.hold).await;
        }
    }

    struct OneEventSync;

    #[async_trait]
    impl Synchronizer for OneEventSync {
        async fn sync(&mut self, _first_sync: bool, sink: &Sink) {
            sink.event(Event::new("/tick", EventKind::Changed, None)).await;
        }
    }

    #[tokio::test]
    async fn test_single_flight_drops_overlapping_sync() {
        let entered = Arc::new(AtomicUsize::new(0));
        let syncing = Arc::new(AtomicBool::new(false));
        let (events_tx, _events_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (errors_tx, _errors_rx) = mpsc::channel(QUEUE_CAPACITY);
        let sink = Sink {
            events: events_tx,
            errors: errors_tx,
        };

        let mut first = CountingSync {
            entered: Arc::clone(&entered),
            hold: Duration::from_millis(100),
        };
        let mut second = CountingSync {
            entered: Arc::clone(&entered),
            hold: Duration::from_millis(0),
        };

        // The second run starts while the first holds the flag.
        let slow = run_guarded(&mut first, false, &sink, &syncing);
        let fast = async {
            time::sleep(Duration::from_millis(20)).await;
            run_guarded(&mut second, false, &sink, &syncing).await;
        };
        tokio::join!(slow, fast);

        assert_eq!(entered.load(Ordering::SeqCst), 1);

        // The flag is released afterwards, so the next run executes.
        run_guarded(&mut second, false, &sink, &syncing).await;
        assert_eq!(entered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_poll_loop_runs_first_sync_and_closes_on_stop() {
        let mut base = WatcherBase::new("/", Duration::from_millis(50));
        let mut events = base.take_events().unwrap();
        base.spawn_poll(OneEventSync).unwrap();

        // First sync fires immediately.
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, "/tick");

        // A periodic tick follows.
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Changed);

        base.close();

        // The queue closes once the loop observes the stop signal.
        loop {
            match tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
            {
                Some(_) => continue,
                None => break,
            }
        }
    }

    #[tokio::test]
    async fn test_second_start_fails() {
        let mut base = WatcherBase::new("/", Duration::from_millis(50));
        base.spawn_poll(OneEventSync).unwrap();
        assert!(matches!(
            base.spawn_poll(OneEventSync),
            Err(WatchError::AlreadyStarted)
        ));
        base.close();
    }

    #[tokio::test]
    async fn test_close_before_start_stops_loop_immediately() {
        let mut base = WatcherBase::new("/", Duration::from_millis(50));
        base.close();
        base.close(); // idempotent

        let mut events = base.take_events().unwrap();
        base.spawn_poll(OneEventSync).unwrap();

        // The pending stop signal ends the loop after the first sync; the
        // queue must close without further ticks.
        let mut received = 0;
        while tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .is_some()
        {
            received += 1;
        }
        assert!(received <= 1);
    }
}
