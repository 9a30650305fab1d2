//! Processing queue for label conversion work.
//!
//! An unbounded intake buffer is drained by a single dispatch loop that hands
//! items to a worker pool bounded by a semaphore. Each item reaches exactly
//! one terminal outcome: converted (source deleted) or failed (source kept).
//! Files still held by a writer are retried after a delay, up to a cap.
//! A newer read of a file that is already pending replaces the stale one.

use crate::concurrency::derive_plan;
use crate::config::Config;
use crate::convert::Converter;
use crate::file_gate;
use crate::metrics::{QueueCounters, QueueStats};
use crate::work_item::WorkItem;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Failure message for a file that stayed locked past the retry cap.
pub const LOCKED_TOO_LONG: &str = "file in use for too long";

const EVENT_CAPACITY: usize = 256;
const MIN_IDLE_POLL: Duration = Duration::from_millis(10);

/// Tuning for the processing queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    /// Worker pool size
    pub max_concurrent_files: usize,
    /// Lock-conflict retries before giving up on a file
    pub max_retries: u32,
    /// Delay before a locked file goes back into the queue
    pub retry_delay: Duration,
    /// Sleep between polls of an empty intake buffer
    pub idle_poll: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent_files: 1,
            max_retries: 3,
            retry_delay: Duration::from_millis(2000),
            idle_poll: Duration::from_millis(1000),
        }
    }
}

impl QueueOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_concurrent_files: derive_plan(cfg).max_concurrent_files,
            max_retries: cfg.queue.max_retries,
            retry_delay: Duration::from_millis(cfg.queue.retry_delay_ms),
            idle_poll: Duration::from_millis(cfg.queue.idle_poll_ms),
        }
    }
}

/// Terminal outcome notifications.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// PDF written; the source file is removed unless it changed after it
    /// was read
    Converted {
        item: WorkItem,
        output: PathBuf,
        pages: usize,
    },
    /// Gave up on the item; its source file stays where it is
    Failed { item: WorkItem, error: String },
}

/// FIFO intake buffer, internally synchronized.
#[derive(Default)]
struct Intake {
    items: Mutex<VecDeque<WorkItem>>,
    notify: Notify,
}

impl Intake {
    fn push(&self, item: WorkItem) {
        lock(&self.items).push_back(item);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<WorkItem> {
        lock(&self.items).pop_front()
    }

    /// Swap fresh content into the queued item for the same source file.
    /// Returns `newer` back when no such item is waiting.
    fn refresh(&self, newer: WorkItem) -> Result<(), WorkItem> {
        let mut items = lock(&self.items);
        match items.iter_mut().find(|i| i.source_path == newer.source_path) {
            Some(queued) => {
                queued.refresh_from(newer);
                Ok(())
            }
            None => Err(newer),
        }
    }

    fn len(&self) -> usize {
        lock(&self.items).len()
    }
}

/// Per-source bookkeeping while a file is queued, awaiting a retry, or in
/// flight.
struct Tracked {
    /// Content of the item the queue currently holds.
    content: String,
    /// Newer read that arrived while the item was out of the intake buffer.
    newer: Option<WorkItem>,
}

impl Tracked {
    fn latest_content(&self) -> &str {
        self.newer
            .as_ref()
            .map(|item| item.content.as_str())
            .unwrap_or(&self.content)
    }
}

/// What happened to the source file after a conversion.
#[derive(Debug)]
enum SourceOutcome {
    Deleted,
    DeleteFailed(std::io::Error),
    /// A newer read was queued in its place
    Superseded,
    /// File changed after it was read
    Changed,
    NoSource,
}

struct Shared {
    options: QueueOptions,
    converter: Converter,
    intake: Intake,
    tracked: Mutex<HashMap<PathBuf, Tracked>>,
    counters: QueueCounters,
    events: broadcast::Sender<QueueEvent>,
    cancel: CancellationToken,
}

impl Shared {
    fn requeue(&self, item: WorkItem) {
        self.counters.item_queued();
        self.intake.push(item);
    }

    /// Register a file-backed item. Returns false for a duplicate read.
    fn track(&self, item: WorkItem) -> bool {
        let Some(source) = item.source().map(PathBuf::from) else {
            self.requeue(item);
            return true;
        };

        let mut tracked = lock(&self.tracked);
        match tracked.get_mut(&source) {
            None => {
                tracked.insert(
                    source,
                    Tracked {
                        content: item.content.clone(),
                        newer: None,
                    },
                );
                self.requeue(item);
                true
            }
            Some(entry) if entry.latest_content() == item.content => false,
            Some(entry) => {
                let content = item.content.clone();
                match self.intake.refresh(item) {
                    Ok(()) => {
                        debug!(path = %source.display(), "queued item refreshed with newer read");
                        entry.content = content;
                        entry.newer = None;
                    }
                    Err(item) => {
                        debug!(path = %source.display(), "newer read held until current attempt ends");
                        entry.newer = Some(item);
                    }
                }
                true
            }
        }
    }

    /// Requeue a locked item, picking up any newer read made meanwhile.
    fn retry(&self, mut item: WorkItem) {
        if let Some(source) = item.source().map(PathBuf::from) {
            if let Some(entry) = lock(&self.tracked).get_mut(&source) {
                if let Some(newer) = entry.newer.take() {
                    entry.content = newer.content.clone();
                    item.refresh_from(newer);
                }
            }
        }
        self.requeue(item);
    }

    /// Forget the item's source, or queue the newer read held for it.
    fn release(&self, item: &WorkItem) -> bool {
        let Some(source) = item.source() else {
            return false;
        };
        let mut tracked = lock(&self.tracked);
        match tracked.get_mut(source).and_then(|entry| entry.newer.take()) {
            Some(newer) => {
                if let Some(entry) = tracked.get_mut(source) {
                    entry.content = newer.content.clone();
                }
                self.requeue(newer);
                true
            }
            None => {
                tracked.remove(source);
                false
            }
        }
    }

    /// Settle the source file of a converted item.
    ///
    /// Runs under the tracking lock so a concurrent newer read either lands
    /// before the decision or starts a fresh entry after it.
    fn finish_source(&self, item: &WorkItem) -> SourceOutcome {
        let Some(source) = item.source() else {
            return SourceOutcome::NoSource;
        };
        let mut tracked = lock(&self.tracked);
        if let Some(newer) = tracked.get_mut(source).and_then(|entry| entry.newer.take()) {
            if let Some(entry) = tracked.get_mut(source) {
                entry.content = newer.content.clone();
            }
            self.requeue(newer);
            return SourceOutcome::Superseded;
        }
        tracked.remove(source);

        if item.source_changed() {
            return SourceOutcome::Changed;
        }
        match std::fs::remove_file(source) {
            Ok(()) => SourceOutcome::Deleted,
            Err(e) => SourceOutcome::DeleteFailed(e),
        }
    }

    /// Drop tracking outright; any newer read is abandoned too.
    fn untrack(&self, item: &WorkItem) {
        if let Some(source) = item.source() {
            lock(&self.tracked).remove(source);
        }
    }

    fn emit(&self, event: QueueEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Bounded-concurrency conversion queue.
///
/// The dispatch loop starts on construction, so this must be created inside
/// a Tokio runtime.
pub struct ProcessingQueue {
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessingQueue {
    pub fn new(converter: Converter, options: QueueOptions) -> Self {
        let permits = options.max_concurrent_files.max(1);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            options,
            converter,
            intake: Intake::default(),
            tracked: Mutex::new(HashMap::new()),
            counters: QueueCounters::default(),
            events,
            cancel: CancellationToken::new(),
        });
        let semaphore = Arc::new(Semaphore::new(permits));

        let dispatcher = tokio::spawn(dispatch_loop(shared.clone(), semaphore.clone()));
        info!(max_concurrent_files = permits, "processing queue started");

        Self {
            shared,
            semaphore,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Append an item to the tail of the intake buffer. Never blocks.
    ///
    /// If the same source file is already pending, a read with new content
    /// replaces the pending one instead of adding a second item. Returns
    /// `false` when the queue is stopped or the read is an exact duplicate.
    pub fn enqueue(&self, item: WorkItem) -> bool {
        if self.shared.cancel.is_cancelled() {
            warn!(file = %item.file_name, "queue stopped, item not accepted");
            return false;
        }

        let (id, file_name, labels) = (item.id.clone(), item.file_name.clone(), item.labels().len());
        if !self.shared.track(item) {
            debug!(file = %file_name, "already pending, skipping duplicate");
            return false;
        }
        info!(id = %id, file = %file_name, labels, "enqueued");
        true
    }

    /// Receive terminal outcome notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> QueueStats {
        self.shared
            .counters
            .snapshot(self.shared.options.max_concurrent_files.max(1))
    }

    pub fn options(&self) -> &QueueOptions {
        &self.shared.options
    }

    /// Free worker slots right now.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Stop dispatching and wait for in-flight items to reach their outcome.
    ///
    /// Items still in the intake buffer and pending retries are abandoned;
    /// their source files stay on disk. Calling twice is harmless.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let handle = lock(&self.dispatcher).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("dispatch loop ended abnormally: {}", e);
            }
            info!("processing queue stopped");
        }
    }
}

impl Drop for ProcessingQueue {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn dispatch_loop(shared: Arc<Shared>, semaphore: Arc<Semaphore>) {
    let mut workers = JoinSet::new();
    let idle_poll = shared.options.idle_poll.max(MIN_IDLE_POLL);

    loop {
        while let Some(done) = workers.try_join_next() {
            if let Err(e) = done {
                error!("worker task failed: {}", e);
            }
        }

        // Take a worker slot first so the head item stays queued until a
        // worker can actually run it.
        let permit: OwnedSemaphorePermit = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let Some(item) = shared.intake.pop() else {
            drop(permit);
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => break,
                _ = shared.intake.notify.notified() => {}
                _ = tokio::time::sleep(idle_poll) => {}
            }
            continue;
        };
        shared.counters.item_dequeued();

        let worker_shared = shared.clone();
        workers.spawn(async move {
            let _permit = permit;
            process_item(worker_shared, item).await;
        });
    }

    let abandoned = shared.intake.len();
    if abandoned > 0 {
        info!(abandoned, "dispatch stopped with items still queued");
    }

    while let Some(done) = workers.join_next().await {
        if let Err(e) = done {
            error!("worker task failed: {}", e);
        }
    }
}

/// Run one item through the lock check and conversion.
async fn process_item(shared: Arc<Shared>, mut item: WorkItem) {
    shared.counters.worker_started();

    if let Some(source) = item.source().map(PathBuf::from) {
        if !source.exists() {
            debug!(file = %item.file_name, "source file gone, dropping item");
            shared.untrack(&item);
            shared.counters.worker_finished();
            return;
        }

        if file_gate::is_locked(&source) {
            let attempt = item.record_lock_conflict();
            shared.counters.worker_finished();
            if attempt <= shared.options.max_retries {
                warn!(
                    file = %item.file_name,
                    attempt,
                    max_retries = shared.options.max_retries,
                    "file locked, retrying later"
                );
                schedule_retry(shared, item);
            } else {
                fail(&shared, item, LOCKED_TOO_LONG.to_string());
            }
            return;
        }
    }

    let converter = shared.converter.clone();
    let output = converter.output_path_for(&item);
    let labels = item.labels().to_vec();
    let target = output.clone();
    let result = tokio::task::spawn_blocking(move || converter.convert(&labels, &target)).await;
    shared.counters.worker_finished();

    match result {
        Ok(Ok(pages)) => {
            match shared.finish_source(&item) {
                SourceOutcome::Deleted | SourceOutcome::NoSource => {}
                SourceOutcome::DeleteFailed(e) => {
                    warn!(file = %item.file_name, "converted but could not delete source: {}", e);
                }
                SourceOutcome::Superseded => {
                    info!(file = %item.file_name, "newer content arrived, converting again");
                }
                SourceOutcome::Changed => {
                    warn!(file = %item.file_name, "source changed after it was read, keeping it");
                }
            }
            info!(
                id = %item.id,
                file = %item.file_name,
                output = %output.display(),
                pages,
                retries = item.retry_count,
                "converted"
            );
            shared.counters.record_converted();
            shared.emit(QueueEvent::Converted {
                item,
                output,
                pages,
            });
        }
        Ok(Err(e)) => fail(&shared, item, e.to_string()),
        Err(join_err) => fail(&shared, item, format!("conversion task panicked: {}", join_err)),
    }
}

fn fail(shared: &Shared, mut item: WorkItem, reason: String) {
    item.fail(&reason);
    error!(
        id = %item.id,
        file = %item.file_name,
        retries = item.retry_count,
        "conversion failed: {}",
        reason
    );
    shared.counters.record_failed();
    shared.emit(QueueEvent::Failed {
        item: item.clone(),
        error: reason,
    });
    if shared.release(&item) {
        info!(file = %item.file_name, "newer content arrived, converting again");
    }
}

/// Put a locked item back after the retry delay without holding a worker
/// slot in the meantime.
fn schedule_retry(shared: Arc<Shared>, item: WorkItem) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!(file = %item.file_name, "shutdown, dropping pending retry");
                shared.untrack(&item);
            }
            _ = tokio::time::sleep(shared.options.retry_delay) => {
                shared.retry(item);
            }
        }
    });
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::testing::{fake_converter, FakeRenderer};
    use crate::convert::{ConvertError, LabelRenderer};
    use crate::dimensions::{DimensionMode, DimensionResolver, Dimensions};
    use crate::work_item::SourceStamp;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn fast_options(max_concurrent_files: usize) -> QueueOptions {
        QueueOptions {
            max_concurrent_files,
            max_retries: 3,
            retry_delay: Duration::from_millis(20),
            idle_poll: Duration::from_millis(20),
        }
    }

    fn file_item(dir: &Path, name: &str, content: &str) -> WorkItem {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        let labels = DimensionResolver::default().resolve_content(content, DimensionMode::PerLabel);
        WorkItem::from_file(path, content.to_string(), labels)
    }

    async fn next_event(rx: &mut broadcast::Receiver<QueueEvent>) -> QueueEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for queue event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_initial_stats() {
        let queue = ProcessingQueue::new(
            fake_converter(Arc::new(FakeRenderer::default())),
            fast_options(3),
        );
        let stats = queue.stats();
        assert_eq!(stats.queue_length, 0);
        assert!(!stats.is_processing);
        assert_eq!(stats.max_concurrency, 3);
        assert_eq!(queue.available_permits(), 3);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_success_writes_pdf_and_deletes_source() {
        let temp_dir = TempDir::new().unwrap();
        let queue = ProcessingQueue::new(
            fake_converter(Arc::new(FakeRenderer::default())),
            fast_options(1),
        );
        let mut rx = queue.subscribe();

        let item = file_item(temp_dir.path(), "ship.txt", "^XA^FDhello^FS^XZ");
        let source = item.source_path.clone();
        assert!(queue.enqueue(item));

        match next_event(&mut rx).await {
            QueueEvent::Converted { output, pages, item } => {
                assert_eq!(output, temp_dir.path().join("ship.txt.pdf"));
                assert_eq!(pages, 1);
                assert_eq!(item.retry_count, 0);
                assert!(output.exists());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!source.exists());
        assert_eq!(queue.stats().converted, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_conversion_failure_keeps_source_and_is_not_retried() {
        let temp_dir = TempDir::new().unwrap();
        let renderer = Arc::new(FakeRenderer::default());
        let queue = ProcessingQueue::new(fake_converter(renderer.clone()), fast_options(1));
        let mut rx = queue.subscribe();

        let item = file_item(temp_dir.path(), "bad.prn", "^XA^FDBOOM^FS^XZ");
        let source = item.source_path.clone();
        queue.enqueue(item);

        match next_event(&mut rx).await {
            QueueEvent::Failed { item, error } => {
                assert!(error.contains("malformed label"));
                assert_eq!(item.last_error.as_deref(), Some(error.as_str()));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(source.exists());
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().failed, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_missing_source_is_dropped_silently() {
        let temp_dir = TempDir::new().unwrap();
        let queue = ProcessingQueue::new(
            fake_converter(Arc::new(FakeRenderer::default())),
            fast_options(1),
        );
        let mut rx = queue.subscribe();

        let vanished = file_item(temp_dir.path(), "gone.txt", "^XA^FDa^FS^XZ");
        std::fs::remove_file(&vanished.source_path).unwrap();
        queue.enqueue(vanished);
        queue.enqueue(file_item(temp_dir.path(), "kept.txt", "^XA^FDb^FS^XZ"));

        match next_event(&mut rx).await {
            QueueEvent::Converted { item, .. } => assert_eq!(item.file_name, "kept.txt"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.stats().failed, 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_same_content_twice_gives_two_outcomes() {
        let temp_dir = TempDir::new().unwrap();
        let converter = fake_converter(Arc::new(FakeRenderer::default()))
            .with_output_folder(Some(temp_dir.path().to_path_buf()));
        let queue = ProcessingQueue::new(converter, fast_options(1));
        let mut rx = queue.subscribe();

        let content = "^XA^FDsame^FS^XZ";
        let labels = DimensionResolver::default().resolve_content(content, DimensionMode::PerLabel);
        assert!(queue.enqueue(WorkItem::from_content("a.txt", content.into(), labels.clone())));
        assert!(queue.enqueue(WorkItem::from_content("b.txt", content.into(), labels)));

        let mut converted = Vec::new();
        for _ in 0..2 {
            match next_event(&mut rx).await {
                QueueEvent::Converted { item, .. } => converted.push(item.file_name),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        converted.sort();
        assert_eq!(converted, vec!["a.txt", "b.txt"]);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_source_is_coalesced() {
        let temp_dir = TempDir::new().unwrap();
        let queue = ProcessingQueue::new(
            fake_converter(Arc::new(FakeRenderer::slow(Duration::from_millis(100)))),
            fast_options(1),
        );
        let mut rx = queue.subscribe();

        let item = file_item(temp_dir.path(), "dup.txt", "^XA^FDx^FS^XZ");
        let again = item.clone();
        assert!(queue.enqueue(item));
        assert!(!queue.enqueue(again));

        assert!(matches!(next_event(&mut rx).await, QueueEvent::Converted { .. }));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        queue.stop().await;
    }

    async fn wait_until_processing(queue: &ProcessingQueue) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.stats().is_processing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker never started");
    }

    fn stamped(item: WorkItem) -> WorkItem {
        let stamp = SourceStamp::of(&item.source_path).unwrap();
        item.with_source_stamp(stamp)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_newer_read_replaces_queued_item() {
        let temp_dir = TempDir::new().unwrap();
        let renderer = Arc::new(FakeRenderer::slow(Duration::from_millis(300)));
        let queue = ProcessingQueue::new(fake_converter(renderer.clone()), fast_options(1));
        let mut rx = queue.subscribe();

        queue.enqueue(file_item(temp_dir.path(), "busy.txt", "^XA^FDbusy^FS^XZ"));
        wait_until_processing(&queue).await;

        assert!(queue.enqueue(stamped(file_item(temp_dir.path(), "order.txt", "^XA^FDpartial^FS^XZ"))));
        let fresh = stamped(file_item(temp_dir.path(), "order.txt", "^XA^FDfull^FS^XZ"));
        let source = fresh.source_path.clone();
        assert!(queue.enqueue(fresh));
        assert_eq!(queue.stats().queue_length, 1);

        for _ in 0..2 {
            assert!(matches!(next_event(&mut rx).await, QueueEvent::Converted { .. }));
        }
        let pdf = std::fs::read_to_string(temp_dir.path().join("order.txt.pdf")).unwrap();
        assert!(pdf.contains("^FDfull"));
        assert!(!pdf.contains("partial"));
        assert!(!source.exists());
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
        queue.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_newer_read_during_conversion_converts_again() {
        let temp_dir = TempDir::new().unwrap();
        let renderer = Arc::new(FakeRenderer::slow(Duration::from_millis(300)));
        let queue = ProcessingQueue::new(fake_converter(renderer.clone()), fast_options(1));
        let mut rx = queue.subscribe();

        assert!(queue.enqueue(stamped(file_item(temp_dir.path(), "order.txt", "^XA^FDpartial^FS^XZ"))));
        wait_until_processing(&queue).await;
        let fresh = stamped(file_item(temp_dir.path(), "order.txt", "^XA^FDfull^FS^XZ"));
        let source = fresh.source_path.clone();
        assert!(queue.enqueue(fresh));

        assert!(matches!(next_event(&mut rx).await, QueueEvent::Converted { .. }));
        // stale conversion done, the newer read is still converting
        assert!(source.exists());

        match next_event(&mut rx).await {
            QueueEvent::Converted { item, output, .. } => {
                assert_eq!(item.content, "^XA^FDfull^FS^XZ");
                assert!(std::fs::read_to_string(output).unwrap().contains("^FDfull"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!source.exists());
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
        queue.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_source_changed_after_read_is_kept() {
        use std::io::Write;

        let temp_dir = TempDir::new().unwrap();
        let queue = ProcessingQueue::new(
            fake_converter(Arc::new(FakeRenderer::slow(Duration::from_millis(300)))),
            fast_options(1),
        );
        let mut rx = queue.subscribe();

        let item = stamped(file_item(temp_dir.path(), "growing.prn", "^XA^FDhead^FS^XZ"));
        let source = item.source_path.clone();
        queue.enqueue(item);
        wait_until_processing(&queue).await;

        let mut writer = std::fs::OpenOptions::new().append(true).open(&source).unwrap();
        writer.write_all(b"^XA^FDtail^FS^XZ").unwrap();
        drop(writer);

        assert!(matches!(next_event(&mut rx).await, QueueEvent::Converted { .. }));
        assert!(source.exists());

        // no longer tracked, so the next read goes through
        let complete = stamped(file_item(temp_dir.path(), "growing.prn", "^XA^FDhead^FS^XZ^XA^FDtail^FS^XZ"));
        assert!(queue.enqueue(complete));
        assert!(matches!(next_event(&mut rx).await, QueueEvent::Converted { .. }));
        assert!(!source.exists());
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_same_stem_different_extension_writes_two_pdfs() {
        let temp_dir = TempDir::new().unwrap();
        let queue = ProcessingQueue::new(
            fake_converter(Arc::new(FakeRenderer::default())),
            fast_options(1),
        );
        let mut rx = queue.subscribe();

        queue.enqueue(file_item(temp_dir.path(), "a.txt", "^XA^FDfrom-txt^FS^XZ"));
        queue.enqueue(file_item(temp_dir.path(), "a.prn", "^XA^FDfrom-prn^FS^XZ"));
        for _ in 0..2 {
            assert!(matches!(next_event(&mut rx).await, QueueEvent::Converted { .. }));
        }

        let txt = std::fs::read_to_string(temp_dir.path().join("a.txt.pdf")).unwrap();
        let prn = std::fs::read_to_string(temp_dir.path().join("a.prn.pdf")).unwrap();
        assert!(txt.contains("from-txt"));
        assert!(prn.contains("from-prn"));
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_is_rejected() {
        let queue = ProcessingQueue::new(
            fake_converter(Arc::new(FakeRenderer::default())),
            fast_options(1),
        );
        queue.stop().await;
        queue.stop().await;
        assert!(queue.is_stopped());
        assert!(!queue.enqueue(WorkItem::from_content("x", String::new(), Vec::new())));
    }

    #[cfg(unix)]
    fn hold_lock(path: &Path) -> nix::fcntl::Flock<std::fs::File> {
        use nix::fcntl::{Flock, FlockArg};
        Flock::lock(std::fs::File::open(path).unwrap(), FlockArg::LockExclusive)
            .map_err(|(_, e)| e)
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permanently_locked_file_fails_after_retry_cap() {
        let temp_dir = TempDir::new().unwrap();
        let renderer = Arc::new(FakeRenderer::default());
        let mut options = fast_options(1);
        options.max_retries = 2;
        let queue = ProcessingQueue::new(fake_converter(renderer.clone()), options);
        let mut rx = queue.subscribe();

        let item = file_item(temp_dir.path(), "held.txt", "^XA^FDx^FS^XZ");
        let _holder = hold_lock(&item.source_path);
        queue.enqueue(item);

        match next_event(&mut rx).await {
            QueueEvent::Failed { item, error } => {
                assert_eq!(error, LOCKED_TOO_LONG);
                // max_retries + 1 attempts in total
                assert_eq!(item.retry_count, 3);
                assert!(item.source_path.exists());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
        queue.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lock_released_then_converted() {
        let temp_dir = TempDir::new().unwrap();
        let mut options = fast_options(1);
        options.max_retries = 50;
        let queue = ProcessingQueue::new(
            fake_converter(Arc::new(FakeRenderer::default())),
            options,
        );
        let mut rx = queue.subscribe();

        let item = file_item(temp_dir.path(), "late.prn", "^XA^FDx^FS^XZ");
        let holder = hold_lock(&item.source_path);
        queue.enqueue(item);

        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(holder);

        match next_event(&mut rx).await {
            QueueEvent::Converted { item, .. } => assert!(item.retry_count >= 1),
            other => panic!("unexpected event: {:?}", other),
        }
        queue.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_waits_for_in_flight_item() {
        let temp_dir = TempDir::new().unwrap();
        let queue = ProcessingQueue::new(
            fake_converter(Arc::new(FakeRenderer::slow(Duration::from_millis(400)))),
            fast_options(1),
        );
        let mut rx = queue.subscribe();

        queue.enqueue(file_item(temp_dir.path(), "slow.txt", "^XA^FDx^FS^XZ"));
        wait_until_processing(&queue).await;

        queue.stop().await;

        // the outcome was emitted before stop returned
        assert!(matches!(rx.try_recv(), Ok(QueueEvent::Converted { .. })));
        assert!(!queue.stats().is_processing);
    }

    /// Tracks how many renders overlap.
    #[derive(Default)]
    struct OverlapCounter {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl LabelRenderer for OverlapCounter {
        fn render(&self, _: &str, _: &Dimensions) -> Result<Vec<Vec<u8>>, ConvertError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![b"page".to_vec()])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_pool_is_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let counter = Arc::new(OverlapCounter::default());
        let converter = Converter::new(
            counter.clone(),
            Arc::new(crate::convert::testing::FakeAssembler),
        );
        let queue = ProcessingQueue::new(converter, fast_options(2));
        let mut rx = queue.subscribe();

        for i in 0..6 {
            queue.enqueue(file_item(temp_dir.path(), &format!("l{}.txt", i), "^XA^FDx^FS^XZ"));
        }
        for _ in 0..6 {
            assert!(matches!(next_event(&mut rx).await, QueueEvent::Converted { .. }));
        }

        assert!(counter.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.stats().converted, 6);
        queue.stop().await;
    }
}
