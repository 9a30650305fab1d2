//! Folder monitor: turns filesystem activity into work items.
//!
//! A backend thread (see [`crate::watcher`]) pushes raw notifications into a
//! bounded channel. A pump task filters them by extension, debounces per
//! path and spawns one settle task per file, which waits out the settle
//! delay, reads the file, resolves dimensions and enqueues a [`WorkItem`].

use crate::config::Config;
use crate::dimensions::{DimensionMode, DimensionResolver};
use crate::file_gate;
use crate::queue::ProcessingQueue;
use crate::watcher::{self, ChangeKind, RawChange, WatchHandle};
use crate::work_item::{SourceStamp, WorkItem};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RAW_CHANNEL_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 256;

/// Error type for monitor operations
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("cannot create watch folder {path}: {source}")]
    CreateFolder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot watch {path}: {source}")]
    Subscribe {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("monitor is already watching")]
    AlreadyWatching,
}

/// Observable monitor activity.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// A whitelisted file showed up or changed.
    FileDetected { path: PathBuf, kind: ChangeKind },
    /// The watch mechanism reported a problem.
    Error(String),
}

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub folder: PathBuf,
    /// Lowercase extensions without the dot
    pub extensions: Vec<String>,
    pub settle_delay: Duration,
    pub scan_existing: bool,
    pub mode: DimensionMode,
    pub density_dpi: u32,
    /// Use the polling backend even where a native one exists
    pub force_polling: Option<Duration>,
}

impl MonitorOptions {
    pub fn from_config(cfg: &Config, folder: PathBuf) -> Self {
        Self {
            folder,
            extensions: cfg
                .watch
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            settle_delay: Duration::from_millis(cfg.watch.settle_delay_ms),
            scan_existing: cfg.watch.scan_existing,
            mode: DimensionMode::from_config(&cfg.label),
            density_dpi: cfg.label.dpi,
            force_polling: None,
        }
    }

    /// True when `path` carries a whitelisted extension (case-insensitive).
    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }
}

struct Shared {
    options: MonitorOptions,
    resolver: DimensionResolver,
    queue: Arc<ProcessingQueue>,
    events: broadcast::Sender<MonitorEvent>,
    /// Paths inside their settle window
    pending: Mutex<HashSet<PathBuf>>,
}

impl Shared {
    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }
}

struct Running {
    watcher: WatchHandle,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

/// Watches one folder (non-recursive) and feeds the processing queue.
pub struct FolderMonitor {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl FolderMonitor {
    pub fn new(options: MonitorOptions, queue: Arc<ProcessingQueue>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let resolver = DimensionResolver::new(options.density_dpi);
        Self {
            shared: Arc::new(Shared {
                options,
                resolver,
                queue,
                events,
                pending: Mutex::new(HashSet::new()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.shared.events.subscribe()
    }

    pub fn folder(&self) -> &Path {
        &self.shared.options.folder
    }

    pub fn is_watching(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Create the folder if needed, subscribe to notifications and, when
    /// configured, sweep files already present.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start_watching(&self) -> Result<(), MonitorError> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(MonitorError::AlreadyWatching);
        }

        let folder = self.shared.options.folder.clone();
        if !folder.is_dir() {
            std::fs::create_dir_all(&folder).map_err(|source| MonitorError::CreateFolder {
                path: folder.clone(),
                source,
            })?;
            info!(folder = %folder.display(), "created watch folder");
        }

        let (tx, rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        let watcher = match self.shared.options.force_polling {
            Some(interval) => watcher::spawn_poll_watcher(&folder, tx, interval),
            None => watcher::spawn_watcher(&folder, tx),
        }
        .map_err(|source| MonitorError::Subscribe {
            path: folder.clone(),
            source,
        })?;

        let cancel = CancellationToken::new();
        let sweep = self.shared.options.scan_existing;
        let pump = tokio::spawn(pump(self.shared.clone(), rx, cancel.clone(), sweep));

        info!(
            folder = %folder.display(),
            extensions = ?self.shared.options.extensions,
            "watching folder"
        );
        *running = Some(Running {
            watcher,
            cancel,
            pump,
        });
        Ok(())
    }

    /// Unsubscribe and abandon pending settle windows. No-op when not
    /// watching.
    pub async fn stop_watching(&self) {
        let Some(mut running) = lock(&self.running).take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = (&mut running.pump).await {
            error!("monitor pump ended abnormally: {}", e);
        }

        // pump dropped the receiver, so a blocked backend send fails and the
        // thread exits
        let mut watcher = running.watcher;
        if tokio::task::spawn_blocking(move || watcher.stop()).await.is_err() {
            warn!("failed to join watcher thread");
        }
        lock(&self.shared.pending).clear();
        info!(folder = %self.shared.options.folder.display(), "stopped watching");
    }

}

impl Drop for FolderMonitor {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            running.cancel.cancel();
        }
    }
}

async fn pump(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<RawChange>,
    cancel: CancellationToken,
    sweep: bool,
) {
    let mut settles = JoinSet::new();
    if sweep {
        sweep_existing(&shared, &mut settles);
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(_) = settles.join_next(), if !settles.is_empty() => {}
            change = rx.recv() => match change {
                None => break,
                Some(RawChange::File { path, kind }) => {
                    if shared.options.accepts(&path) {
                        schedule(&shared, path, kind, &mut settles);
                    }
                }
                Some(RawChange::Overflow) => {
                    warn!("notification overflow, rescanning folder");
                    if let Ok(files) = watcher::list_files(&shared.options.folder) {
                        for path in files.into_iter().filter(|p| shared.options.accepts(p)) {
                            schedule(&shared, path, ChangeKind::Modified, &mut settles);
                        }
                    }
                }
                Some(RawChange::Lost(reason)) => {
                    error!("watcher error: {}", reason);
                    shared.emit(MonitorEvent::Error(reason));
                }
            },
        }
    }

    settles.shutdown().await;
}

/// Queue files already in the folder when watching starts.
fn sweep_existing(shared: &Arc<Shared>, settles: &mut JoinSet<()>) {
    match watcher::list_files(&shared.options.folder) {
        Ok(files) => {
            let accepted: Vec<_> = files
                .into_iter()
                .filter(|p| shared.options.accepts(p))
                .collect();
            if !accepted.is_empty() {
                info!(count = accepted.len(), "picking up files already in folder");
            }
            for path in accepted {
                schedule(shared, path, ChangeKind::Existing, settles);
            }
        }
        Err(e) => {
            warn!("initial sweep failed: {}", e);
            shared.emit(MonitorEvent::Error(format!("initial sweep failed: {}", e)));
        }
    }
}

/// Report the file and start its settle window unless one is already open.
fn schedule(shared: &Arc<Shared>, path: PathBuf, kind: ChangeKind, settles: &mut JoinSet<()>) {
    debug!(path = %path.display(), %kind, "file detected");
    shared.emit(MonitorEvent::FileDetected {
        path: path.clone(),
        kind,
    });

    if !lock(&shared.pending).insert(path.clone()) {
        debug!(path = %path.display(), "already settling");
        return;
    }

    settles.spawn(settle(shared.clone(), path));
}

async fn settle(shared: Arc<Shared>, path: PathBuf) {
    tokio::time::sleep(shared.options.settle_delay).await;
    lock(&shared.pending).remove(&path);

    if !path.is_file() {
        debug!(path = %path.display(), "gone before it settled");
        return;
    }
    if file_gate::is_locked(&path) {
        debug!(path = %path.display(), "still locked after settle delay, waiting for next change");
        return;
    }

    // Stamp before reading: a write landing in between makes the stamp
    // stale, which only keeps the source on disk.
    let stamp = match SourceStamp::of(&path) {
        Ok(stamp) => stamp,
        Err(e) => {
            warn!(path = %path.display(), "cannot stat file: {}", e);
            return;
        }
    };
    let content = match tokio::fs::read(&path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(path = %path.display(), "cannot read file: {}", e);
            return;
        }
    };
    if content.trim().is_empty() {
        debug!(path = %path.display(), "empty file ignored");
        return;
    }

    let labels = shared
        .resolver
        .resolve_content(&content, shared.options.mode);
    if labels.is_empty() {
        debug!(path = %path.display(), "no labels in file");
        return;
    }
    for (index, label) in labels.iter().enumerate() {
        debug!(
            path = %path.display(),
            index,
            dimensions = %label.dimensions,
            "resolved label"
        );
    }

    shared
        .queue
        .enqueue(WorkItem::from_file(path, content, labels).with_source_stamp(stamp));
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::testing::{fake_converter, FakeRenderer};
    use crate::dimensions::DimensionSource;
    use crate::queue::{QueueEvent, QueueOptions};
    use tempfile::TempDir;

    fn options(folder: PathBuf) -> MonitorOptions {
        MonitorOptions {
            folder,
            extensions: vec!["txt".to_string(), "prn".to_string()],
            settle_delay: Duration::from_millis(50),
            scan_existing: false,
            mode: DimensionMode::PerLabel,
            density_dpi: 203,
            force_polling: None,
        }
    }

    fn queue() -> Arc<ProcessingQueue> {
        Arc::new(ProcessingQueue::new(
            fake_converter(Arc::new(FakeRenderer::default())),
            QueueOptions {
                max_concurrent_files: 1,
                max_retries: 3,
                retry_delay: Duration::from_millis(20),
                idle_poll: Duration::from_millis(20),
            },
        ))
    }

    async fn next_queue_event(rx: &mut broadcast::Receiver<QueueEvent>) -> QueueEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for queue event")
            .expect("event channel closed")
    }

    #[test]
    fn test_accepts_is_case_insensitive() {
        let opts = options(PathBuf::from("/in"));
        assert!(opts.accepts(Path::new("/in/a.TXT")));
        assert!(opts.accepts(Path::new("/in/b.prn")));
        assert!(!opts.accepts(Path::new("/in/c.pdf")));
        assert!(!opts.accepts(Path::new("/in/noext")));
    }

    #[test]
    fn test_options_from_config_normalizes_extensions() {
        let mut cfg = Config::default();
        cfg.watch.extensions = vec![".ZPL".to_string()];
        let opts = MonitorOptions::from_config(&cfg, PathBuf::from("/in"));
        assert_eq!(opts.extensions, vec!["zpl"]);
        assert_eq!(opts.mode, DimensionMode::PerLabel);
    }

    #[tokio::test]
    async fn test_creates_missing_folder() {
        let temp_dir = TempDir::new().unwrap();
        let folder = temp_dir.path().join("nested").join("inbox");
        let monitor = FolderMonitor::new(options(folder.clone()), queue());

        monitor.start_watching().unwrap();
        assert!(folder.is_dir());
        assert!(monitor.is_watching());
        assert!(matches!(
            monitor.start_watching(),
            Err(MonitorError::AlreadyWatching)
        ));

        monitor.stop_watching().await;
        assert!(!monitor.is_watching());
        // second stop is a no-op
        monitor.stop_watching().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_label_file_resolves_per_label() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue();
        let mut queue_rx = queue.subscribe();
        let monitor = FolderMonitor::new(options(temp_dir.path().to_path_buf()), queue.clone());
        monitor.start_watching().unwrap();

        let path = temp_dir.path().join("pair.txt");
        std::fs::write(
            &path,
            "^XA^PW812^LL1218^FDfirst^FS^XZ\n^XA^FDsecond^FS^XZ\n",
        )
        .unwrap();

        match next_queue_event(&mut queue_rx).await {
            QueueEvent::Converted { item, .. } => {
                assert_eq!(item.source_path, path);
                let sources: Vec<_> = item.dimensions().map(|d| d.source()).collect();
                assert_eq!(
                    sources,
                    vec![DimensionSource::Extracted, DimensionSource::Default]
                );
                let first = item.labels()[0].dimensions;
                assert!((first.width_mm() - 101.6).abs() < 0.01);
                assert!((first.height_mm() - 152.4).abs() < 0.01);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!path.exists());

        monitor.stop_watching().await;
        queue.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fixed_mode_applies_to_every_label() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue();
        let mut queue_rx = queue.subscribe();
        let mut opts = options(temp_dir.path().to_path_buf());
        opts.mode = DimensionMode::Fixed {
            width: 4.0,
            height: 6.0,
            unit: crate::config::Unit::In,
        };
        let monitor = FolderMonitor::new(opts, queue.clone());
        monitor.start_watching().unwrap();

        std::fs::write(
            temp_dir.path().join("fixed.prn"),
            "^XA^PW400^LL400^FDa^FS^XZ^XA^FDb^FS^XZ",
        )
        .unwrap();

        match next_queue_event(&mut queue_rx).await {
            QueueEvent::Converted { item, .. } => {
                assert_eq!(item.labels().len(), 2);
                for dims in item.dimensions() {
                    assert_eq!(dims.source(), DimensionSource::Explicit);
                    assert!((dims.width_mm() - 101.6).abs() < 0.01);
                }
            }
            other => panic!("unexpected event: {:?}", other),
        }

        monitor.stop_watching().await;
        queue.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ignores_other_extensions_and_empty_files() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue();
        let mut queue_rx = queue.subscribe();
        let monitor = FolderMonitor::new(options(temp_dir.path().to_path_buf()), queue.clone());
        let mut monitor_rx = monitor.subscribe();
        monitor.start_watching().unwrap();

        std::fs::write(temp_dir.path().join("notes.md"), "^XA^FDx^FS^XZ").unwrap();
        std::fs::write(temp_dir.path().join("blank.txt"), "   \n").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(queue_rx.try_recv().is_err());
        assert_eq!(queue.stats().converted + queue.stats().failed, 0);
        assert!(temp_dir.path().join("notes.md").exists());
        assert!(temp_dir.path().join("blank.txt").exists());

        // only the whitelisted file was reported
        while let Ok(event) = monitor_rx.try_recv() {
            if let MonitorEvent::FileDetected { path, .. } = event {
                assert_eq!(path, temp_dir.path().join("blank.txt"));
            }
        }

        monitor.stop_watching().await;
        queue.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initial_sweep_picks_up_existing_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("waiting.txt"), "^XA^FDx^FS^XZ").unwrap();

        let queue = queue();
        let mut queue_rx = queue.subscribe();
        let mut opts = options(temp_dir.path().to_path_buf());
        opts.scan_existing = true;
        let monitor = FolderMonitor::new(opts, queue.clone());
        monitor.start_watching().unwrap();

        match next_queue_event(&mut queue_rx).await {
            QueueEvent::Converted { item, .. } => assert_eq!(item.file_name, "waiting.txt"),
            other => panic!("unexpected event: {:?}", other),
        }

        monitor.stop_watching().await;
        queue.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_abandons_initial_sweep() {
        let temp_dir = TempDir::new().unwrap();
        let waiting = temp_dir.path().join("waiting.txt");
        std::fs::write(&waiting, "^XA^FDx^FS^XZ").unwrap();

        let queue = queue();
        let mut queue_rx = queue.subscribe();
        let mut opts = options(temp_dir.path().to_path_buf());
        opts.scan_existing = true;
        opts.settle_delay = Duration::from_millis(300);
        let monitor = FolderMonitor::new(opts, queue.clone());
        monitor.start_watching().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop_watching().await;

        // past the settle delay: nothing was enqueued after the stop
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(queue_rx.try_recv().is_err());
        assert_eq!(queue.stats().queue_length, 0);
        assert!(waiting.exists());
        queue.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_writer_source_is_never_lost() {
        use std::io::Write;

        let temp_dir = TempDir::new().unwrap();
        let queue = Arc::new(ProcessingQueue::new(
            fake_converter(Arc::new(FakeRenderer::slow(Duration::from_millis(200)))),
            QueueOptions {
                max_concurrent_files: 1,
                max_retries: 3,
                retry_delay: Duration::from_millis(20),
                idle_poll: Duration::from_millis(20),
            },
        ));
        let mut opts = options(temp_dir.path().to_path_buf());
        opts.force_polling = Some(Duration::from_millis(30));
        let monitor = FolderMonitor::new(opts, queue.clone());
        monitor.start_watching().unwrap();

        // first label lands, settles and starts converting before the rest
        let path = temp_dir.path().join("order.txt");
        let mut writer = std::fs::File::create(&path).unwrap();
        writer.write_all(b"^XA^FDfirst^FS^XZ").unwrap();
        writer.flush().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.stats().is_processing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first label never picked up");
        writer.write_all(b"^XA^FDsecond^FS^XZ").unwrap();
        drop(writer);

        // the source goes only once a conversion matched the file on disk
        tokio::time::timeout(Duration::from_secs(10), async {
            while path.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("source never converted in full");
        let pdf = std::fs::read_to_string(temp_dir.path().join("order.txt.pdf")).unwrap();
        assert!(pdf.contains("^FDfirst"));
        assert!(pdf.contains("^FDsecond"));

        monitor.stop_watching().await;
        queue.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_polling_backend_feeds_queue() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue();
        let mut queue_rx = queue.subscribe();
        let mut opts = options(temp_dir.path().to_path_buf());
        opts.force_polling = Some(Duration::from_millis(30));
        let monitor = FolderMonitor::new(opts, queue.clone());
        monitor.start_watching().unwrap();

        std::fs::write(temp_dir.path().join("polled.prn"), "^XA^FDx^FS^XZ").unwrap();
        assert!(matches!(
            next_queue_event(&mut queue_rx).await,
            QueueEvent::Converted { .. }
        ));

        monitor.stop_watching().await;
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_removed_folder_reports_error() {
        let temp_dir = TempDir::new().unwrap();
        let folder = temp_dir.path().join("inbox");
        let mut opts = options(folder.clone());
        opts.force_polling = Some(Duration::from_millis(20));
        let monitor = FolderMonitor::new(opts, queue());
        let mut monitor_rx = monitor.subscribe();
        monitor.start_watching().unwrap();

        std::fs::remove_dir(&folder).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(MonitorEvent::Error(reason)) = monitor_rx.recv().await {
                    return reason;
                }
            }
        })
        .await
        .expect("no error event");
        assert!(event.contains("inbox"));

        monitor.stop_watching().await;
    }
}
