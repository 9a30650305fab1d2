//! Watch loop for the label daemon
//!
//! Wires the processing queue and folder monitor together, publishes the
//! daemon record while running and tears everything down on shutdown.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::convert::Converter;
use crate::metrics::QueueStats;
use crate::monitor::{FolderMonitor, MonitorError, MonitorEvent, MonitorOptions};
use crate::queue::{ProcessingQueue, QueueEvent, QueueOptions};
use crate::record::{DaemonRecord, RecordError, RecordStore};
use crate::startup::{run_startup_checks, StartupError};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Folder monitor could not start
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Daemon record could not be written
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// A different live process owns the record
    #[error("another daemon is already running (PID {})", .0.process_id)]
    AlreadyRunning(DaemonRecord),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file, environment and flags
    pub config: Config,
    /// Watched folder
    pub folder: PathBuf,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    queue: Arc<ProcessingQueue>,
    monitor: FolderMonitor,
    store: RecordStore,
}

impl Daemon {
    /// Validate the configuration, run startup checks and build the
    /// components.
    ///
    /// Must be called inside a Tokio runtime: the queue's dispatch loop
    /// starts here.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        run_startup_checks(&config)?;
        let converter = Converter::from_config(&config.converter);
        Self::with_converter(config, converter)
    }

    /// Like [`Daemon::new`] but skipping the program checks.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        let converter = Converter::from_config(&config.converter);
        Self::with_converter(config, converter)
    }

    /// Build around a caller-supplied converter.
    pub fn with_converter(config: Config, converter: Converter) -> Result<Self, DaemonError> {
        let folder = config.require_folder()?.to_path_buf();
        let concurrency_plan = derive_plan(&config);

        let mut queue_options = QueueOptions::from_config(&config);
        queue_options.max_concurrent_files = concurrency_plan.max_concurrent_files;
        let queue = Arc::new(ProcessingQueue::new(converter, queue_options));

        let monitor = FolderMonitor::new(
            MonitorOptions::from_config(&config, folder.clone()),
            queue.clone(),
        );
        let store = RecordStore::from_config(&config);

        Ok(Self {
            config,
            folder,
            concurrency_plan,
            queue,
            monitor,
            store,
        })
    }

    pub fn queue(&self) -> &Arc<ProcessingQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &FolderMonitor {
        &self.monitor
    }

    pub fn record_store(&self) -> &RecordStore {
        &self.store
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` completes.
    ///
    /// The record is written once the monitor is subscribed and removed on
    /// the way out, unless another process has replaced it meanwhile.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        let pid = std::process::id();
        if let Some(existing) = self.store.load_live() {
            if existing.process_id != pid {
                return Err(DaemonError::AlreadyRunning(existing));
            }
        }

        self.monitor.start_watching()?;

        let record = DaemonRecord::for_current_process(&self.config, &self.folder);
        if let Err(e) = self.store.write(&record) {
            self.monitor.stop_watching().await;
            self.queue.stop().await;
            return Err(e.into());
        }

        info!(
            pid,
            folder = %self.folder.display(),
            record = %self.store.path().display(),
            max_concurrent_files = self.concurrency_plan.max_concurrent_files,
            "daemon running"
        );

        let reporter = tokio::spawn(report_events(
            self.queue.clone(),
            self.queue.subscribe(),
            self.monitor.subscribe(),
        ));

        shutdown.await;
        info!("shutdown requested");

        self.monitor.stop_watching().await;
        self.queue.stop().await;
        reporter.abort();

        match self.store.remove_if_owned(pid) {
            Ok(true) => debug!("daemon record removed"),
            Ok(false) => warn!("daemon record no longer names this process, leaving it"),
            Err(e) => error!("could not remove daemon record: {}", e),
        }

        let stats = self.queue.stats();
        info!(
            converted = stats.converted,
            failed = stats.failed,
            abandoned = stats.queue_length,
            "daemon stopped"
        );
        Ok(())
    }
}

async fn report_events(
    queue: Arc<ProcessingQueue>,
    mut queue_rx: tokio::sync::broadcast::Receiver<QueueEvent>,
    mut monitor_rx: tokio::sync::broadcast::Receiver<MonitorEvent>,
) {
    loop {
        tokio::select! {
            event = queue_rx.recv() => match event {
                Ok(QueueEvent::Converted { .. }) => {
                    let stats = queue.stats();
                    debug!(queued = stats.queue_length, converted = stats.converted, "queue status");
                }
                Ok(QueueEvent::Failed { item, .. }) => {
                    if let Some(source) = item.source() {
                        warn!(path = %source.display(), "left in place for inspection");
                    }
                }
                Err(RecvError::Lagged(n)) => debug!(skipped = n, "event reporter lagged"),
                Err(RecvError::Closed) => break,
            },
            event = monitor_rx.recv() => match event {
                Ok(MonitorEvent::Error(reason)) => {
                    warn!("watcher reported a problem, conversions of already queued files continue: {}", reason);
                }
                Ok(MonitorEvent::FileDetected { .. }) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Completes on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Resolve the watched folder against the working directory.
pub fn absolute_folder(folder: &Path) -> PathBuf {
    if folder.is_absolute() {
        folder.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(folder))
            .unwrap_or_else(|_| folder.to_path_buf())
    }
}
