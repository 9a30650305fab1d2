//! Label PDF Daemon
//!
//! Watches a folder for label description files, converts each into a PDF
//! through a bounded worker pool, and manages its own background process.

pub mod concurrency;
pub mod convert;
pub mod daemon;
pub mod dimensions;
pub mod file_gate;
pub mod lifecycle;
pub mod metrics;
pub mod monitor;
pub mod process;
pub mod queue;
pub mod record;
pub mod startup;
pub mod watcher;
pub mod work_item;

pub use label_pdf_daemon_config as config;
pub use label_pdf_daemon_config::{Config, ConfigError, Unit};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use convert::{
    convert_file, output_path_for, CommandAssembler, CommandRenderer, ConvertError,
    ConvertReport, Converter, LabelRenderer, PdfAssembler,
};
pub use daemon::{absolute_folder, shutdown_signal, Daemon, DaemonError};
pub use dimensions::{
    extract_candidate, split_labels, DimensionMode, DimensionResolver, DimensionSource,
    Dimensions, LabelSpec,
};
pub use file_gate::{is_locked, LockState};
pub use lifecycle::{DaemonLifecycleManager, LifecycleError, LifecycleOptions, LifecycleState};
pub use metrics::QueueStats;
pub use monitor::{FolderMonitor, MonitorError, MonitorEvent, MonitorOptions};
pub use queue::{ProcessingQueue, QueueEvent, QueueOptions, LOCKED_TOO_LONG};
pub use record::{default_record_dir, DaemonRecord, RecordError, RecordStore};
pub use startup::{run_startup_checks, StartupError};
pub use watcher::ChangeKind;
pub use work_item::{SourceStamp, WorkItem};
