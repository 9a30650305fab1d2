//! CLI entry point for the label PDF daemon
//!
//! `start` launches the watch loop in the background, `stop` and `status`
//! act on the recorded instance, `run` is the loop itself (what `start`
//! spawns) and `convert` does a single file in the foreground.

use clap::{ArgAction, Args, Parser, Subcommand};
use label_pdf_daemon::{
    absolute_folder, convert_file, run_startup_checks, Config, ConfigError, Converter, Daemon,
    DaemonLifecycleManager, DimensionMode, DimensionResolver, LifecycleError, LifecycleOptions,
    RecordStore, Unit,
};
use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Label PDF Daemon - converts label files dropped into a folder into PDFs
#[derive(Parser, Debug)]
#[command(name = "label-pdf-daemon")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon in the background
    #[command(disable_help_flag = true)]
    Start(LabelArgs),

    /// Stop the running daemon
    Stop(RecordArgs),

    /// Show whether the daemon is running and with which settings
    Status {
        /// Print the record as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        record: RecordArgs,
    },

    /// Run the watch loop in the foreground (used by `start`)
    #[command(hide = true, disable_help_flag = true)]
    Run(LabelArgs),

    /// Convert one file and exit
    #[command(disable_help_flag = true)]
    Convert {
        /// Label file to convert
        #[arg(short = 'i', long)]
        input: PathBuf,

        /// PDF to write (defaults to <input file name>.pdf)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        label: LabelArgs,
    },
}

/// Settings shared by `start`, `run` and `convert`. `-h` is the height.
#[derive(Args, Debug, Clone, Default)]
struct LabelArgs {
    /// Folder to watch
    #[arg(short = 'l', long = "listen")]
    listen: Option<PathBuf>,

    /// Fixed label width (with --height; overrides per-label sizes)
    #[arg(short = 'w', long)]
    width: Option<f64>,

    /// Fixed label height
    #[arg(short = 'h', long)]
    height: Option<f64>,

    /// Unit for width and height: mm, cm or in
    #[arg(short = 'u', long)]
    unit: Option<String>,

    /// Print density in dots per inch
    #[arg(short = 'd', long)]
    dpi: Option<u32>,

    /// Path to a config.toml
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Directory for the PID/record and log file
    #[arg(long)]
    pid_dir: Option<PathBuf>,

    /// Skip checking that the renderer and assembler are installed
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

#[derive(Args, Debug, Clone, Default)]
struct RecordArgs {
    /// Path to a config.toml
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Directory for the PID/record file
    #[arg(long)]
    pid_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Command::Run(_) => "info",
        _ => "warn",
    };
    init_tracing(default_level);

    match cli.command {
        Command::Start(args) => start(args).await,
        Command::Stop(args) => stop(args).await,
        Command::Status { json, record } => status(record, json),
        Command::Run(args) => run(args).await,
        Command::Convert {
            input,
            output,
            label,
        } => convert(label, &input, output.as_deref()).await,
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal())
                .with_target(false),
        )
        .init();
}

/// File, then environment, then flags.
fn build_config(args: &LabelArgs) -> Result<Config, ConfigError> {
    let mut config = Config::load_optional(args.config.as_deref())?;

    if let Some(folder) = &args.listen {
        config.watch.folder = Some(folder.clone());
    }
    if let Some(folder) = config.watch.folder.take() {
        config.watch.folder = Some(absolute_folder(&folder));
    }
    if args.width.is_some() {
        config.label.width = args.width;
    }
    if args.height.is_some() {
        config.label.height = args.height;
    }
    if let Some(unit) = &args.unit {
        config.label.unit = Unit::parse_lossy(unit);
    }
    if let Some(dpi) = args.dpi {
        config.label.dpi = dpi;
    }
    if let Some(dir) = &args.pid_dir {
        config.daemon.pid_dir = Some(absolute_folder(dir));
    }

    config.validate()?;
    Ok(config)
}

fn record_config(args: &RecordArgs) -> Result<Config, ConfigError> {
    let mut config = Config::load_optional(args.config.as_deref())?;
    if let Some(dir) = &args.pid_dir {
        config.daemon.pid_dir = Some(absolute_folder(dir));
    }
    Ok(config)
}

/// Arguments that make the spawned process run the loop with the resolved
/// settings.
fn run_args(args: &LabelArgs, config: &Config, folder: &Path, record_dir: &Path) -> Vec<OsString> {
    let mut out: Vec<OsString> = vec![
        "run".into(),
        "-l".into(),
        folder.as_os_str().to_owned(),
        "-u".into(),
        config.label.unit.as_str().into(),
        "-d".into(),
        config.label.dpi.to_string().into(),
        "--pid-dir".into(),
        record_dir.as_os_str().to_owned(),
    ];
    if let (Some(w), Some(h)) = (config.label.width, config.label.height) {
        out.extend(["-w".into(), w.to_string().into(), "-h".into(), h.to_string().into()]);
    }
    if let Some(path) = &args.config {
        out.extend(["-c".into(), absolute_folder(path).into_os_string()]);
    }
    if args.skip_checks {
        out.push("--skip-checks".into());
    }
    out
}

async fn start(args: LabelArgs) -> ExitCode {
    let config = match build_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let folder = match config.require_folder() {
        Ok(f) => f.to_path_buf(),
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if !args.skip_checks {
        if let Err(e) = run_startup_checks(&config) {
            eprintln!("Startup check failed: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let store = RecordStore::from_config(&config);
    let spawn_args = run_args(&args, &config, &folder, store.dir());
    let mut options =
        match LifecycleOptions::for_current_exe(store.dir().to_path_buf(), folder, spawn_args) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("Failed to start daemon: {}", e);
                return ExitCode::FAILURE;
            }
        };
    options.start_timeout = Duration::from_secs(config.daemon.start_timeout_secs);
    options.stop_timeout = Duration::from_secs(config.daemon.stop_timeout_secs);

    let manager = DaemonLifecycleManager::new(options);
    match manager.start().await {
        Ok(record) => {
            println!("Daemon started");
            println!("{}", record);
            println!("Log:        {}", manager.log_path().display());
            ExitCode::SUCCESS
        }
        Err(LifecycleError::AlreadyRunning(record)) => {
            eprintln!("Daemon is already running");
            eprintln!("{}", record);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Failed to start daemon: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn manager_for(config: &Config) -> Result<DaemonLifecycleManager, LifecycleError> {
    let store = RecordStore::from_config(config);
    let mut options =
        LifecycleOptions::for_current_exe(store.dir().to_path_buf(), PathBuf::new(), Vec::new())?;
    options.stop_timeout = Duration::from_secs(config.daemon.stop_timeout_secs);
    Ok(DaemonLifecycleManager::new(options))
}

async fn stop(args: RecordArgs) -> ExitCode {
    let manager = match record_config(&args)
        .map_err(|e| e.to_string())
        .and_then(|c| manager_for(&c).map_err(|e| e.to_string()))
    {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match manager.stop().await {
        Ok(record) => {
            println!("Daemon stopped (PID {})", record.process_id);
            ExitCode::SUCCESS
        }
        Err(LifecycleError::NotRunning) => {
            eprintln!("Daemon is not running");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Failed to stop daemon: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn status(args: RecordArgs, json: bool) -> ExitCode {
    let config = match record_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let record = RecordStore::from_config(&config).load_live();

    if json {
        let body = serde_json::json!({
            "running": record.is_some(),
            "record": record,
        });
        match serde_json::to_string_pretty(&body) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Failed to encode status: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        match &record {
            Some(r) => {
                println!("Daemon is running");
                println!("{}", r);
            }
            None => println!("Daemon is not running"),
        }
    }

    if record.is_some() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(args: LabelArgs) -> ExitCode {
    let config = match build_config(&args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let daemon = if args.skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::new(config)
    };

    match daemon {
        Ok(daemon) => match daemon.run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("daemon error: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            tracing::error!("failed to initialize daemon: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn convert(args: LabelArgs, input: &Path, output: Option<&Path>) -> ExitCode {
    let config = match build_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if !args.skip_checks {
        if let Err(e) = run_startup_checks(&config) {
            eprintln!("Startup check failed: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let converter = Converter::from_config(&config.converter);
    let resolver = DimensionResolver::new(config.label.dpi);
    let mode = DimensionMode::from_config(&config.label);
    let input = input.to_path_buf();
    let output = output.map(Path::to_path_buf);

    let result = tokio::task::spawn_blocking(move || {
        convert_file(&converter, &resolver, mode, &input, output.as_deref())
    })
    .await;

    match result {
        Ok(Ok(report)) => {
            for (i, label) in report.labels.iter().enumerate() {
                println!("label {}: {}", i + 1, label.dimensions);
            }
            println!(
                "Wrote {} page(s) to {}",
                report.pages,
                report.output.display()
            );
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            eprintln!("Conversion failed: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Conversion task failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
