use std::{error::Error, path::PathBuf, process, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;

use castlink::{
    backoff::BackoffConfig,
    config::{self, default_storage_path, Config},
    device::DeviceBackend,
    server::ControlServer,
    session::Session,
    signal,
    sim::{self, SimBackend},
    storage::{CredentialStore, FileStore},
    wake,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Reconnection aggressiveness presets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum BackoffProfile {
    #[default]
    Normal,
    /// Retry sooner and longer. For setups where the device sleeps often.
    Aggressive,
    /// Retry later and give up earlier. For congested networks.
    Conservative,
}

impl BackoffProfile {
    fn config(self) -> BackoffConfig {
        match self {
            Self::Normal => BackoffConfig::default(),
            Self::Aggressive => BackoffConfig::aggressive(),
            Self::Conservative => BackoffConfig::conservative(),
        }
    }
}

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run against a built-in simulated device
    ///
    /// No real device-control backend is linked into this binary; the
    /// simulator exercises the full request surface without hardware.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Reconnection backoff profile
    #[arg(long, value_enum, default_value_t = BackoffProfile::Normal)]
    backoff: BackoffProfile,

    /// Credentials file
    ///
    /// [default: platform config directory]
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    storage: Option<PathBuf>,

    /// Network scan duration in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = config::DEFAULT_SCAN_TIMEOUT)]
    scan_timeout: u64,

    /// Heartbeat gap in seconds treated as a system wake
    #[arg(long, value_name = "SECONDS", default_value_t = config::DEFAULT_WAKE_GAP)]
    wake_gap: u64,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(env!("CARGO_PKG_NAME"), level);
    }

    logger.init();
}

/// Main application loop: serve requests on stdin/stdout until the stream
/// closes or a shutdown signal arrives.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = Config {
        backoff: args.backoff.config(),
        scan_timeout: Duration::from_secs(args.scan_timeout),
        wake_gap: Duration::from_secs(args.wake_gap),
        storage_path: args.storage.clone().unwrap_or_else(default_storage_path),
    };

    let backend: Arc<dyn DeviceBackend> = if args.simulate {
        let (backend, controller) = SimBackend::new();
        controller.set_devices(vec![sim::device(
            "sim-1",
            "Simulated Living Room",
            [127, 0, 0, 2],
        )]);
        info!("using the simulated device backend");
        Arc::new(backend)
    } else {
        return Err(format!(
            "no device-control backend is built into this binary; \
             run with --simulate, or embed {} as a library",
            env!("CARGO_PKG_NAME")
        )
        .into());
    };

    let storage = Arc::new(FileStore::new(config.storage_path.clone()));
    if let Err(e) = storage.load().await {
        // A broken credentials file should not prevent startup; devices can
        // be re-paired.
        warn!("could not load credentials: {e}");
    }

    let (sink, notifications) = tokio::sync::mpsc::unbounded_channel();
    let session = Session::new(
        backend,
        storage,
        sink.clone(),
        config.backoff,
        config.scan_timeout,
    );

    let wake_token = CancellationToken::new();
    let wake_task = tokio::spawn(wake::monitor(
        session.clone(),
        config.wake_gap,
        wake_token.clone(),
    ));

    let server = ControlServer::new(session.clone(), sink, config.scan_timeout);
    let mut signals = signal::Handler::new()?;

    let result = tokio::select! {
        result = server.run(tokio::io::stdin(), tokio::io::stdout(), notifications) => result,
        signal = signals.recv() => {
            info!("received {signal}, shutting down gracefully");
            Ok(())
        }
    };

    wake_token.cancel();
    let _ = wake_task.await;
    session.disconnect().await;
    result.map_err(Into::into)
}

/// Main entry point of the application.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {args:#?}");

    info!(
        "starting {}/{}; {BUILD_PROFILE}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
