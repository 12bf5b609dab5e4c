//! vigil-server - home security appliance core
//!
//! Entry point for the server binary.

use anyhow::Result;
use clap::Parser;
use std::fs::File;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

use vigil_server::config::{Config, LoggingConfig};
use vigil_server::server::VigilServer;

/// Command-line arguments for vigil-server
#[derive(Parser, Debug)]
#[command(name = "vigil-server")]
#[command(version, about = "Home security appliance core", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, env = "VIGIL_CONFIG", default_value = "/etc/vigil/config.toml")]
    pub config: String,

    /// Listen address
    #[arg(short, long, env = "VIGIL_LISTEN")]
    pub listen: Option<String>,

    /// Listen port
    #[arg(short, long, env = "VIGIL_PORT")]
    pub port: Option<u16>,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Write logs to file (in addition to stdout)
    #[arg(long)]
    pub log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logging settings live in the config file, so read it before anything is logged.
    let loaded = Config::load(&args.config);
    let logging = loaded
        .as_ref()
        .map(|config| config.logging.clone())
        .unwrap_or_default();
    let _log_guard = init_logging(&args, &logging)?;

    info!("════════════════════════════════════════════════════════");
    info!("  vigil-server v{}", env!("CARGO_PKG_VERSION"));
    info!("  Built: {} {}", env!("BUILD_DATE"), env!("BUILD_TIME"));
    info!("  Commit: {}", env!("GIT_HASH"));
    info!("  Profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });
    info!("════════════════════════════════════════════════════════");

    let config = match loaded {
        Ok(config) => config.with_overrides(args.listen.clone(), args.port),
        Err(e) => {
            eprintln!("{}", vigil_server::utils::format_user_error(&e));
            return Err(e);
        }
    };
    // Overrides can change the listen address
    if let Err(e) = config.validate() {
        eprintln!("{}", vigil_server::utils::format_user_error(&e));
        return Err(e);
    }

    info!("Configuration loaded from {}", args.config);
    tracing::debug!("Config: {:?}", config);

    info!("Initializing vigil server");
    let server = match VigilServer::new(config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", vigil_server::utils::format_user_error(&e));
            return Err(e);
        }
    };

    info!("Starting vigil server");
    if let Err(e) = server.run().await {
        eprintln!("{}", vigil_server::utils::format_user_error(&e));
        return Err(e);
    }

    info!("vigil server shut down");
    Ok(())
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn fmt_layer<W>(format: &str, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(ansi)
        .with_writer(writer);
    match format {
        "json" => layer.json().boxed(),
        "compact" => layer.compact().boxed(),
        _ if ansi => layer.pretty().boxed(),
        _ => layer.boxed(),
    }
}

/// Install the global subscriber
///
/// The returned guard flushes the rolling file writer and must live until exit.
fn init_logging(args: &Args, logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let log_level = match args.verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Websocket internals log every frame at debug
        tracing_subscriber::EnvFilter::new(format!(
            "vigil_server={level},tungstenite=info,tokio_tungstenite=info,warn",
            level = log_level
        ))
    });

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(&args.log_format, std::io::stdout, true)];

    if let Some(log_file_path) = &args.log_file {
        let file = File::create(log_file_path)?;
        layers.push(fmt_layer(&args.log_format, file, false));
    }

    let guard = match &logging.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "vigil-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt_layer(&args.log_format, writer, false));
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .init();

    if let Some(log_file_path) = &args.log_file {
        info!("Logging to file: {}", log_file_path);
    }
    if let Some(dir) = &logging.log_dir {
        info!("Rolling logs in {}", dir.display());
    }

    Ok(guard)
}
