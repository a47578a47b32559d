use authoriser::{config::AuthoriserConfig, shutdown_signal, Coordinator};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Parser)]
#[command(name = "authoriser")]
#[command(about = "Collects a password through a one-shot public form and relays it on a local socket")]
#[command(version)]
struct Cli {
    /// Directory containing settings.toml
    #[arg(long, env = "AUTHORISER_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "authoriser=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting authoriser v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<authoriser::AuthoriserError>() {
                Some(inner) if inner.is_termination() => info!("{}", inner),
                _ => error!("{:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // The surrounding deployment historically exports YNAB_CONFIG_PATH
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var_os("YNAB_CONFIG_PATH").map(PathBuf::from));

    let config = AuthoriserConfig::load(config_dir.as_deref())?;
    info!(
        tunnel = ?config.tunnel.kind,
        socket = %config.relay.socket_path.display(),
        "Configuration loaded"
    );

    let coordinator = Coordinator::from_config(&config)?;
    coordinator.run(shutdown_signal()).await?;
    Ok(())
}
