use authoriser_client::{RelayClient, DEFAULT_SOCKET_PATH};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "authoriser-fetch")]
#[command(about = "Print the password relayed by a running authoriser")]
struct Cli {
    /// Relay socket path
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Keep polling until the password has been submitted
    #[arg(long)]
    wait: bool,

    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,

    /// Delay between polls in milliseconds
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the secret, so logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authoriser_client=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let client = RelayClient::new(cli.socket);

    let secret = if cli.wait {
        client
            .wait_for_secret(
                Duration::from_millis(cli.poll_ms),
                Duration::from_secs(cli.timeout_secs),
            )
            .await?
    } else {
        client
            .fetch()
            .await?
            .ok_or_else(|| anyhow::anyhow!("No password has been submitted yet"))?
    };

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(secret.as_bytes())?;
    stdout.flush()?;
    Ok(())
}
