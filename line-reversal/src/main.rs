use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use line_reversal::Listener;

const PORT: u16 = 5000;

#[derive(Debug, Parser)]
struct Args {
    /// Address for the server to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let listener = Listener::bind((args.host.as_str(), PORT)).await?;
    info!("listening on {}", listener.local_addr());

    line_reversal::run(listener).await?;

    Ok(())
}
