use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod client;
mod protocol;
mod systems;

const PORT: u16 = 5000;

#[derive(Debug, Parser)]
struct Args {
    /// Address for the server to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[derive(Debug, Clone)]
pub struct SharedSystems {
    ticket: systems::ticket::Handler,
    record: systems::record::Handler,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let ticket_system = systems::ticket::System::start();
    let record_system = systems::record::System::start(ticket_system.clone());

    let shared_systems = SharedSystems {
        ticket: ticket_system,
        record: record_system,
    };

    let listener = TcpListener::bind((args.host.as_str(), PORT)).await?;
    info!("listening on {}", listener.local_addr()?);

    let clients: Arc<DashMap<u64, SocketAddr>> = Arc::new(DashMap::new());
    let mut next_client_id = 0u64;

    loop {
        let (conn, addr) = listener.accept().await?;

        let id = next_client_id;
        next_client_id += 1;

        clients.insert(id, addr);
        info!(%addr, connected = clients.len(), "client connected");

        let systems = shared_systems.clone();
        let clients = Arc::clone(&clients);
        tokio::spawn(async move {
            let result = client::handle(conn, systems).await;

            clients.remove(&id);
            info!(%addr, connected = clients.len(), "client disconnected");

            if let Err(error) = result {
                debug!(%addr, %error, "connection ended with error");
            }
        });
    }
}
