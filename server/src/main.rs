use clap::Parser;
use log::info;
use server::connection_manager::ConnectionManager;
use server::game::World;
use server::network::Server;
use shared::{NetConfig, DEFAULT_PORT};
use std::net::{IpAddr, SocketAddr};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Address to bind to
    #[clap(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,
    /// Network ticks per second
    #[clap(short, long, default_value = "30")]
    tick_rate: u32,
    /// Connections accepted before new ones are refused
    #[clap(short, long, default_value = "32")]
    max_clients: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Hint: set RUST_LOG=info (or debug) to see server activity");
    }
    env_logger::init();

    let args = Args::parse();
    let addr = SocketAddr::new(args.bind, args.port);
    let config = NetConfig::default().with_max_peers(args.max_clients);

    info!(
        "Starting server on {} at {}Hz, max {} clients",
        addr, args.tick_rate, args.max_clients
    );

    let connections = ConnectionManager::open(addr, config)
        .await?
        .with_class_table(vec![(1, "Avatar".to_string())]);
    let server = Server::from_parts(connections, World::new());

    server.run(args.tick_rate).await?;

    Ok(())
}
