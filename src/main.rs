use std::net::Ipv4Addr;

use clap::Parser;
use mainline_dht::config::{Config, DEFAULT_PORT};
use mainline_dht::node::NodeId;
use mainline_dht::Dht;

#[derive(Parser, Debug)]
struct Cli {
    #[clap(long, default_value = "0.0.0.0", help = "address to bind the UDP socket to")]
    local_ip: Ipv4Addr,
    #[clap(long, default_value_t = DEFAULT_PORT, help = "port to bind the UDP socket to")]
    local_port: u16,
    #[clap(long, help = "20-byte hex node id; random if omitted")]
    self_id: Option<String>,
    #[clap(long, help = "host:port of a bootstrap router, repeatable; defaults to the mainline routers")]
    bootstrap: Vec<String>,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Config {
        let mut config = Config {
            local_ip: cli.local_ip,
            local_port: cli.local_port,
            self_id: cli.self_id.as_deref().and_then(NodeId::from_hex),
            bootstrap: cli.bootstrap,
        };
        if config.bootstrap.is_empty() {
            config.bootstrap = Config::default().bootstrap;
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();
    let config: Config = cli.into();

    let mut dht = Dht::new(&config)?;
    log::info!("node id {}", dht.self_id());

    loop {
        dht.step();
    }
}
