use clap::Parser;
use magnet2torrent::cache::{FileCache, MetadataCache};
use magnet2torrent::dht::DhtNode;
use magnet2torrent::id::Id20;
use magnet2torrent::magnet::MagnetRequest;
use magnet2torrent::resolver::{Resolver, ResolverConfig};
use std::time::Duration;

/// Resolves a BitTorrent magnet link down to a `.torrent` file.
#[derive(Parser, Debug)]
struct Cli {
    /// the magnet: URI to resolve
    magnet: String,

    #[clap(short, long, default_value = ".", help = "directory to write the .torrent file into")]
    out: String,

    #[clap(long, default_value_t = 50, help = "maximum concurrent peer-wire sessions")]
    pool_size: usize,

    #[clap(long, help = "enable the DHT as a peer discovery source")]
    dht: bool,

    #[clap(long, default_value_t = 6881, help = "UDP port for the DHT node, if enabled")]
    dht_port: u16,

    #[clap(long, help = "directory for a persistent on-disk metadata cache; omit for no cache")]
    cache_dir: Option<String>,

    #[clap(long, default_value_t = 120, help = "overall resolution budget in seconds")]
    timeout_secs: u64,
}

fn main() {
    pretty_env_logger::init();
    let args = Cli::parse();

    if let Err(e) = run(&args) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: &Cli) -> anyhow::Result<()> {
    let magnet = MagnetRequest::parse(&args.magnet)?;

    let cache: Option<Box<dyn MetadataCache>> = match &args.cache_dir {
        Some(dir) => Some(Box::new(FileCache::new(dir)?)),
        None => None,
    };

    let dht = if args.dht {
        let mut node = DhtNode::listen(args.dht_port, Id20::random())?;
        node.bootstrap(&default_bootstrap_nodes())?;
        Some(node)
    } else {
        None
    };

    let config = ResolverConfig {
        peer_pool: magnet2torrent::peer::manager::PeerManagerConfig {
            pool_size: args.pool_size,
            ..Default::default()
        },
        request_budget: Duration::from_secs(args.timeout_secs),
        ..Default::default()
    };

    let resolver = Resolver::new(config, dht, cache);
    let (filename, bytes) = resolver.retrieve_torrent(&magnet)?;

    let path = std::path::Path::new(&args.out).join(&filename);
    std::fs::write(&path, bytes)?;
    println!("wrote {}", path.display());
    Ok(())
}

/// Well-known public DHT bootstrap nodes.
fn default_bootstrap_nodes() -> Vec<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;
    [
        "router.utorrent.com:6881",
        "router.bittorrent.com:6881",
        "dht.transmissionbt.com:6881",
    ]
    .iter()
    .filter_map(|host| host.to_socket_addrs().ok()?.next())
    .collect()
}
